use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::format::{decompress_page, row_from_columns, Footer, TAIL_LEN, FOOTER_MAGIC};
use crate::storage::StorageBackend;
use crate::ParqueError;

/// Ranged-read random-access reader. Opens by reading the fixed tail and
/// the footer; row groups load on demand, never the whole file.
pub struct ColumnarReader {
    storage: Arc<dyn StorageBackend>,
    path: String,
    footer: Footer,
}

impl std::fmt::Debug for ColumnarReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnarReader")
            .field("path", &self.path)
            .field("footer", &self.footer)
            .finish()
    }
}

impl ColumnarReader {
    pub async fn open(
        storage: Arc<dyn StorageBackend>,
        path: impl Into<String>,
    ) -> Result<Self, ParqueError> {
        let path = path.into();
        let size = storage.stat(&path).await?.size;
        if size < TAIL_LEN + FOOTER_MAGIC.len() as u64 {
            return Err(ParqueError::fatal(format!(
                "columnar file too short: {path}"
            )));
        }

        let tail = storage.read_range(&path, size - TAIL_LEN, TAIL_LEN).await?;
        if tail.len() != TAIL_LEN as usize || &tail[4..8] != FOOTER_MAGIC {
            return Err(ParqueError::fatal(format!(
                "columnar footer magic missing: {path}"
            )));
        }
        let footer_len = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]) as u64;
        if footer_len + TAIL_LEN > size {
            return Err(ParqueError::fatal(format!(
                "columnar footer length out of bounds: {path}"
            )));
        }

        let footer_bytes = storage
            .read_range(&path, size - TAIL_LEN - footer_len, footer_len)
            .await?;
        let footer: Footer = serde_json::from_slice(&footer_bytes)
            .map_err(|error| ParqueError::fatal(format!("columnar footer parse: {error}")))?;

        Ok(Self {
            storage,
            path,
            footer,
        })
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>, ParqueError> {
        self.storage.read_range(&self.path, offset, len).await
    }

    /// Loads one row group, materializing only the projected columns.
    /// `projection: None` loads every schema column.
    pub async fn read_row_group(
        &self,
        index: usize,
        projection: Option<&[String]>,
    ) -> Result<Vec<JsonValue>, ParqueError> {
        let group = self.footer.row_groups.get(index).ok_or_else(|| {
            ParqueError::invariant(format!(
                "row group {index} out of range for {}",
                self.path
            ))
        })?;

        let wanted: Vec<String> = match projection {
            Some(names) => names.to_vec(),
            None => self.footer.schema.column_names(),
        };

        let mut columns: Vec<(String, Vec<JsonValue>)> = Vec::with_capacity(wanted.len());
        for name in &wanted {
            let Some(chunk) = group.column(name) else {
                // Unknown columns project as nulls.
                columns.push((name.clone(), Vec::new()));
                continue;
            };
            let compressed = self
                .storage
                .read_range(&self.path, chunk.offset, chunk.compressed_size)
                .await?;
            let bytes = decompress_page(&compressed, self.footer.compression)?;
            let values: Vec<JsonValue> = rmp_serde::from_slice(&bytes)
                .map_err(|error| ParqueError::fatal(format!("page decode: {error}")))?;
            columns.push((name.clone(), values));
        }

        let rows = (0..group.row_count as usize)
            .map(|row_index| row_from_columns(&columns, row_index))
            .collect();
        Ok(rows)
    }
}
