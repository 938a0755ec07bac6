use serde_json::Value as JsonValue;

use super::format::{
    column_value, compress_page, ColumnChunkMeta, ColumnStats, Compression, FileSchema, Footer,
    RowGroupMeta, FOOTER_MAGIC, PAGE_ENCODING,
};
use crate::filter::compare_ordered;
use crate::storage::StorageBackend;
use crate::ParqueError;

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub row_group_size: usize,
    pub compression: Compression,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            row_group_size: 1_000,
            compression: Compression::default(),
        }
    }
}

/// Writes rows as a self-describing columnar file: magic, row-group column
/// pages, JSON footer, footer length, magic. The write lands atomically
/// through the backend's `write`.
pub async fn write_columnar(
    storage: &dyn StorageBackend,
    path: &str,
    rows: &[JsonValue],
    schema: &FileSchema,
    options: &WriteOptions,
) -> Result<Footer, ParqueError> {
    if options.row_group_size == 0 {
        return Err(ParqueError::invariant("row_group_size must be positive"));
    }

    let mut buffer: Vec<u8> = Vec::new();
    buffer.extend_from_slice(FOOTER_MAGIC);

    let mut row_groups = Vec::new();
    for (index, group_rows) in rows.chunks(options.row_group_size).enumerate() {
        let mut columns = Vec::with_capacity(schema.columns.len());
        for column in &schema.columns {
            let values: Vec<JsonValue> = group_rows
                .iter()
                .map(|row| column_value(row, &column.name))
                .collect();

            let stats = column_stats(&values, column.column_type.is_orderable());
            let encoded = rmp_serde::to_vec(&values)
                .map_err(|error| ParqueError::fatal(format!("page encode: {error}")))?;
            let compressed = compress_page(&encoded, options.compression)?;

            columns.push(ColumnChunkMeta {
                name: column.name.clone(),
                offset: buffer.len() as u64,
                compressed_size: compressed.len() as u64,
                uncompressed_size: encoded.len() as u64,
                encoding: PAGE_ENCODING.to_string(),
                dictionary: false,
                stats,
            });
            buffer.extend_from_slice(&compressed);
        }

        row_groups.push(RowGroupMeta {
            index,
            row_count: group_rows.len() as u64,
            columns,
        });
    }

    let footer = Footer {
        version: 1,
        schema: schema.clone(),
        compression: options.compression,
        row_groups,
    };

    let footer_bytes = serde_json::to_vec(&footer)?;
    buffer.extend_from_slice(&footer_bytes);
    buffer.extend_from_slice(&(footer_bytes.len() as u32).to_le_bytes());
    buffer.extend_from_slice(FOOTER_MAGIC);

    storage.write(path, &buffer).await?;
    Ok(footer)
}

/// Exact min/max over non-null values. Bounds are dropped entirely when a
/// chunk mixes incomparable kinds, so recorded statistics are always true
/// bounds for every included row.
fn column_stats(values: &[JsonValue], orderable: bool) -> ColumnStats {
    let null_count = values.iter().filter(|value| value.is_null()).count() as u64;
    if !orderable {
        return ColumnStats {
            min: None,
            max: None,
            null_count,
        };
    }

    let mut min: Option<&JsonValue> = None;
    let mut max: Option<&JsonValue> = None;
    for value in values.iter().filter(|value| !value.is_null()) {
        match min {
            None => {
                min = Some(value);
                max = Some(value);
            }
            Some(current_min) => {
                let Some(max_value) = max else { break };
                let Some(cmp_min) = compare_ordered(value, current_min) else {
                    min = None;
                    max = None;
                    break;
                };
                let Some(cmp_max) = compare_ordered(value, max_value) else {
                    min = None;
                    max = None;
                    break;
                };
                if cmp_min.is_lt() {
                    min = Some(value);
                }
                if cmp_max.is_gt() {
                    max = Some(value);
                }
            }
        }
    }

    ColumnStats {
        min: min.cloned(),
        max: max.cloned(),
        null_count,
    }
}
