use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::filter::{get_path, set_path};
use crate::ParqueError;

/// File magic, written at offset 0 and again directly after the footer
/// length so the footer can be located from the tail of the file.
pub const FOOTER_MAGIC: &[u8; 4] = b"PQD1";

/// Length of the fixed tail: footer byte length (u32 LE) + magic.
pub const TAIL_LEN: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
    Timestamp,
    /// Opaque bytes (MessagePack-encoded variant blobs land here).
    Binary,
    /// Arbitrary JSON values; no statistics, no pushdown.
    Variant,
}

impl ColumnType {
    /// Whether min/max statistics are defined for this column type.
    pub fn is_orderable(self) -> bool {
        matches!(self, Self::String | Self::Number | Self::Boolean | Self::Timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSchema {
    pub columns: Vec<ColumnDef>,
}

impl FileSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Default for Compression {
    fn default() -> Self {
        Self::Gzip
    }
}

/// Exact bounds over the non-null values of one column chunk. `None`
/// min/max means the column is not orderable or every value was null.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ColumnStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<JsonValue>,
    pub null_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnChunkMeta {
    pub name: String,
    pub offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub encoding: String,
    pub dictionary: bool,
    pub stats: ColumnStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowGroupMeta {
    pub index: usize,
    pub row_count: u64,
    pub columns: Vec<ColumnChunkMeta>,
}

impl RowGroupMeta {
    pub fn column(&self, name: &str) -> Option<&ColumnChunkMeta> {
        self.columns.iter().find(|column| column.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Footer {
    pub version: u32,
    pub schema: FileSchema,
    pub compression: Compression,
    pub row_groups: Vec<RowGroupMeta>,
}

impl Footer {
    pub fn total_rows(&self) -> u64 {
        self.row_groups.iter().map(|group| group.row_count).sum()
    }
}

pub(crate) const PAGE_ENCODING: &str = "msgpack";

pub(crate) fn compress_page(bytes: &[u8], compression: Compression) -> Result<Vec<u8>, ParqueError> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Gzip => {
            use flate2::write::GzEncoder;
            use std::io::Write;
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(bytes).map_err(ParqueError::from)?;
            encoder.finish().map_err(ParqueError::from)
        }
        Compression::Zstd => {
            zstd::encode_all(bytes, 0).map_err(ParqueError::from)
        }
    }
}

pub(crate) fn decompress_page(
    bytes: &[u8],
    compression: Compression,
) -> Result<Vec<u8>, ParqueError> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Gzip => {
            use flate2::read::GzDecoder;
            use std::io::Read;
            let mut decoder = GzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(ParqueError::from)?;
            Ok(out)
        }
        Compression::Zstd => zstd::decode_all(bytes).map_err(ParqueError::from),
    }
}

/// Extracts a column value from a row document. Dotted column names
/// project nested fields.
pub(crate) fn column_value(row: &JsonValue, column: &str) -> JsonValue {
    get_path(row, column).cloned().unwrap_or(JsonValue::Null)
}

/// Reassembles a row object from projected column vectors.
pub(crate) fn row_from_columns(
    columns: &[(String, Vec<JsonValue>)],
    row_index: usize,
) -> JsonValue {
    let mut row = JsonValue::Object(serde_json::Map::new());
    for (name, values) in columns {
        let value = values.get(row_index).cloned().unwrap_or(JsonValue::Null);
        if value.is_null() {
            continue;
        }
        set_path(&mut row, name, value);
    }
    row
}
