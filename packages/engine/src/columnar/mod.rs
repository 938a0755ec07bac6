mod format;
mod reader;
mod scan;
mod writer;

pub use format::{
    ColumnChunkMeta, ColumnDef, ColumnStats, ColumnType, Compression, FileSchema, Footer,
    RowGroupMeta, FOOTER_MAGIC,
};
pub use reader::ColumnarReader;
pub use scan::{scan, Scan, ScanOptions, ScanStats, SortKey, SortOrder};
pub(crate) use scan::sort_rows;
pub use writer::{write_columnar, WriteOptions};
