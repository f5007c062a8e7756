use std::path::Path;
use std::sync::Arc;

use quire::index_writer::{IndexWriter, IndexWriterBuilder, OpenMode};
use quire::{DefaultCodec, Error, FsDirectory};
use tracing::Level;

pub mod delete;
pub mod force_merge;
pub mod index;
pub mod segments;

/// Logs to standard error, at debug level if `verbose`.
pub fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

pub fn open_writer<P: AsRef<Path>>(
    path: P,
    builder: IndexWriterBuilder,
    mode: OpenMode,
) -> Result<IndexWriter, Error> {
    let dir = FsDirectory::open(path)?;
    builder.open(Arc::new(dir), Arc::new(DefaultCodec), mode)
}
