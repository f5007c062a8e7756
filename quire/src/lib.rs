extern crate rmp_serde as rmps;

#[macro_use]
extern crate serde_derive;

#[cfg(test)]
#[macro_use]
extern crate proptest;

pub mod analyzis;
pub mod codec;
pub mod columnstore;
pub mod comparator;
pub mod consolidation;
pub mod directory;
pub mod doc;
pub mod doc_iter;
pub mod doc_mask;
pub mod error;
pub mod filter;
mod flush_context;
pub mod index_reader;
pub mod index_writer;
pub mod merge_writer;
pub mod meta;
pub mod postings;
pub mod readers_cache;
mod segment_pool;
pub mod segment_reader;
pub mod segment_writer;
mod util;

pub use error::{Error, Result};

pub type DocId = u32;

/// First valid document id of a segment.
pub const DOC_ID_MIN: DocId = 1;
/// Last addressable document id of a segment.
pub const DOC_ID_MAX: DocId = ::std::u32::MAX - 1;
/// Marks an exhausted document iterator.
pub const DOC_ID_EOF: DocId = ::std::u32::MAX;

pub use codec::{Codec, DefaultCodec};
pub use directory::{Directory, FsDirectory, MemoryDirectory};
pub use doc::{Doc, Field, FieldValue};
pub use filter::Filter;
pub use index_reader::IndexReader;
pub use index_writer::{
    ConsolidationResult, ConsolidationStatus, Document, Documents, IndexWriter,
    IndexWriterBuilder, OpenMode, SegmentLimits,
};
pub use meta::{IndexFeatures, IndexMeta, SegmentMeta};
