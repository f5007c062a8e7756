use std::sync::Arc;

use crate::codec::Codec;
use crate::directory::Directory;
use crate::error::Error;
use crate::meta::IndexMeta;
use crate::segment_reader::SegmentReader;

/// Point-in-time view of the last committed state of an index.
pub struct IndexReader {
    meta: IndexMeta,
    segments: Vec<Arc<SegmentReader>>,
}

impl IndexReader {
    pub fn open(dir: &dyn Directory, codec: &dyn Codec) -> Result<IndexReader, Error> {
        let reader = codec.index_meta_reader();
        let filename = match reader.last_segments_file(dir)? {
            Some(filename) => filename,
            None => return Err(Error::IndexNotFound),
        };
        let meta = reader.read(dir, &filename)?;
        IndexReader::from_meta(dir, codec, meta)
    }

    pub fn from_meta(
        dir: &dyn Directory,
        codec: &dyn Codec,
        meta: IndexMeta,
    ) -> Result<IndexReader, Error> {
        let segments = meta
            .segments
            .iter()
            .map(|s| SegmentReader::open(dir, codec, &s.meta).map(Arc::new))
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(IndexReader { meta, segments })
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn segments(&self) -> &[Arc<SegmentReader>] {
        &self.segments
    }

    pub fn docs_count(&self) -> u64 {
        self.meta.docs_count()
    }

    pub fn live_docs_count(&self) -> u64 {
        self.meta.live_docs_count()
    }
}
