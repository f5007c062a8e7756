use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::codec::Codec;
use crate::directory::Directory;
use crate::error::Error;
use crate::meta::{SegmentKey, SegmentMeta};
use crate::segment_reader::SegmentReader;

/// Opened segment readers, one per segment name, for the version last asked for.
pub struct ReadersCache {
    dir: Arc<dyn Directory>,
    codec: Arc<dyn Codec>,
    readers: Mutex<HashMap<String, Arc<SegmentReader>>>,
}

impl ReadersCache {
    pub fn new(dir: Arc<dyn Directory>, codec: Arc<dyn Codec>) -> ReadersCache {
        ReadersCache {
            dir,
            codec,
            readers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the reader for `meta`, opening it if the cached one is missing or of another
    /// version.
    pub fn emplace(&self, meta: &SegmentMeta) -> Result<Arc<SegmentReader>, Error> {
        let mut readers = self.readers.lock();
        let reader = match readers.get(&meta.name) {
            Some(cached) if cached.meta().version == meta.version => return Ok(cached.clone()),
            Some(stale) => {
                trace!(segment = %meta.name, version = meta.version, "reopening segment");
                stale.reopen(self.dir.as_ref(), self.codec.as_ref(), meta)?
            }
            None => SegmentReader::open(self.dir.as_ref(), self.codec.as_ref(), meta)?,
        };
        let reader = Arc::new(reader);
        readers.insert(meta.name.clone(), reader.clone());
        Ok(reader)
    }

    /// Evicts the readers of the given segment versions.
    pub fn purge(&self, keys: &HashSet<SegmentKey>) {
        self.readers.lock().retain(|name, reader| {
            !keys.contains(&SegmentKey {
                name: name.clone(),
                version: reader.meta().version,
            })
        });
    }

    pub fn clear(&self) {
        self.readers.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.readers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DefaultCodec;
    use crate::directory::MemoryDirectory;
    use crate::doc_mask::DocumentMask;
    use crate::meta::IndexFeatures;
    use crate::segment_writer::{SegmentWriter, UpdateContext};

    fn segment(dir: &MemoryDirectory, name: &str) -> SegmentMeta {
        let mut writer = SegmentWriter::new(name);
        for _ in 0..2 {
            writer.begin(UpdateContext::default(), 0);
            writer.index("f", IndexFeatures::NONE, vec!["v"]).unwrap();
            writer.commit();
        }
        writer.flush(dir, &DefaultCodec).unwrap().unwrap().segment.meta
    }

    #[test]
    fn caches_by_name_and_version() {
        let dir = MemoryDirectory::new();
        let cache = ReadersCache::new(Arc::new(dir.clone()), Arc::new(DefaultCodec));
        let mut meta = segment(&dir, "_1");
        let first = cache.emplace(&meta).unwrap();
        assert!(Arc::ptr_eq(&first, &cache.emplace(&meta).unwrap()));

        meta.version += 1;
        meta.live_docs_count -= 1;
        let mut mask = DocumentMask::new();
        mask.insert(1);
        let file = DefaultCodec
            .document_mask_writer()
            .write(&dir, &meta, &mask)
            .unwrap();
        meta.files.insert(file);
        let second = cache.emplace(&meta).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_live(1));
        assert!(first.is_live(1));
        assert_eq!(1, cache.len());

        cache.purge(&vec![first.meta().key()].into_iter().collect());
        assert_eq!(1, cache.len());
        cache.purge(&vec![meta.key()].into_iter().collect());
        assert!(cache.is_empty());
    }

    #[test]
    fn purge_only_touches_given_segments() {
        let dir = MemoryDirectory::new();
        let cache = ReadersCache::new(Arc::new(dir.clone()), Arc::new(DefaultCodec));
        let a = segment(&dir, "_1");
        let b = segment(&dir, "_2");
        cache.emplace(&a).unwrap();
        cache.emplace(&b).unwrap();
        cache.purge(&vec![a.key()].into_iter().collect());
        assert_eq!(1, cache.len());
        cache.clear();
        assert!(cache.is_empty());
    }
}
