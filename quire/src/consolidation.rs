use std::collections::BTreeSet;
use std::collections::HashSet;
use std::collections::VecDeque;

use crate::error::Error;
use crate::meta::{IndexMeta, IndexSegment};
use crate::readers_cache::ReadersCache;

/// Names of the segments some consolidation is already working on.
pub type ConsolidatingSegments = HashSet<String>;

/// Picks the segments to merge into one.
pub trait ConsolidationPolicy: Send + Sync {
    fn select(
        &self,
        meta: &IndexMeta,
        consolidating: &ConsolidatingSegments,
        readers: &ReadersCache,
    ) -> Result<BTreeSet<String>, Error>;
}

impl<F> ConsolidationPolicy for F
where
    F: Fn(&IndexMeta, &ConsolidatingSegments, &ReadersCache) -> Result<BTreeSet<String>, Error>
        + Send
        + Sync,
{
    fn select(
        &self,
        meta: &IndexMeta,
        consolidating: &ConsolidatingSegments,
        readers: &ReadersCache,
    ) -> Result<BTreeSet<String>, Error> {
        self(meta, consolidating, readers)
    }
}

fn available<'a>(
    meta: &'a IndexMeta,
    consolidating: &'a ConsolidatingSegments,
) -> impl Iterator<Item = &'a IndexSegment> + 'a {
    meta.segments
        .iter()
        .filter(move |s| !consolidating.contains(&s.meta.name))
}

/// Every segment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsolidateAll;

impl ConsolidationPolicy for ConsolidateAll {
    fn select(
        &self,
        meta: &IndexMeta,
        consolidating: &ConsolidatingSegments,
        _readers: &ReadersCache,
    ) -> Result<BTreeSet<String>, Error> {
        Ok(available(meta, consolidating)
            .map(|s| s.meta.name.clone())
            .collect())
    }
}

/// Segments holding at most `threshold` times the average number of documents per segment.
#[derive(Clone, Copy, Debug)]
pub struct ConsolidateCount {
    pub threshold: f64,
}

impl ConsolidationPolicy for ConsolidateCount {
    fn select(
        &self,
        meta: &IndexMeta,
        consolidating: &ConsolidatingSegments,
        _readers: &ReadersCache,
    ) -> Result<BTreeSet<String>, Error> {
        let segments: Vec<&IndexSegment> = available(meta, consolidating).collect();
        if segments.is_empty() {
            return Ok(BTreeSet::new());
        }
        let docs: u64 = segments.iter().map(|s| s.meta.docs_count).sum();
        let limit = self.threshold * docs as f64 / segments.len() as f64;
        Ok(segments
            .into_iter()
            .filter(|s| s.meta.docs_count as f64 <= limit)
            .map(|s| s.meta.name.clone())
            .collect())
    }
}

/// Segments whose share of live documents is at most `threshold`.
#[derive(Clone, Copy, Debug)]
pub struct ConsolidateDocsLive {
    pub threshold: f64,
}

impl ConsolidationPolicy for ConsolidateDocsLive {
    fn select(
        &self,
        meta: &IndexMeta,
        consolidating: &ConsolidatingSegments,
        _readers: &ReadersCache,
    ) -> Result<BTreeSet<String>, Error> {
        Ok(available(meta, consolidating)
            .filter(|s| {
                s.meta.docs_count > 0
                    && s.meta.live_docs_count as f64 / s.meta.docs_count as f64 <= self.threshold
            })
            .map(|s| s.meta.name.clone())
            .collect())
    }
}

/// Size tiers: segments are grouped, largest first, with every segment of a tier holding more
/// than `ratio` times the documents of the tier's largest one. The first tier with at least
/// `min_segments` segments is selected.
#[derive(Clone, Copy, Debug)]
pub struct ConsolidateTier {
    pub ratio: f64,
    pub min_segments: usize,
}

impl Default for ConsolidateTier {
    fn default() -> ConsolidateTier {
        ConsolidateTier {
            ratio: 0.6,
            min_segments: 10,
        }
    }
}

impl ConsolidationPolicy for ConsolidateTier {
    fn select(
        &self,
        meta: &IndexMeta,
        consolidating: &ConsolidatingSegments,
        _readers: &ReadersCache,
    ) -> Result<BTreeSet<String>, Error> {
        let mut segments: Vec<&IndexSegment> = available(meta, consolidating).collect();
        segments.sort_by(|a, b| a.meta.live_docs_count.cmp(&b.meta.live_docs_count).reverse());
        let mut queue = VecDeque::from(segments);
        while let Some(first) = queue.pop_front() {
            let mut stage = vec![first];
            while let Some(next) = queue.pop_front() {
                if next.meta.live_docs_count as f64
                    > first.meta.live_docs_count as f64 * self.ratio
                {
                    stage.push(next);
                } else {
                    queue.push_front(next);
                    break;
                }
            }
            if stage.len() >= self.min_segments {
                return Ok(stage.into_iter().map(|s| s.meta.name.clone()).collect());
            }
        }
        Ok(BTreeSet::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DefaultCodec;
    use crate::directory::MemoryDirectory;
    use crate::meta::SegmentMeta;
    use std::sync::Arc;

    fn index(docs: &[(u64, u64)]) -> IndexMeta {
        let segments = docs
            .iter()
            .enumerate()
            .map(|(i, &(docs, live))| {
                let mut meta = SegmentMeta::new(format!("_{}", i + 1), "test");
                meta.docs_count = docs;
                meta.live_docs_count = live;
                IndexSegment {
                    filename: format!("_{}.0.sm", i + 1),
                    meta,
                }
            })
            .collect();
        IndexMeta {
            segments,
            ..IndexMeta::default()
        }
    }

    fn select(policy: &dyn ConsolidationPolicy, meta: &IndexMeta, busy: &[&str]) -> Vec<String> {
        let cache = ReadersCache::new(Arc::new(MemoryDirectory::new()), Arc::new(DefaultCodec));
        let busy = busy.iter().map(|s| s.to_string()).collect();
        policy
            .select(meta, &busy, &cache)
            .unwrap()
            .into_iter()
            .collect()
    }

    #[test]
    fn all_skips_busy_segments() {
        let meta = index(&[(3, 3), (2, 2), (1, 1)]);
        assert_eq!(vec!["_1", "_3"], select(&ConsolidateAll, &meta, &["_2"]));
    }

    #[test]
    fn count_threshold() {
        let meta = index(&[(10, 10), (10, 10), (1, 1)]);
        assert_eq!(3, select(&ConsolidateCount { threshold: 1.5 }, &meta, &[]).len());
        assert_eq!(vec!["_3"], select(&ConsolidateCount { threshold: 0.5 }, &meta, &[]));
        assert!(select(&ConsolidateCount { threshold: 0.0 }, &meta, &[]).is_empty());
    }

    #[test]
    fn docs_live_threshold() {
        let meta = index(&[(10, 10), (10, 4), (4, 0)]);
        assert_eq!(vec!["_2", "_3"], select(&ConsolidateDocsLive { threshold: 0.5 }, &meta, &[]));
    }

    #[test]
    fn tier_groups_similar_sizes() {
        let mut docs = vec![(1000, 1000)];
        docs.extend((0..4).map(|i| (100 + i, 100 + i)));
        docs.push((10, 10));
        let meta = index(&docs);
        let tier = ConsolidateTier {
            ratio: 0.6,
            min_segments: 3,
        };
        assert_eq!(vec!["_2", "_3", "_4", "_5"], select(&tier, &meta, &[]));
        assert!(select(&ConsolidateTier::default(), &meta, &[]).is_empty());
    }

    #[test]
    fn closures_are_policies() {
        let meta = index(&[(1, 1), (2, 2)]);
        let first = |meta: &IndexMeta,
                     _: &ConsolidatingSegments,
                     _: &ReadersCache|
         -> Result<BTreeSet<String>, Error> {
            Ok(meta.segments.iter().take(1).map(|s| s.meta.name.clone()).collect())
        };
        assert_eq!(vec!["_1"], select(&first, &meta, &[]));
    }
}
