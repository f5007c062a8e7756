use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;

use crate::error::Error;

/// What is recorded for every term occurrence of an indexed field.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct IndexFeatures {
    pub freq: bool,
    pub positions: bool,
}

impl IndexFeatures {
    pub const NONE: IndexFeatures = IndexFeatures {
        freq: false,
        positions: false,
    };
    pub const FREQ: IndexFeatures = IndexFeatures {
        freq: true,
        positions: false,
    };
    pub const ALL: IndexFeatures = IndexFeatures {
        freq: true,
        positions: true,
    };
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FieldMeta {
    pub name: String,
    pub features: IndexFeatures,
}

impl FieldMeta {
    pub fn new<N: Into<String>>(name: N, features: IndexFeatures) -> FieldMeta {
        FieldMeta {
            name: name.into(),
            features,
        }
    }
}

/// Unions field metas by name, failing if two of them disagree on the features.
pub fn union_fields<'a, I>(fields: I) -> Result<Vec<FieldMeta>, Error>
where
    I: IntoIterator<Item = &'a FieldMeta>,
{
    let mut union: BTreeMap<&'a str, &'a FieldMeta> = BTreeMap::new();
    for field in fields {
        if let Some(existing) = union.get(field.name.as_str()) {
            if existing.features != field.features {
                return Err(Error::FieldFeaturesMismatch {
                    field: field.name.clone(),
                });
            }
            continue;
        }
        union.insert(&field.name, field);
    }
    Ok(union.values().map(|f| (*f).clone()).collect())
}

/// Identifies one version of a segment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey {
    pub name: String,
    pub version: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SegmentMeta {
    pub name: String,
    pub version: u64,
    pub docs_count: u64,
    pub live_docs_count: u64,
    pub files: BTreeSet<String>,
    pub sort: Option<String>,
    pub codec: String,
    pub size: u64,
    pub fields: Vec<FieldMeta>,
}

impl SegmentMeta {
    pub fn new<N: Into<String>, C: Into<String>>(name: N, codec: C) -> SegmentMeta {
        SegmentMeta {
            name: name.into(),
            version: 0,
            docs_count: 0,
            live_docs_count: 0,
            files: BTreeSet::new(),
            sort: None,
            codec: codec.into(),
            size: 0,
            fields: Vec::new(),
        }
    }

    pub fn key(&self) -> SegmentKey {
        SegmentKey {
            name: self.name.clone(),
            version: self.version,
        }
    }

    pub fn has_deletions(&self) -> bool {
        self.live_docs_count < self.docs_count
    }
}

/// A segment as referenced from an index state: its meta and the file the meta lives in.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IndexSegment {
    pub filename: String,
    pub meta: SegmentMeta,
}

impl IndexSegment {
    pub fn files<'a>(&'a self) -> impl Iterator<Item = &'a String> + 'a {
        self.meta.files.iter().chain(::std::iter::once(&self.filename))
    }
}

/// The index state: an ordered list of segments plus the counters a commit advances.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexMeta {
    /// Generation of the commit this state was read from or will be written as. 0 until the
    /// first commit.
    pub generation: u64,
    pub segment_counter: u64,
    pub segments: Vec<IndexSegment>,
    pub payload: Option<Vec<u8>>,
}

impl IndexMeta {
    pub fn next_generation(&self) -> u64 {
        self.generation + 1
    }

    pub fn docs_count(&self) -> u64 {
        self.segments.iter().map(|s| s.meta.docs_count).sum()
    }

    pub fn live_docs_count(&self) -> u64 {
        self.segments.iter().map(|s| s.meta.live_docs_count).sum()
    }

    pub fn segment(&self, name: &str) -> Option<&IndexSegment> {
        self.segments.iter().find(|s| s.meta.name == name)
    }

    pub fn segment_names(&self) -> Vec<&str> {
        self.segments.iter().map(|s| s.meta.name.as_str()).collect()
    }

    /// Every file referenced by the segments of this state.
    pub fn files(&self) -> HashSet<String> {
        self.segments
            .iter()
            .flat_map(|s| s.files())
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> HashSet<SegmentKey> {
        self.segments.iter().map(|s| s.meta.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(name: &str, docs: u64, live: u64) -> IndexSegment {
        let mut meta = SegmentMeta::new(name, "test");
        meta.docs_count = docs;
        meta.live_docs_count = live;
        meta.files.insert(format!("{}.doc", name));
        IndexSegment {
            filename: format!("{}.0.sm", name),
            meta,
        }
    }

    #[test]
    fn counts_docs_over_segments() {
        let meta = IndexMeta {
            generation: 3,
            segment_counter: 2,
            segments: vec![segment("_1", 3, 2), segment("_2", 5, 5)],
            payload: None,
        };
        assert_eq!(8, meta.docs_count());
        assert_eq!(7, meta.live_docs_count());
        assert_eq!(4, meta.next_generation());
        assert!(meta.segment("_2").is_some());
        assert!(meta.files().contains("_1.0.sm"));
        assert!(meta.files().contains("_2.doc"));
    }

    #[test]
    fn union_rejects_conflicting_features() {
        let a = FieldMeta::new("body", IndexFeatures::ALL);
        let b = FieldMeta::new("body", IndexFeatures::NONE);
        let c = FieldMeta::new("id", IndexFeatures::NONE);
        assert_eq!(2, union_fields(vec![&a, &c, &a]).unwrap().len());
        match union_fields(vec![&a, &b]) {
            Err(Error::FieldFeaturesMismatch { field }) => assert_eq!("body", field),
            other => panic!("unexpected {:?}", other),
        }
    }
}
