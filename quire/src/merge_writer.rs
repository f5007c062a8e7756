use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::collections::BinaryHeap;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::codec::{Codec, Posting, Terms};
use crate::comparator::{compare_docs, Comparator};
use crate::directory::{remove_segment_files, Directory};
use crate::error::Error;
use crate::meta::{union_fields, FieldMeta, IndexSegment, SegmentMeta};
use crate::segment_reader::SegmentReader;
use crate::segment_writer::SORT_COLUMN;
use crate::{DocId, DOC_ID_MIN};

/// Documents, terms or column values processed between two progress checks.
const PROGRESS_STEP: usize = 1024;

/// Called during a merge. Returning `false` cancels it.
pub type Progress<'a> = dyn FnMut() -> bool + 'a;

enum DocMap {
    /// Input without deletions: the new id is the old one shifted by `base`.
    Offset { base: DocId, docs: DocId },
    /// `table[old]` is the new id, 0 if the document is dropped.
    Table(Vec<DocId>),
}

impl DocMap {
    fn map(&self, old: DocId) -> Option<DocId> {
        match *self {
            DocMap::Offset { base, docs } => {
                if old >= DOC_ID_MIN && old <= docs {
                    Some(base + old)
                } else {
                    None
                }
            }
            DocMap::Table(ref table) => match table.get(old as usize) {
                Some(&new) if new != 0 => Some(new),
                _ => None,
            },
        }
    }
}

/// A segment written by `MergeWriter::flush`.
pub struct MergedSegment {
    pub segment: IndexSegment,
    doc_maps: Vec<DocMap>,
}

impl MergedSegment {
    pub fn meta(&self) -> &SegmentMeta {
        &self.segment.meta
    }

    /// New id of document `old` of the `input`-th merged reader, `None` if it was dropped.
    pub fn doc_map(&self, input: usize, old: DocId) -> Option<DocId> {
        self.doc_maps.get(input).and_then(|map| map.map(old))
    }
}

struct Ticker<'p, 'a> {
    progress: &'p mut Progress<'a>,
    count: usize,
}

impl<'p, 'a> Ticker<'p, 'a> {
    fn check(&mut self) -> Result<(), Error> {
        if (self.progress)() {
            Ok(())
        } else {
            Err(Error::MergeAborted)
        }
    }

    fn tick(&mut self, n: usize) -> Result<(), Error> {
        let before = self.count / PROGRESS_STEP;
        self.count += n;
        if self.count / PROGRESS_STEP != before {
            self.check()
        } else {
            Ok(())
        }
    }
}

/// Combines the live documents of several segments into a new one.
pub struct MergeWriter<'a> {
    dir: &'a dyn Directory,
    codec: &'a dyn Codec,
    comparator: Option<&'a dyn Comparator>,
    readers: Vec<Arc<SegmentReader>>,
}

impl<'a> MergeWriter<'a> {
    pub fn new(
        dir: &'a dyn Directory,
        codec: &'a dyn Codec,
        comparator: Option<&'a dyn Comparator>,
    ) -> MergeWriter<'a> {
        MergeWriter {
            dir,
            codec,
            comparator,
            readers: Vec::new(),
        }
    }

    pub fn add(&mut self, reader: Arc<SegmentReader>) {
        self.readers.push(reader);
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    fn offset_maps(&self) -> Vec<DocMap> {
        let mut bases = Vec::with_capacity(self.readers.len());
        let mut base: DocId = 0;
        for reader in &self.readers {
            bases.push(base);
            base += reader.docs_count() as DocId - reader.mask().len();
        }
        self.readers
            .par_iter()
            .zip(bases.into_par_iter())
            .map(|(reader, base)| {
                let docs = reader.docs_count() as DocId;
                if reader.mask().is_empty() {
                    DocMap::Offset { base, docs }
                } else {
                    let mut table = vec![0; docs as usize + 1];
                    let mut next = base;
                    for doc in reader.live_docs() {
                        next += 1;
                        table[doc as usize] = next;
                    }
                    DocMap::Table(table)
                }
            })
            .collect()
    }

    fn sorted_maps(&self, comparator: &dyn Comparator) -> Vec<DocMap> {
        let mut keyed: Vec<((usize, DocId), Option<&[u8]>)> = self
            .readers
            .par_iter()
            .enumerate()
            .flat_map_iter(|(input, reader)| {
                let sort = reader.column(SORT_COLUMN);
                reader
                    .live_docs()
                    .map(move |doc| ((input, doc), sort.and_then(|c| c.get(doc))))
                    .collect::<Vec<_>>()
            })
            .collect();
        keyed.par_sort_by(|l, r| compare_docs(comparator, l, r));
        let mut maps: Vec<Vec<DocId>> = self
            .readers
            .iter()
            .map(|r| vec![0; r.docs_count() as usize + 1])
            .collect();
        for (i, &((input, old), _)) in keyed.iter().enumerate() {
            maps[input][old as usize] = i as DocId + DOC_ID_MIN;
        }
        maps.into_iter().map(DocMap::Table).collect()
    }

    /// Writes the merged segment `name`. On failure nothing is left behind under that name.
    pub fn flush(&self, name: &str, progress: &mut Progress) -> Result<MergedSegment, Error> {
        let mut ticker = Ticker { progress, count: 0 };
        ticker.check()?;
        let fields = union_fields(self.readers.iter().flat_map(|r| r.meta().fields.iter()))?;
        let doc_maps = match self.comparator {
            Some(comparator) => self.sorted_maps(comparator),
            None => self.offset_maps(),
        };
        let docs_count: u64 = self
            .readers
            .iter()
            .map(|r| r.docs_count() - u64::from(r.mask().len()))
            .sum();
        ticker.tick(docs_count as usize)?;
        ticker.check()?;

        let mut field_writer = self.codec.field_writer();
        let mut column_writer = self.codec.columnstore_writer();
        let mut files = Vec::new();
        let written = self.write_data(
            name,
            &fields,
            &doc_maps,
            &mut ticker,
            &mut *field_writer,
            &mut *column_writer,
            &mut files,
        );
        if let Err(e) = written {
            field_writer.rollback(self.dir);
            column_writer.rollback(self.dir);
            remove_segment_files(self.dir, name);
            debug!(segment = %name, error = %e, "merge failed");
            return Err(e);
        }

        let mut meta = SegmentMeta::new(name, self.codec.name());
        meta.docs_count = docs_count;
        meta.live_docs_count = docs_count;
        meta.sort = self.comparator.map(|c| c.name().to_string());
        meta.fields = fields;
        meta.files.extend(files);
        let stored = (|| -> Result<String, Error> {
            let mut size = 0;
            for file in &meta.files {
                size += self.dir.length(file)?;
            }
            meta.size = size;
            self.codec.segment_meta_writer().write(self.dir, &meta)
        })();
        let filename = match stored {
            Ok(filename) => filename,
            Err(e) => {
                remove_segment_files(self.dir, name);
                return Err(e);
            }
        };
        trace!(
            segment = %name,
            inputs = self.readers.len(),
            docs = docs_count,
            "merged segments"
        );
        Ok(MergedSegment {
            segment: IndexSegment { filename, meta },
            doc_maps,
        })
    }

    fn write_data(
        &self,
        name: &str,
        fields: &[FieldMeta],
        doc_maps: &[DocMap],
        ticker: &mut Ticker,
        field_writer: &mut dyn crate::codec::FieldWriter,
        column_writer: &mut dyn crate::codec::ColumnstoreWriter,
        files: &mut Vec<String>,
    ) -> Result<(), Error> {
        field_writer.prepare(self.dir, name)?;
        for field in fields {
            ticker.check()?;
            let mut terms = TermMerge::new(&self.readers, &field.name, doc_maps, ticker)?;
            field_writer.write_field(field, &mut terms)?;
        }
        files.extend(field_writer.commit()?);

        column_writer.prepare(self.dir, name)?;
        let columns: BTreeSet<&str> = self
            .readers
            .iter()
            .flat_map(|r| r.columns().map(|(name, _)| name))
            .collect();
        for column in columns {
            ticker.check()?;
            let mut values: Vec<(DocId, Vec<u8>)> = Vec::new();
            for (input, reader) in self.readers.iter().enumerate() {
                if let Some(stored) = reader.column(column) {
                    for (doc, value) in stored.iter() {
                        if let Some(new) = doc_maps[input].map(doc) {
                            values.push((new, value.to_vec()));
                        }
                        ticker.tick(1)?;
                    }
                }
            }
            values.sort_by_key(|v| v.0);
            let mut values = values.into_iter().map(Ok::<_, Error>);
            column_writer.write_column(column, &mut values)?;
        }
        files.extend(column_writer.commit()?);
        Ok(())
    }
}

/// k-way merge of the terms of one field over all inputs, translating postings to new ids.
struct TermMerge<'r, 't, 'p, 'a> {
    inputs: Vec<(usize, Box<Terms<'r>>)>,
    heads: BinaryHeap<Reverse<(Vec<u8>, usize)>>,
    postings: Vec<Vec<Posting>>,
    doc_maps: &'r [DocMap],
    ticker: &'t mut Ticker<'p, 'a>,
    failed: bool,
}

impl<'r, 't, 'p, 'a> TermMerge<'r, 't, 'p, 'a> {
    fn new(
        readers: &'r [Arc<SegmentReader>],
        field: &str,
        doc_maps: &'r [DocMap],
        ticker: &'t mut Ticker<'p, 'a>,
    ) -> Result<TermMerge<'r, 't, 'p, 'a>, Error> {
        let inputs: Vec<(usize, Box<Terms<'r>>)> = readers
            .iter()
            .enumerate()
            .filter_map(|(input, reader)| reader.field(field).map(|f| (input, f.terms())))
            .collect();
        let mut merge = TermMerge {
            postings: vec![Vec::new(); inputs.len()],
            inputs,
            heads: BinaryHeap::new(),
            doc_maps,
            ticker,
            failed: false,
        };
        for slot in 0..merge.inputs.len() {
            merge.advance(slot)?;
        }
        Ok(merge)
    }

    fn advance(&mut self, slot: usize) -> Result<(), Error> {
        if let Some(next) = self.inputs[slot].1.next() {
            let (term, postings) = next?;
            self.postings[slot] = postings;
            self.heads.push(Reverse((term, slot)));
        }
        Ok(())
    }

    /// Next term with at least one live posting.
    fn next_term(&mut self) -> Result<Option<(Vec<u8>, Vec<Posting>)>, Error> {
        loop {
            let (term, slot) = match self.heads.pop() {
                Some(Reverse(head)) => head,
                None => return Ok(None),
            };
            let mut slots = vec![slot];
            while let Some(&Reverse((ref next, next_slot))) = self.heads.peek() {
                if *next != term {
                    break;
                }
                slots.push(next_slot);
                self.heads.pop();
            }
            let mut merged = Vec::new();
            for &slot in &slots {
                let input = self.inputs[slot].0;
                let map = &self.doc_maps[input];
                for mut posting in self.postings[slot].drain(..) {
                    if let Some(new) = map.map(posting.doc) {
                        posting.doc = new;
                        merged.push(posting);
                    }
                }
            }
            for slot in slots {
                self.advance(slot)?;
            }
            self.ticker.tick(1)?;
            if merged.is_empty() {
                continue;
            }
            merged.sort_by_key(|p| p.doc);
            return Ok(Some((term, merged)));
        }
    }
}

impl<'r, 't, 'p, 'a> Iterator for TermMerge<'r, 't, 'p, 'a> {
    type Item = Result<(Vec<u8>, Vec<Posting>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_term() {
            Ok(Some(term)) => Some(Ok(term)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DefaultCodec;
    use crate::comparator::BytesComparator;
    use crate::directory::MemoryDirectory;
    use crate::meta::IndexFeatures;
    use crate::segment_writer::{SegmentWriter, UpdateContext};

    fn segment(
        dir: &MemoryDirectory,
        name: &str,
        docs: &[(&str, &str)],
        removed: &[DocId],
    ) -> Arc<SegmentReader> {
        let mut writer = SegmentWriter::new(name);
        for &(body, sort) in docs {
            writer.begin(UpdateContext::default(), 0);
            writer
                .index("body", IndexFeatures::ALL, body.split_whitespace())
                .unwrap();
            writer.store("body", body.as_bytes()).unwrap();
            writer.sorted(sort.as_bytes()).unwrap();
            writer.commit();
        }
        for &doc in removed {
            writer.remove(doc);
        }
        let flushed = writer.flush(dir, &DefaultCodec).unwrap().unwrap();
        Arc::new(SegmentReader::open(dir, &DefaultCodec, &flushed.segment.meta).unwrap())
    }

    fn docs_of(reader: &SegmentReader, term: &[u8]) -> Vec<DocId> {
        reader
            .field("body")
            .and_then(|f| f.postings(term).unwrap())
            .map(|p| p.iter().map(|p| p.doc).collect())
            .unwrap_or_default()
    }

    #[test]
    fn merges_live_documents() {
        let dir = MemoryDirectory::new();
        let a = segment(&dir, "_1", &[("x y", "b"), ("y", "a"), ("z", "c")], &[2]);
        let b = segment(&dir, "_2", &[("y z", "d")], &[]);
        let mut writer = MergeWriter::new(&dir, &DefaultCodec, None);
        writer.add(a);
        writer.add(b);
        let merged = writer.flush("_3", &mut || true).unwrap();
        assert_eq!(3, merged.meta().docs_count);
        assert_eq!(3, merged.meta().live_docs_count);
        assert_eq!(Some(1), merged.doc_map(0, 1));
        assert_eq!(None, merged.doc_map(0, 2));
        assert_eq!(Some(2), merged.doc_map(0, 3));
        assert_eq!(Some(3), merged.doc_map(1, 1));

        let reader = SegmentReader::open(&dir, &DefaultCodec, merged.meta()).unwrap();
        assert_eq!(vec![1, 3], docs_of(&reader, b"y"));
        assert_eq!(vec![2, 3], docs_of(&reader, b"z"));
        assert_eq!(Some(&b"z"[..]), reader.column("body").unwrap().get(2));
        let norms = reader.column("\u{1}norm.body").unwrap();
        assert_eq!(3, norms.len());
    }

    #[test]
    fn comparator_orders_merged_documents() {
        let dir = MemoryDirectory::new();
        let a = segment(&dir, "_1", &[("p", "c"), ("q", "a")], &[]);
        let b = segment(&dir, "_2", &[("r", "b")], &[]);
        let comparator = BytesComparator;
        let mut writer = MergeWriter::new(&dir, &DefaultCodec, Some(&comparator));
        writer.add(a);
        writer.add(b);
        let merged = writer.flush("_3", &mut || true).unwrap();
        assert_eq!(Some(3), merged.doc_map(0, 1));
        assert_eq!(Some(1), merged.doc_map(0, 2));
        assert_eq!(Some(2), merged.doc_map(1, 1));
        assert_eq!(Some("bytes".to_string()), merged.meta().sort);
    }

    #[test]
    fn cancelled_merge_leaves_no_files() {
        let dir = MemoryDirectory::new();
        let a = segment(&dir, "_1", &[("x", "a")], &[]);
        let before = dir.list().unwrap().len();
        let mut writer = MergeWriter::new(&dir, &DefaultCodec, None);
        writer.add(a);
        let mut calls = 0;
        let res = writer.flush("_2", &mut || {
            calls += 1;
            calls < 3
        });
        match res {
            Err(Error::MergeAborted) => {}
            other => panic!("unexpected {:?}", other.map(|m| m.segment)),
        }
        assert_eq!(before, dir.list().unwrap().len());
        assert!(!dir.list().unwrap().iter().any(|f| f.starts_with("_2.")));
    }

    #[test]
    fn cancelling_after_fields_leaves_no_files() {
        let dir = MemoryDirectory::new();
        let a = segment(&dir, "_1", &[("x y", "a"), ("y", "b")], &[]);
        let mut writer = MergeWriter::new(&dir, &DefaultCodec, None);
        writer.add(a);
        let mut cutoff = 1;
        loop {
            let mut calls = 0;
            let res = writer.flush("_2", &mut || {
                calls += 1;
                calls < cutoff
            });
            match res {
                Ok(_) => break,
                Err(Error::MergeAborted) => {}
                Err(e) => panic!("unexpected {:?}", e),
            }
            let left: Vec<String> = dir
                .list()
                .unwrap()
                .into_iter()
                .filter(|f| f.starts_with("_2."))
                .collect();
            assert!(left.is_empty(), "cutoff {} left {:?}", cutoff, left);
            cutoff += 1;
        }
        assert!(cutoff > 4);
    }

    #[test]
    fn conflicting_fields_abort() {
        let dir = MemoryDirectory::new();
        let a = segment(&dir, "_1", &[("x", "a")], &[]);
        let mut other = SegmentWriter::new("_2");
        other.begin(UpdateContext::default(), 0);
        other.index("body", IndexFeatures::NONE, vec!["x"]).unwrap();
        other.commit();
        let b = other.flush(&dir, &DefaultCodec).unwrap().unwrap();
        let b = Arc::new(SegmentReader::open(&dir, &DefaultCodec, &b.segment.meta).unwrap());
        let mut writer = MergeWriter::new(&dir, &DefaultCodec, None);
        writer.add(a);
        writer.add(b);
        match writer.flush("_3", &mut || true) {
            Err(Error::FieldFeaturesMismatch { .. }) => {}
            other => panic!("unexpected {:?}", other.map(|m| m.segment)),
        }
    }
}
