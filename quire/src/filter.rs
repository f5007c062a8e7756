use std::fmt;

use crate::doc_iter::{AllDocsDocIter, DocIter, EmptyDocIter, VecDocIter};
use crate::error::Error;
use crate::segment_reader::SegmentReader;
use crate::DocId;

/// Locates the documents a delete or update applies to.
pub trait Filter: Send + Sync + fmt::Debug {
    fn prepare(&self, reader: &SegmentReader) -> Result<Box<dyn PreparedFilter>, Error>;
}

/// A filter bound to one segment.
pub trait PreparedFilter {
    /// Matching documents in ascending order, masked ones included.
    fn execute(&self, reader: &SegmentReader) -> Result<Box<dyn DocIter>, Error>;
}

/// Runs `filter` against `reader`, collecting the matching documents.
pub fn matching_docs(filter: &dyn Filter, reader: &SegmentReader) -> Result<Vec<DocId>, Error> {
    let prepared = filter.prepare(reader)?;
    let mut iter = prepared.execute(reader)?;
    let mut docs = Vec::new();
    while let Some(doc) = iter.next_doc()? {
        docs.push(doc);
    }
    Ok(docs)
}

struct PreparedDocs(Vec<DocId>);

impl PreparedFilter for PreparedDocs {
    fn execute(&self, _reader: &SegmentReader) -> Result<Box<dyn DocIter>, Error> {
        Ok(Box::new(VecDocIter::new(self.0.clone())))
    }
}

struct PreparedNone;

impl PreparedFilter for PreparedNone {
    fn execute(&self, _reader: &SegmentReader) -> Result<Box<dyn DocIter>, Error> {
        Ok(Box::new(EmptyDocIter))
    }
}

/// Documents containing `term` in `field`.
#[derive(Clone, Debug)]
pub struct TermFilter {
    pub field: String,
    pub term: Vec<u8>,
}

impl TermFilter {
    pub fn new<F: Into<String>, T: Into<Vec<u8>>>(field: F, term: T) -> TermFilter {
        TermFilter {
            field: field.into(),
            term: term.into(),
        }
    }
}

impl Filter for TermFilter {
    fn prepare(&self, reader: &SegmentReader) -> Result<Box<dyn PreparedFilter>, Error> {
        let postings = match reader.field(&self.field) {
            Some(field) => field.postings(&self.term)?,
            None => None,
        };
        Ok(match postings {
            Some(postings) => Box::new(PreparedDocs(postings.iter().map(|p| p.doc).collect())),
            None => Box::new(PreparedNone),
        })
    }
}

/// Every document.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllFilter;

struct PreparedAll;

impl PreparedFilter for PreparedAll {
    fn execute(&self, reader: &SegmentReader) -> Result<Box<dyn DocIter>, Error> {
        Ok(Box::new(AllDocsDocIter::new(reader.docs_count() as DocId)))
    }
}

impl Filter for AllFilter {
    fn prepare(&self, _reader: &SegmentReader) -> Result<Box<dyn PreparedFilter>, Error> {
        Ok(Box::new(PreparedAll))
    }
}

/// Explicit documents of one segment.
#[derive(Clone, Debug)]
pub struct DocIdFilter {
    pub segment: String,
    pub docs: Vec<DocId>,
}

impl DocIdFilter {
    pub fn new<S: Into<String>>(segment: S, mut docs: Vec<DocId>) -> DocIdFilter {
        docs.sort();
        docs.dedup();
        DocIdFilter {
            segment: segment.into(),
            docs,
        }
    }
}

impl Filter for DocIdFilter {
    fn prepare(&self, reader: &SegmentReader) -> Result<Box<dyn PreparedFilter>, Error> {
        if reader.name() != self.segment {
            return Ok(Box::new(PreparedNone));
        }
        let docs_count = reader.docs_count();
        Ok(Box::new(PreparedDocs(
            self.docs
                .iter()
                .cloned()
                .filter(|&doc| doc >= crate::DOC_ID_MIN && u64::from(doc) <= docs_count)
                .collect(),
        )))
    }
}

/// Documents whose stored `column` equals `value`.
#[derive(Clone, Debug)]
pub struct ColumnValueFilter {
    pub column: String,
    pub value: Vec<u8>,
}

impl ColumnValueFilter {
    pub fn new<C: Into<String>, V: Into<Vec<u8>>>(column: C, value: V) -> ColumnValueFilter {
        ColumnValueFilter {
            column: column.into(),
            value: value.into(),
        }
    }
}

impl Filter for ColumnValueFilter {
    fn prepare(&self, reader: &SegmentReader) -> Result<Box<dyn PreparedFilter>, Error> {
        Ok(match reader.column(&self.column) {
            Some(column) => Box::new(PreparedDocs(
                column
                    .iter()
                    .filter(|&(_, value)| value == self.value.as_slice())
                    .map(|(doc, _)| doc)
                    .collect(),
            )),
            None => Box::new(PreparedNone),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DefaultCodec;
    use crate::directory::MemoryDirectory;
    use crate::meta::IndexFeatures;
    use crate::segment_writer::{SegmentWriter, UpdateContext};

    fn reader() -> SegmentReader {
        let dir = MemoryDirectory::new();
        let mut writer = SegmentWriter::new("_3");
        for (id, body) in &[("a", "x y"), ("b", "y"), ("c", "z")] {
            writer.begin(UpdateContext::default(), 0);
            writer
                .index("body", IndexFeatures::ALL, body.split_whitespace())
                .unwrap();
            writer.store("id", id.as_bytes()).unwrap();
            writer.commit();
        }
        writer.remove(2);
        let flushed = writer.flush(&dir, &DefaultCodec).unwrap().unwrap();
        SegmentReader::open(&dir, &DefaultCodec, &flushed.segment.meta).unwrap()
    }

    #[test]
    fn filters_match_masked_documents_too() {
        let reader = reader();
        assert_eq!(
            vec![1, 2],
            matching_docs(&TermFilter::new("body", "y"), &reader).unwrap()
        );
        assert!(matching_docs(&TermFilter::new("title", "y"), &reader)
            .unwrap()
            .is_empty());
        assert_eq!(vec![1, 2, 3], matching_docs(&AllFilter, &reader).unwrap());
        assert_eq!(
            vec![3],
            matching_docs(&ColumnValueFilter::new("id", "c"), &reader).unwrap()
        );
    }

    #[test]
    fn doc_id_filter_is_bound_to_a_segment() {
        let reader = reader();
        let filter = DocIdFilter::new("_3", vec![3, 1, 9, 1]);
        assert_eq!(vec![1, 3], matching_docs(&filter, &reader).unwrap());
        let other = DocIdFilter::new("_4", vec![1]);
        assert!(matching_docs(&other, &reader).unwrap().is_empty());
    }
}
