use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::codec::{Codec, Posting};
use crate::comparator::{compare_docs, Comparator};
use crate::directory::{remove_segment_files, Directory};
use crate::doc_mask::DocumentMask;
use crate::error::Error;
use crate::meta::{FieldMeta, IndexFeatures, IndexSegment, SegmentMeta};
use crate::{DocId, DOC_ID_MAX, DOC_ID_MIN};

/// Column holding the raw sort value of every document that has one.
pub const SORT_COLUMN: &str = "\u{1}sort";
/// Prefix of the per-field norm columns, holding each document's token count.
pub const NORM_PREFIX: &str = "\u{1}norm.";

/// Why and when a buffered document was inserted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateContext {
    pub generation: u64,
    /// Index of the modification query this document replaces targets of.
    pub update_id: Option<usize>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Begin {
    Started(DocId),
    /// No more document ids are available. Roll over to a new segment.
    SegmentFull,
}

struct FieldData {
    features: IndexFeatures,
    terms: HashMap<Vec<u8>, Vec<Posting>>,
}

/// A segment sealed by `SegmentWriter::flush` that is not part of any committed state yet.
#[derive(Debug)]
pub struct FlushedSegment {
    pub segment: IndexSegment,
    /// Update contexts by sealed document id, `doc_contexts[doc - DOC_ID_MIN]`.
    pub doc_contexts: Vec<UpdateContext>,
    /// Documents masked after the segment was sealed.
    pub docs_mask: DocumentMask,
    /// Highest tick of a document in the segment.
    pub tick: u64,
    /// Maps document ids handed out by the writer to sealed ids, if sorting moved them.
    doc_map: Option<Vec<DocId>>,
}

impl FlushedSegment {
    pub fn name(&self) -> &str {
        &self.segment.meta.name
    }

    pub fn update_context(&self, doc: DocId) -> Option<UpdateContext> {
        self.doc_contexts
            .get((doc as usize).wrapping_sub(DOC_ID_MIN as usize))
            .cloned()
    }

    /// Masks a document by the id the writer handed out for it.
    pub fn mask_written(&mut self, doc: DocId) -> bool {
        let sealed = match self.doc_map {
            Some(ref map) => map.get(doc as usize).cloned().unwrap_or(0),
            None => doc,
        };
        if sealed < DOC_ID_MIN || sealed as usize > self.doc_contexts.len() {
            return false;
        }
        self.docs_mask.insert(sealed)
    }
}

/// Accumulates one segment's documents in memory until they are flushed.
pub struct SegmentWriter {
    name: String,
    comparator: Option<Arc<dyn Comparator>>,
    docs: Vec<UpdateContext>,
    mask: DocumentMask,
    fields: HashMap<String, FieldData>,
    norms: HashMap<String, Vec<(DocId, u32)>>,
    columns: HashMap<String, Vec<(DocId, Vec<u8>)>>,
    current: Option<DocId>,
    memory: usize,
    doc_limit: DocId,
    tick: u64,
}

impl SegmentWriter {
    pub fn new<N: Into<String>>(name: N) -> SegmentWriter {
        SegmentWriter {
            name: name.into(),
            comparator: None,
            docs: Vec::new(),
            mask: DocumentMask::new(),
            fields: HashMap::new(),
            norms: HashMap::new(),
            columns: HashMap::new(),
            current: None,
            memory: 0,
            doc_limit: DOC_ID_MAX,
            tick: 0,
        }
    }

    pub fn with_comparator(mut self, comparator: Option<Arc<dyn Comparator>>) -> SegmentWriter {
        self.comparator = comparator;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the writer is bound to a segment name.
    pub fn initialized(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn docs_cached(&self) -> usize {
        self.docs.len()
    }

    /// Rough number of bytes buffered for the documents of this segment.
    pub fn memory_active(&self) -> usize {
        self.memory
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub(crate) fn set_doc_limit(&mut self, limit: DocId) {
        self.doc_limit = limit.min(DOC_ID_MAX);
    }

    /// Starts a new document. A document left unfinished by an earlier `begin` is rolled
    /// back first.
    pub fn begin(&mut self, context: UpdateContext, reserve: usize) -> Begin {
        if self.current.is_some() {
            self.rollback();
        }
        if self.docs.len() >= self.doc_limit as usize {
            return Begin::SegmentFull;
        }
        self.docs.push(context);
        let doc = self.docs.len() as DocId;
        self.memory += reserve + mem::size_of::<UpdateContext>();
        self.current = Some(doc);
        Begin::Started(doc)
    }

    fn current_doc(&self) -> Result<DocId, Error> {
        self.current.ok_or_else(|| Error::illegal_state("no document was started"))
    }

    /// Indexes `tokens` as the terms of `field` for the current document.
    pub fn index<I, T>(
        &mut self,
        field: &str,
        features: IndexFeatures,
        tokens: I,
    ) -> Result<(), Error>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let doc = self.current_doc()?;
        let data = match self.fields.entry(field.to_string()) {
            Entry::Occupied(entry) => {
                if entry.get().features != features {
                    return Err(Error::FieldFeaturesMismatch {
                        field: field.to_string(),
                    });
                }
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                self.memory += field.len();
                entry.insert(FieldData {
                    features,
                    terms: HashMap::new(),
                })
            }
        };
        let mut count = 0u32;
        for token in tokens {
            let term = token.as_ref().as_bytes();
            if !data.terms.contains_key(term) {
                self.memory += term.len();
                data.terms.insert(term.to_vec(), Vec::new());
            }
            if let Some(postings) = data.terms.get_mut(term) {
                if postings.last().map(|p| p.doc != doc).unwrap_or(true) {
                    postings.push(Posting::new(doc));
                    self.memory += mem::size_of::<Posting>();
                }
                if let Some(posting) = postings.last_mut() {
                    posting.freq += 1;
                    if features.positions {
                        posting.positions.push(count);
                        self.memory += mem::size_of::<u32>();
                    }
                }
            }
            count += 1;
        }
        let norms = self.norms.entry(field.to_string()).or_insert_with(Vec::new);
        match norms.last_mut() {
            Some(last) if last.0 == doc => last.1 += count,
            _ => {
                norms.push((doc, count));
                self.memory += mem::size_of::<(DocId, u32)>();
            }
        }
        Ok(())
    }

    /// Stores `value` in column `name` for the current document, replacing an earlier value.
    pub fn store(&mut self, name: &str, value: &[u8]) -> Result<(), Error> {
        let doc = self.current_doc()?;
        let column = self.columns.entry(name.to_string()).or_insert_with(Vec::new);
        self.memory += value.len();
        match column.last_mut() {
            Some(last) if last.0 == doc => last.1 = value.to_vec(),
            _ => column.push((doc, value.to_vec())),
        }
        Ok(())
    }

    /// Sets the value the comparator orders the current document by.
    pub fn sorted(&mut self, value: &[u8]) -> Result<(), Error> {
        self.store(SORT_COLUMN, value)
    }

    pub fn commit(&mut self) {
        self.current = None;
    }

    pub fn commit_with_tick(&mut self, tick: u64) {
        if self.current.take().is_some() {
            self.tick = self.tick.max(tick);
        }
    }

    /// Masks the current document.
    pub fn rollback(&mut self) {
        if let Some(doc) = self.current.take() {
            self.mask.insert(doc);
        }
    }

    /// Masks a buffered document. Returns whether it was newly masked.
    pub fn remove(&mut self, doc: DocId) -> bool {
        if doc < DOC_ID_MIN || doc as usize > self.docs.len() {
            return false;
        }
        self.mask.insert(doc)
    }

    pub fn is_masked(&self, doc: DocId) -> bool {
        self.mask.contains(doc)
    }

    /// Returns the writer to a blank state, not bound to any segment.
    pub fn reset(&mut self) {
        self.name.clear();
        self.docs.clear();
        self.mask = DocumentMask::new();
        self.fields.clear();
        self.norms.clear();
        self.columns.clear();
        self.current = None;
        self.memory = 0;
        self.tick = 0;
    }

    /// Re-initializes the writer to build the segment `name`.
    pub fn reset_to<N: Into<String>>(&mut self, name: N) {
        self.reset();
        self.name = name.into();
    }

    /// Order of the sealed documents: `order[new - DOC_ID_MIN]` is the writer's id.
    fn doc_order(&self) -> Option<Vec<DocId>> {
        let comparator = self.comparator.as_ref()?;
        let mut values: Vec<Option<&[u8]>> = vec![None; self.docs.len() + 1];
        if let Some(column) = self.columns.get(SORT_COLUMN) {
            for &(doc, ref value) in column {
                values[doc as usize] = Some(value.as_slice());
            }
        }
        let mut keyed: Vec<(DocId, Option<&[u8]>)> = (DOC_ID_MIN..=self.docs.len() as DocId)
            .map(|doc| (doc, values[doc as usize]))
            .collect();
        keyed.sort_by(|l, r| compare_docs(comparator.as_ref(), l, r));
        Some(keyed.into_iter().map(|(doc, _)| doc).collect())
    }

    /// Seals the buffered documents into a segment. Returns `None`, writing nothing, if every
    /// document is masked. The writer is blank after a successful flush. On failure it keeps
    /// its documents and nothing is left behind under its name.
    pub fn flush(
        &mut self,
        dir: &dyn Directory,
        codec: &dyn Codec,
    ) -> Result<Option<FlushedSegment>, Error> {
        self.rollback();
        let docs_count = self.docs.len();
        if docs_count == 0 || self.mask.len() as usize == docs_count {
            debug!(segment = %self.name, docs = docs_count, "nothing to flush");
            self.reset();
            return Ok(None);
        }
        match self.write_segment(dir, codec) {
            Ok(flushed) => {
                self.reset();
                Ok(Some(flushed))
            }
            Err(e) => {
                remove_segment_files(dir, &self.name);
                debug!(segment = %self.name, docs = docs_count, error = %e, "flush failed");
                Err(e)
            }
        }
    }

    fn write_segment(
        &self,
        dir: &dyn Directory,
        codec: &dyn Codec,
    ) -> Result<FlushedSegment, Error> {
        let docs_count = self.docs.len();
        let order = self.doc_order();
        // writer id -> sealed id
        let doc_map: Option<Vec<DocId>> = order.as_ref().map(|order| {
            let mut map = vec![0; docs_count + 1];
            for (i, &old) in order.iter().enumerate() {
                map[old as usize] = i as DocId + DOC_ID_MIN;
            }
            map
        });
        let remap = |doc: DocId| match doc_map {
            Some(ref map) => map[doc as usize],
            None => doc,
        };

        let mut fields: Vec<(FieldMeta, Vec<(Vec<u8>, Vec<Posting>)>)> = self
            .fields
            .iter()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|(name, data)| {
                let mut terms: Vec<(Vec<u8>, Vec<Posting>)> = data
                    .terms
                    .iter()
                    .map(|(term, postings)| {
                        let mut postings = postings.clone();
                        if doc_map.is_some() {
                            for posting in postings.iter_mut() {
                                posting.doc = remap(posting.doc);
                            }
                            postings.sort_by_key(|p| p.doc);
                        }
                        (term.clone(), postings)
                    })
                    .collect();
                terms.sort_by(|a, b| a.0.cmp(&b.0));
                (FieldMeta::new(name.as_str(), data.features), terms)
            })
            .collect();
        fields.sort_by(|a, b| a.0.name.cmp(&b.0.name));

        let mut columns: Vec<(String, Vec<(DocId, Vec<u8>)>)> = self
            .columns
            .iter()
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect();
        for (field, norms) in &self.norms {
            let values = norms
                .iter()
                .map(|&(doc, norm)| {
                    let mut buf = [0u8; 4];
                    BigEndian::write_u32(&mut buf, norm);
                    (doc, buf.to_vec())
                })
                .collect();
            columns.push((format!("{}{}", NORM_PREFIX, field), values));
        }
        for &mut (_, ref mut values) in columns.iter_mut() {
            if doc_map.is_some() {
                for value in values.iter_mut() {
                    value.0 = remap(value.0);
                }
                values.sort_by_key(|v| v.0);
            }
        }
        columns.sort_by(|a, b| a.0.cmp(&b.0));

        let mut meta = SegmentMeta::new(self.name.clone(), codec.name());
        meta.docs_count = docs_count as u64;
        meta.sort = self.comparator.as_ref().map(|c| c.name().to_string());
        meta.fields = fields.iter().map(|f| f.0.clone()).collect();

        let mut field_writer = codec.field_writer();
        let mut column_writer = codec.columnstore_writer();
        let written = (|| -> Result<Vec<String>, Error> {
            field_writer.prepare(dir, &self.name)?;
            for (field, terms) in fields {
                let mut terms = terms.into_iter().map(Ok::<_, Error>);
                field_writer.write_field(&field, &mut terms)?;
            }
            let mut files = field_writer.commit()?;
            column_writer.prepare(dir, &self.name)?;
            for (name, values) in columns {
                let mut values = values.into_iter().map(Ok::<_, Error>);
                column_writer.write_column(&name, &mut values)?;
            }
            files.extend(column_writer.commit()?);
            Ok(files)
        })();
        let files = match written {
            Ok(files) => files,
            Err(e) => {
                field_writer.rollback(dir);
                column_writer.rollback(dir);
                return Err(e);
            }
        };
        meta.files.extend(files);

        let mut mask = DocumentMask::new();
        for doc in self.mask.iter() {
            mask.insert(remap(doc));
        }
        meta.live_docs_count = meta.docs_count - u64::from(mask.len());
        if !mask.is_empty() {
            let file = codec.document_mask_writer().write(dir, &meta, &mask)?;
            meta.files.insert(file);
        }
        let mut size = 0;
        for file in &meta.files {
            size += dir.length(file)?;
        }
        meta.size = size;
        let filename = codec.segment_meta_writer().write(dir, &meta)?;

        let mut doc_contexts = vec![UpdateContext::default(); docs_count];
        for (i, context) in self.docs.iter().enumerate() {
            let sealed = remap(i as DocId + DOC_ID_MIN);
            doc_contexts[(sealed - DOC_ID_MIN) as usize] = *context;
        }
        trace!(
            segment = %meta.name,
            docs = meta.docs_count,
            live = meta.live_docs_count,
            bytes = meta.size,
            "flushed segment"
        );
        Ok(FlushedSegment {
            segment: IndexSegment { filename, meta },
            doc_contexts,
            docs_mask: DocumentMask::new(),
            tick: self.tick,
            doc_map,
        })
    }
}
