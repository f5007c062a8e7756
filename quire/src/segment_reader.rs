use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{Codec, TermReader};
use crate::columnstore::Column;
use crate::directory::Directory;
use crate::doc_mask::DocumentMask;
use crate::error::Error;
use crate::meta::SegmentMeta;
use crate::DocId;

/// Read-only view of one version of a sealed segment.
pub struct SegmentReader {
    meta: SegmentMeta,
    fields: Arc<HashMap<String, Box<dyn TermReader>>>,
    columns: Arc<HashMap<String, Column>>,
    mask: DocumentMask,
}

impl SegmentReader {
    pub fn open(
        dir: &dyn Directory,
        codec: &dyn Codec,
        meta: &SegmentMeta,
    ) -> Result<SegmentReader, Error> {
        let fields = codec.field_reader().open(dir, meta)?;
        let columns = codec.columnstore_reader().open(dir, meta)?;
        let mask = codec.document_mask_reader().read(dir, meta)?;
        Ok(SegmentReader {
            meta: meta.clone(),
            fields: Arc::new(fields),
            columns: Arc::new(columns),
            mask,
        })
    }

    /// Opens another version of the same segment. Only the mask differs between versions, so
    /// field and column data are shared with `self`.
    pub fn reopen(
        &self,
        dir: &dyn Directory,
        codec: &dyn Codec,
        meta: &SegmentMeta,
    ) -> Result<SegmentReader, Error> {
        if meta.name != self.meta.name {
            return SegmentReader::open(dir, codec, meta);
        }
        Ok(SegmentReader {
            meta: meta.clone(),
            fields: self.fields.clone(),
            columns: self.columns.clone(),
            mask: codec.document_mask_reader().read(dir, meta)?,
        })
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn docs_count(&self) -> u64 {
        self.meta.docs_count
    }

    pub fn live_docs_count(&self) -> u64 {
        self.meta.live_docs_count
    }

    pub fn mask(&self) -> &DocumentMask {
        &self.mask
    }

    pub fn is_live(&self, doc: DocId) -> bool {
        doc >= crate::DOC_ID_MIN
            && u64::from(doc) <= self.meta.docs_count
            && !self.mask.contains(doc)
    }

    pub fn field(&self, name: &str) -> Option<&dyn TermReader> {
        self.fields.get(name).map(|f| f.as_ref())
    }

    pub fn fields<'a>(&'a self) -> impl Iterator<Item = &'a dyn TermReader> + 'a {
        self.fields.values().map(|f| f.as_ref())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn columns<'a>(&'a self) -> impl Iterator<Item = (&'a str, &'a Column)> + 'a {
        self.columns.iter().map(|(name, column)| (name.as_str(), column))
    }

    pub fn live_docs<'a>(&'a self) -> impl Iterator<Item = DocId> + 'a {
        (crate::DOC_ID_MIN..=self.meta.docs_count as DocId)
            .filter(move |&doc| !self.mask.contains(doc))
    }
}
