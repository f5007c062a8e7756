use std::collections::HashMap;
use std::fmt;
use std::io::Write;

use tracing::debug;

use crate::columnstore::{Column, DefaultColumnstoreReader, DefaultColumnstoreWriter};
use crate::directory::Directory;
use crate::doc_mask::DocumentMask;
use crate::error::Error;
use crate::meta::{FieldMeta, IndexMeta, SegmentMeta};
use crate::postings::{FstFieldReader, FstFieldWriter};
use crate::DocId;

/// One document's occurrences of a term.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Posting {
    pub doc: DocId,
    pub freq: u32,
    pub positions: Vec<u32>,
}

impl Posting {
    pub fn new(doc: DocId) -> Posting {
        Posting {
            doc,
            freq: 0,
            positions: Vec::new(),
        }
    }
}

/// Terms of a field in ascending byte order, each with its postings in ascending doc order.
pub type Terms<'a> = dyn Iterator<Item = Result<(Vec<u8>, Vec<Posting>), Error>> + 'a;

/// Values of a column in ascending doc order.
pub type ColumnValues<'a> = dyn Iterator<Item = Result<(DocId, Vec<u8>), Error>> + 'a;

/// Read access to the terms of one field of a sealed segment.
pub trait TermReader: Send + Sync {
    fn meta(&self) -> &FieldMeta;
    fn terms_count(&self) -> usize;
    fn postings(&self, term: &[u8]) -> Result<Option<Vec<Posting>>, Error>;
    fn terms<'a>(&'a self) -> Box<Terms<'a>>;
}

/// Writes and publishes index states.
pub trait IndexMetaWriter: Send {
    /// Writes `meta` as the next generation without publishing it. Sets `meta.generation` and
    /// returns the name of the written file, which the caller is expected to sync.
    fn prepare(&mut self, dir: &dyn Directory, meta: &mut IndexMeta) -> Result<String, Error>;
    /// Publishes the prepared state, returning the name it was published under.
    fn commit(&mut self, dir: &dyn Directory) -> Result<String, Error>;
    /// Forgets the prepared state and removes what `prepare` wrote.
    fn rollback(&mut self, dir: &dyn Directory);
}

pub trait IndexMetaReader: Send + Sync {
    /// Name of the latest published index state, if any.
    fn last_segments_file(&self, dir: &dyn Directory) -> Result<Option<String>, Error>;
    fn read(&self, dir: &dyn Directory, filename: &str) -> Result<IndexMeta, Error>;
}

pub trait SegmentMetaWriter: Send + Sync {
    /// Writes `meta`, returning the file it was written to.
    fn write(&self, dir: &dyn Directory, meta: &SegmentMeta) -> Result<String, Error>;
}

pub trait SegmentMetaReader: Send + Sync {
    fn read(&self, dir: &dyn Directory, filename: &str) -> Result<SegmentMeta, Error>;
}

pub trait FieldWriter: Send {
    fn prepare(&mut self, dir: &dyn Directory, segment: &str) -> Result<(), Error>;
    fn write_field(&mut self, field: &FieldMeta, terms: &mut Terms) -> Result<(), Error>;
    /// Finishes all files, returning their names.
    fn commit(&mut self) -> Result<Vec<String>, Error>;
    fn rollback(&mut self, dir: &dyn Directory);
}

pub trait FieldReader: Send + Sync {
    fn open(
        &self,
        dir: &dyn Directory,
        meta: &SegmentMeta,
    ) -> Result<HashMap<String, Box<dyn TermReader>>, Error>;
}

pub trait ColumnstoreWriter: Send {
    fn prepare(&mut self, dir: &dyn Directory, segment: &str) -> Result<(), Error>;
    fn write_column(&mut self, name: &str, values: &mut ColumnValues) -> Result<(), Error>;
    fn commit(&mut self) -> Result<Vec<String>, Error>;
    fn rollback(&mut self, dir: &dyn Directory);
}

pub trait ColumnstoreReader: Send + Sync {
    fn open(&self, dir: &dyn Directory, meta: &SegmentMeta)
        -> Result<HashMap<String, Column>, Error>;
}

pub trait DocumentMaskWriter: Send + Sync {
    fn filename(&self, meta: &SegmentMeta) -> String;
    fn write(
        &self,
        dir: &dyn Directory,
        meta: &SegmentMeta,
        mask: &DocumentMask,
    ) -> Result<String, Error>;
}

pub trait DocumentMaskReader: Send + Sync {
    /// The mask of `meta`, empty if the segment has no deletions.
    fn read(&self, dir: &dyn Directory, meta: &SegmentMeta) -> Result<DocumentMask, Error>;
}

/// Factory for everything that reads or writes index files.
pub trait Codec: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;
    fn index_meta_writer(&self) -> Box<dyn IndexMetaWriter>;
    fn index_meta_reader(&self) -> Box<dyn IndexMetaReader>;
    fn segment_meta_writer(&self) -> Box<dyn SegmentMetaWriter>;
    fn segment_meta_reader(&self) -> Box<dyn SegmentMetaReader>;
    fn field_writer(&self) -> Box<dyn FieldWriter>;
    fn field_reader(&self) -> Box<dyn FieldReader>;
    fn columnstore_writer(&self) -> Box<dyn ColumnstoreWriter>;
    fn columnstore_reader(&self) -> Box<dyn ColumnstoreReader>;
    fn document_mask_writer(&self) -> Box<dyn DocumentMaskWriter>;
    fn document_mask_reader(&self) -> Box<dyn DocumentMaskReader>;
}

const SEGMENTS_PREFIX: &str = "segments_";
const PENDING_SEGMENTS_PREFIX: &str = "pending_segments_";
const SEGMENT_META_EXT: &str = "sm";
const DOCUMENT_MASK_EXT: &str = "dm";

pub fn segments_file(generation: u64) -> String {
    format!("{}{}", SEGMENTS_PREFIX, generation)
}

fn pending_segments_file(generation: u64) -> String {
    format!("{}{}", PENDING_SEGMENTS_PREFIX, generation)
}

fn parse_generation(name: &str) -> Option<u64> {
    if name.starts_with(SEGMENTS_PREFIX) {
        name[SEGMENTS_PREFIX.len()..].parse().ok()
    } else {
        None
    }
}

/// msgpack metadata, fst term dictionaries, vint postings.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultCodec;

impl DefaultCodec {
    pub const NAME: &'static str = "quire_10";
}

impl Codec for DefaultCodec {
    fn name(&self) -> &'static str {
        DefaultCodec::NAME
    }

    fn index_meta_writer(&self) -> Box<dyn IndexMetaWriter> {
        Box::new(DefaultIndexMetaWriter { prepared: None })
    }

    fn index_meta_reader(&self) -> Box<dyn IndexMetaReader> {
        Box::new(DefaultIndexMetaReader)
    }

    fn segment_meta_writer(&self) -> Box<dyn SegmentMetaWriter> {
        Box::new(DefaultSegmentMetaIo)
    }

    fn segment_meta_reader(&self) -> Box<dyn SegmentMetaReader> {
        Box::new(DefaultSegmentMetaIo)
    }

    fn field_writer(&self) -> Box<dyn FieldWriter> {
        Box::new(FstFieldWriter::new())
    }

    fn field_reader(&self) -> Box<dyn FieldReader> {
        Box::new(FstFieldReader)
    }

    fn columnstore_writer(&self) -> Box<dyn ColumnstoreWriter> {
        Box::new(DefaultColumnstoreWriter::new())
    }

    fn columnstore_reader(&self) -> Box<dyn ColumnstoreReader> {
        Box::new(DefaultColumnstoreReader)
    }

    fn document_mask_writer(&self) -> Box<dyn DocumentMaskWriter> {
        Box::new(DefaultDocumentMaskIo)
    }

    fn document_mask_reader(&self) -> Box<dyn DocumentMaskReader> {
        Box::new(DefaultDocumentMaskIo)
    }
}

struct DefaultIndexMetaWriter {
    prepared: Option<(String, String)>,
}

impl IndexMetaWriter for DefaultIndexMetaWriter {
    fn prepare(&mut self, dir: &dyn Directory, meta: &mut IndexMeta) -> Result<String, Error> {
        if self.prepared.is_some() {
            return Err(Error::illegal_state("an index state is already prepared"));
        }
        meta.generation = meta.next_generation();
        let pending = pending_segments_file(meta.generation);
        let mut out = dir.create(&pending)?;
        let written = rmps::encode::write(&mut out, &*meta)
            .map_err(Error::from)
            .and_then(|_| out.flush().map_err(Error::from));
        if let Err(e) = written {
            drop(out);
            let _ = dir.remove(&pending);
            return Err(e);
        }
        self.prepared = Some((pending.clone(), segments_file(meta.generation)));
        Ok(pending)
    }

    fn commit(&mut self, dir: &dyn Directory) -> Result<String, Error> {
        let committed = match self.prepared {
            Some((ref pending, ref committed)) => {
                dir.rename(pending, committed)?;
                committed.clone()
            }
            None => return Err(Error::illegal_state("no index state prepared")),
        };
        self.prepared = None;
        Ok(committed)
    }

    fn rollback(&mut self, dir: &dyn Directory) {
        if let Some((pending, _)) = self.prepared.take() {
            if let Err(e) = dir.remove(&pending) {
                debug!(file = %pending, error = %e, "could not remove pending index state");
            }
        }
    }
}

struct DefaultIndexMetaReader;

impl IndexMetaReader for DefaultIndexMetaReader {
    fn last_segments_file(&self, dir: &dyn Directory) -> Result<Option<String>, Error> {
        Ok(dir
            .list()?
            .into_iter()
            .filter_map(|name| parse_generation(&name).map(|gen| (gen, name)))
            .max_by_key(|&(gen, _)| gen)
            .map(|(_, name)| name))
    }

    fn read(&self, dir: &dyn Directory, filename: &str) -> Result<IndexMeta, Error> {
        let bytes = dir.open(filename)?;
        let mut meta: IndexMeta = rmps::from_read(&bytes[..])?;
        match parse_generation(filename) {
            Some(gen) => meta.generation = gen,
            None => {
                return Err(Error::corrupted(format!(
                    "'{}' is not an index state",
                    filename
                )))
            }
        }
        Ok(meta)
    }
}

struct DefaultSegmentMetaIo;

impl SegmentMetaWriter for DefaultSegmentMetaIo {
    fn write(&self, dir: &dyn Directory, meta: &SegmentMeta) -> Result<String, Error> {
        let filename = format!("{}.{}.{}", meta.name, meta.version, SEGMENT_META_EXT);
        let mut out = dir.create(&filename)?;
        rmps::encode::write(&mut out, meta)?;
        out.flush()?;
        Ok(filename)
    }
}

impl SegmentMetaReader for DefaultSegmentMetaIo {
    fn read(&self, dir: &dyn Directory, filename: &str) -> Result<SegmentMeta, Error> {
        let bytes = dir.open(filename)?;
        Ok(rmps::from_read(&bytes[..])?)
    }
}

struct DefaultDocumentMaskIo;

impl DocumentMaskWriter for DefaultDocumentMaskIo {
    fn filename(&self, meta: &SegmentMeta) -> String {
        format!("{}.{}.{}", meta.name, meta.version, DOCUMENT_MASK_EXT)
    }

    fn write(
        &self,
        dir: &dyn Directory,
        meta: &SegmentMeta,
        mask: &DocumentMask,
    ) -> Result<String, Error> {
        let filename = self.filename(meta);
        let mut out = dir.create(&filename)?;
        mask.write_to(&mut out)?;
        out.flush()?;
        Ok(filename)
    }
}

impl DocumentMaskReader for DefaultDocumentMaskIo {
    fn read(&self, dir: &dyn Directory, meta: &SegmentMeta) -> Result<DocumentMask, Error> {
        let suffix = format!(".{}", DOCUMENT_MASK_EXT);
        match meta.files.iter().find(|f| f.ends_with(&suffix)) {
            Some(filename) => {
                let bytes = dir.open(filename)?;
                let mask = DocumentMask::read_from(&mut &bytes[..])?;
                if u64::from(mask.len()) + meta.live_docs_count != meta.docs_count {
                    return Err(Error::corrupted(format!(
                        "mask of segment '{}' does not match its live document count",
                        meta.name
                    )));
                }
                Ok(mask)
            }
            None => Ok(DocumentMask::new()),
        }
    }
}

/// Whether `file` is the document mask of some segment version.
pub(crate) fn is_document_mask(file: &str) -> bool {
    file.ends_with(&format!(".{}", DOCUMENT_MASK_EXT))
}
