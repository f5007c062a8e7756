use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use fst::map::Stream;
use fst::{Map, MapBuilder, Streamer};
use tracing::debug;

use crate::codec::{FieldReader, FieldWriter, Posting, TermReader, Terms};
use crate::directory::Directory;
use crate::error::Error;
use crate::meta::{FieldMeta, IndexFeatures, SegmentMeta};
use crate::util::{read_vint, write_vint};
use crate::DocId;

const FIELDS_EXTENSION: &str = "fm";
const TERMS_EXTENSION: &str = "ti";
const POSTINGS_EXTENSION: &str = "doc";

/// Where the term dictionary of a field lives inside the `.ti` file.
#[derive(Serialize, Deserialize, Debug)]
struct FieldEntry {
    meta: FieldMeta,
    terms_count: u64,
    dict_offset: u64,
    dict_len: u64,
}

fn file_name(segment: &str, ext: &str) -> String {
    format!("{}.{}", segment, ext)
}

/// Writes one fst per field, mapping each term to the offset of its postings list.
pub struct FstFieldWriter {
    outputs: Option<Outputs>,
    entries: Vec<FieldEntry>,
    created: Vec<String>,
}

struct Outputs {
    fields: Box<dyn Write + Send>,
    dict: Box<dyn Write + Send>,
    dict_offset: u64,
    postings: Box<dyn Write + Send>,
    postings_offset: u64,
}

impl FstFieldWriter {
    pub fn new() -> FstFieldWriter {
        FstFieldWriter {
            outputs: None,
            entries: Vec::new(),
            created: Vec::new(),
        }
    }
}

fn write_postings(
    out: &mut dyn Write,
    features: IndexFeatures,
    postings: &[Posting],
) -> Result<u64, Error> {
    let mut written = u64::from(write_vint(out, postings.len() as u64)?);
    let mut last_doc: DocId = 0;
    for posting in postings {
        written += u64::from(write_vint(out, u64::from(posting.doc - last_doc))?);
        last_doc = posting.doc;
        if features.freq {
            written += u64::from(write_vint(out, u64::from(posting.freq))?);
        }
        if features.positions {
            written += u64::from(write_vint(out, posting.positions.len() as u64)?);
            let mut last_pos = 0;
            for &pos in &posting.positions {
                written += u64::from(write_vint(out, u64::from(pos - last_pos))?);
                last_pos = pos;
            }
        }
    }
    Ok(written)
}

impl FieldWriter for FstFieldWriter {
    fn prepare(&mut self, dir: &dyn Directory, segment: &str) -> Result<(), Error> {
        self.outputs = None;
        self.entries.clear();
        self.created.clear();
        let mut create = |ext: &str| -> Result<Box<dyn Write + Send>, Error> {
            let name = file_name(segment, ext);
            let out = dir.create(&name)?;
            self.created.push(name);
            Ok(out)
        };
        let fields = create(FIELDS_EXTENSION)?;
        let dict = create(TERMS_EXTENSION)?;
        let postings = create(POSTINGS_EXTENSION)?;
        self.outputs = Some(Outputs {
            fields,
            dict,
            dict_offset: 0,
            postings,
            postings_offset: 0,
        });
        Ok(())
    }

    fn write_field(&mut self, field: &FieldMeta, terms: &mut Terms) -> Result<(), Error> {
        let out = match self.outputs {
            Some(ref mut out) => out,
            None => return Err(Error::illegal_state("field writer is not prepared")),
        };
        let mut builder = MapBuilder::memory();
        let mut terms_count = 0;
        for term in terms {
            let (term, postings) = term?;
            if postings.is_empty() {
                continue;
            }
            builder.insert(&term, out.postings_offset)?;
            out.postings_offset += write_postings(&mut out.postings, field.features, &postings)?;
            terms_count += 1;
        }
        let bytes = builder.into_inner()?;
        out.dict.write_all(&bytes)?;
        self.entries.push(FieldEntry {
            meta: field.clone(),
            terms_count,
            dict_offset: out.dict_offset,
            dict_len: bytes.len() as u64,
        });
        out.dict_offset += bytes.len() as u64;
        Ok(())
    }

    fn commit(&mut self) -> Result<Vec<String>, Error> {
        let mut out = match self.outputs.take() {
            Some(out) => out,
            None => return Err(Error::illegal_state("field writer is not prepared")),
        };
        rmps::encode::write(&mut out.fields, &self.entries)?;
        out.fields.flush()?;
        out.dict.flush()?;
        out.postings.flush()?;
        self.entries.clear();
        Ok(self.created.drain(..).collect())
    }

    fn rollback(&mut self, dir: &dyn Directory) {
        self.outputs = None;
        self.entries.clear();
        for file in self.created.drain(..) {
            if let Err(e) = dir.remove(&file) {
                debug!(file = %file, error = %e, "could not remove file on rollback");
            }
        }
    }
}

pub struct FstFieldReader;

impl FieldReader for FstFieldReader {
    fn open(
        &self,
        dir: &dyn Directory,
        meta: &SegmentMeta,
    ) -> Result<HashMap<String, Box<dyn TermReader>>, Error> {
        let entries: Vec<FieldEntry> =
            rmps::from_read(&dir.open(&file_name(&meta.name, FIELDS_EXTENSION))?[..])?;
        let dict = dir.open(&file_name(&meta.name, TERMS_EXTENSION))?;
        let postings = Arc::new(dir.open(&file_name(&meta.name, POSTINGS_EXTENSION))?);
        let mut readers: HashMap<String, Box<dyn TermReader>> = HashMap::new();
        for entry in entries {
            let start = entry.dict_offset as usize;
            let end = start + entry.dict_len as usize;
            if end > dict.len() {
                return Err(Error::corrupted(format!(
                    "term dictionary of field '{}' is out of bounds",
                    entry.meta.name
                )));
            }
            let map = Map::new(dict[start..end].to_vec())?;
            readers.insert(
                entry.meta.name.clone(),
                Box::new(FstTermReader {
                    meta: entry.meta,
                    terms_count: entry.terms_count as usize,
                    map,
                    postings: postings.clone(),
                }),
            );
        }
        Ok(readers)
    }
}

pub struct FstTermReader {
    meta: FieldMeta,
    terms_count: usize,
    map: Map<Vec<u8>>,
    postings: Arc<Vec<u8>>,
}

impl FstTermReader {
    fn read_postings(&self, offset: u64) -> Result<Vec<Posting>, Error> {
        let offset = offset as usize;
        if offset > self.postings.len() {
            return Err(Error::corrupted(format!(
                "postings offset {} of field '{}' is out of bounds",
                offset, self.meta.name
            )));
        }
        let mut input: &[u8] = &self.postings[offset..];
        let count = read_vint(&mut input)? as usize;
        let mut postings = Vec::with_capacity(count);
        let mut doc: DocId = 0;
        for _ in 0..count {
            doc += read_vint(&mut input)? as DocId;
            let mut posting = Posting::new(doc);
            if self.meta.features.freq {
                posting.freq = read_vint(&mut input)? as u32;
            }
            if self.meta.features.positions {
                let positions = read_vint(&mut input)? as usize;
                let mut pos = 0;
                posting.positions.reserve(positions);
                for _ in 0..positions {
                    pos += read_vint(&mut input)? as u32;
                    posting.positions.push(pos);
                }
            }
            postings.push(posting);
        }
        Ok(postings)
    }
}

impl TermReader for FstTermReader {
    fn meta(&self) -> &FieldMeta {
        &self.meta
    }

    fn terms_count(&self) -> usize {
        self.terms_count
    }

    fn postings(&self, term: &[u8]) -> Result<Option<Vec<Posting>>, Error> {
        match self.map.get(term) {
            Some(offset) => Ok(Some(self.read_postings(offset)?)),
            None => Ok(None),
        }
    }

    fn terms<'a>(&'a self) -> Box<Terms<'a>> {
        Box::new(TermsIter {
            reader: self,
            stream: self.map.stream(),
        })
    }
}

struct TermsIter<'a> {
    reader: &'a FstTermReader,
    stream: Stream<'a>,
}

impl<'a> Iterator for TermsIter<'a> {
    type Item = Result<(Vec<u8>, Vec<Posting>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader;
        self.stream.next().map(|(term, offset)| {
            let term = term.to_vec();
            reader.read_postings(offset).map(|postings| (term, postings))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;

    fn posting(doc: DocId, positions: Vec<u32>) -> Posting {
        Posting {
            doc,
            freq: positions.len() as u32,
            positions,
        }
    }

    fn write_segment(dir: &MemoryDirectory) -> SegmentMeta {
        let mut writer = FstFieldWriter::new();
        writer.prepare(dir, "_1").unwrap();
        let body = FieldMeta::new("body", IndexFeatures::ALL);
        let mut terms = vec![
            Ok::<_, Error>((b"apple".to_vec(), vec![posting(1, vec![0, 4]), posting(7, vec![2])])),
            Ok((b"empty".to_vec(), vec![])),
            Ok((b"pear".to_vec(), vec![posting(3, vec![1])])),
        ]
        .into_iter();
        writer.write_field(&body, &mut terms).unwrap();
        let id = FieldMeta::new("id", IndexFeatures::NONE);
        let mut terms =
            vec![Ok::<_, Error>((b"a1".to_vec(), vec![posting(2, vec![])]))].into_iter();
        writer.write_field(&id, &mut terms).unwrap();
        let mut meta = SegmentMeta::new("_1", "test");
        meta.files.extend(writer.commit().unwrap());
        meta
    }

    #[test]
    fn reads_back_postings() {
        let dir = MemoryDirectory::new();
        let meta = write_segment(&dir);
        assert_eq!(3, meta.files.len());
        let fields = FstFieldReader.open(&dir, &meta).unwrap();
        let body = &fields["body"];
        assert_eq!(2, body.terms_count());
        assert_eq!(None, body.postings(b"empty").unwrap());
        assert_eq!(
            vec![posting(1, vec![0, 4]), posting(7, vec![2])],
            body.postings(b"apple").unwrap().unwrap()
        );
        let terms: Vec<Vec<u8>> = body.terms().map(|t| t.unwrap().0).collect();
        assert_eq!(vec![b"apple".to_vec(), b"pear".to_vec()], terms);

        let id = fields["id"].postings(b"a1").unwrap().unwrap();
        assert_eq!(vec![Posting::new(2)], id);
    }

    #[test]
    fn rollback_removes_files() {
        let dir = MemoryDirectory::new();
        let mut writer = FstFieldWriter::new();
        writer.prepare(&dir, "_2").unwrap();
        assert!(dir.exists("_2.doc").unwrap());
        writer.rollback(&dir);
        assert!(dir.list().unwrap().is_empty());
        assert!(writer.commit().is_err());
    }
}
