use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Write;

use tracing::debug;

use crate::codec::{ColumnValues, ColumnstoreReader, ColumnstoreWriter};
use crate::directory::Directory;
use crate::error::Error;
use crate::meta::SegmentMeta;
use crate::util::{read_bytes, read_vint, write_bytes, write_vint};
use crate::DocId;

const COLUMNSTORE_EXTENSION: &str = "cs";

/// Stored values of one column of a sealed segment, keyed by document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Column {
    values: BTreeMap<DocId, Vec<u8>>,
}

impl Column {
    pub fn get(&self, doc: DocId) -> Option<&[u8]> {
        self.values.get(&doc).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter<'a>(&'a self) -> impl Iterator<Item = (DocId, &'a [u8])> + 'a {
        self.values.iter().map(|(&doc, v)| (doc, v.as_slice()))
    }
}

fn columnstore_file(segment: &str) -> String {
    format!("{}.{}", segment, COLUMNSTORE_EXTENSION)
}

/// Appends columns to a single `.cs` file:
/// `[name][count]` followed by `count` entries of `[doc delta][value]`.
pub struct DefaultColumnstoreWriter {
    out: Option<(String, Box<dyn Write + Send>)>,
}

impl DefaultColumnstoreWriter {
    pub fn new() -> DefaultColumnstoreWriter {
        DefaultColumnstoreWriter { out: None }
    }
}

impl ColumnstoreWriter for DefaultColumnstoreWriter {
    fn prepare(&mut self, dir: &dyn Directory, segment: &str) -> Result<(), Error> {
        let name = columnstore_file(segment);
        let out = dir.create(&name)?;
        self.out = Some((name, out));
        Ok(())
    }

    fn write_column(&mut self, name: &str, values: &mut ColumnValues) -> Result<(), Error> {
        let out = match self.out {
            Some((_, ref mut out)) => out,
            None => return Err(Error::illegal_state("columnstore writer is not prepared")),
        };
        let values = values.collect::<Result<Vec<_>, Error>>()?;
        if values.is_empty() {
            return Ok(());
        }
        write_bytes(out, name.as_bytes())?;
        write_vint(out, values.len() as u64)?;
        let mut last_doc = 0;
        for (doc, value) in values {
            if doc <= last_doc {
                return Err(Error::illegal_state(format!(
                    "column '{}' is not in ascending document order",
                    name
                )));
            }
            write_vint(out, u64::from(doc - last_doc))?;
            write_bytes(out, &value)?;
            last_doc = doc;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<Vec<String>, Error> {
        match self.out.take() {
            Some((name, mut out)) => {
                out.flush()?;
                Ok(vec![name])
            }
            None => Err(Error::illegal_state("columnstore writer is not prepared")),
        }
    }

    fn rollback(&mut self, dir: &dyn Directory) {
        if let Some((name, out)) = self.out.take() {
            drop(out);
            if let Err(e) = dir.remove(&name) {
                debug!(file = %name, error = %e, "could not remove columnstore on rollback");
            }
        }
    }
}

pub struct DefaultColumnstoreReader;

impl ColumnstoreReader for DefaultColumnstoreReader {
    fn open(
        &self,
        dir: &dyn Directory,
        meta: &SegmentMeta,
    ) -> Result<HashMap<String, Column>, Error> {
        let name = columnstore_file(&meta.name);
        let mut columns = HashMap::new();
        if !meta.files.contains(&name) {
            return Ok(columns);
        }
        let bytes = dir.open(&name)?;
        let mut input: &[u8] = &bytes;
        while !input.is_empty() {
            let column_name = String::from_utf8(read_bytes(&mut input)?)
                .map_err(|_| Error::corrupted(format!("column name in '{}' is not utf-8", name)))?;
            let count = read_vint(&mut input)?;
            let mut column = Column::default();
            let mut doc: DocId = 0;
            for _ in 0..count {
                doc += read_vint(&mut input)? as DocId;
                column.values.insert(doc, read_bytes(&mut input)?);
            }
            columns.insert(column_name, column);
        }
        Ok(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;

    #[test]
    fn reads_back_columns() {
        let dir = MemoryDirectory::new();
        let mut writer = DefaultColumnstoreWriter::new();
        writer.prepare(&dir, "_1").unwrap();
        let mut title =
            vec![Ok::<_, Error>((1, b"one".to_vec())), Ok((4, b"four".to_vec()))].into_iter();
        writer.write_column("title", &mut title).unwrap();
        let mut empty = Vec::<Result<(DocId, Vec<u8>), Error>>::new().into_iter();
        writer.write_column("nothing", &mut empty).unwrap();
        let mut meta = SegmentMeta::new("_1", "test");
        meta.files.extend(writer.commit().unwrap());

        let columns = DefaultColumnstoreReader.open(&dir, &meta).unwrap();
        assert_eq!(1, columns.len());
        let title = &columns["title"];
        assert_eq!(Some(&b"four"[..]), title.get(4));
        assert_eq!(None, title.get(2));
        assert_eq!(vec![1, 4], title.iter().map(|(d, _)| d).collect::<Vec<_>>());
    }

    #[test]
    fn rejects_unordered_values() {
        let dir = MemoryDirectory::new();
        let mut writer = DefaultColumnstoreWriter::new();
        writer.prepare(&dir, "_1").unwrap();
        let mut values = vec![Ok::<_, Error>((3, vec![])), Ok((2, vec![]))].into_iter();
        assert!(writer.write_column("c", &mut values).is_err());
        writer.rollback(&dir);
        assert!(!dir.exists("_1.cs").unwrap());
    }
}
