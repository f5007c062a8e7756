use std::sync::Arc;

use quire::index_writer::{IndexWriter, IndexWriterBuilder, OpenMode};
use quire::{DefaultCodec, Directory, Documents, Error, Field, IndexReader};

pub fn open(dir: Arc<dyn Directory>, builder: IndexWriterBuilder) -> IndexWriter {
    builder
        .open(dir, Arc::new(DefaultCodec), OpenMode::CreateOrAppend)
        .expect("Could not open index writer.")
}

pub fn add(docs: &mut Documents, id: &str) {
    let inserted = docs
        .insert(|doc| {
            doc.index(&Field::string("id", id))?;
            doc.index(&Field::text("body", format!("document {}", id)))?;
            doc.store(&Field::string("id", id))?;
            Ok(true)
        })
        .expect("Could not insert document.");
    assert!(inserted);
}

pub fn replace_with(id: &str) -> impl FnOnce(&mut quire::Document) -> Result<bool, Error> + '_ {
    move |doc| {
        doc.index(&Field::string("id", id))?;
        doc.index(&Field::text("body", format!("document {}", id)))?;
        doc.store(&Field::string("id", id))?;
        Ok(true)
    }
}

/// Ids of the live documents of `reader`, sorted.
pub fn reader_ids(reader: &IndexReader) -> Vec<String> {
    let mut ids = Vec::new();
    for segment in reader.segments() {
        let column = match segment.column("id") {
            Some(column) => column,
            None => continue,
        };
        for (doc, value) in column.iter() {
            if segment.is_live(doc) {
                ids.push(String::from_utf8(value.to_vec()).unwrap());
            }
        }
    }
    ids.sort();
    ids
}

pub fn live_ids(writer: &IndexWriter) -> Vec<String> {
    reader_ids(&writer.reader().unwrap())
}

pub fn index_files(dir: &dyn Directory) -> Vec<String> {
    let mut files: Vec<String> = dir
        .list()
        .unwrap()
        .into_iter()
        .filter(|f| quire::directory::is_index_file(f))
        .collect();
    files.sort();
    files
}
