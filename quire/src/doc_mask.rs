use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use roaring::RoaringBitmap;
use std::io::Read;
use std::io::Write;

use crate::error::Error;
use crate::DocId;

/// The set of masked (deleted) documents of a segment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentMask {
    docs: RoaringBitmap,
}

impl DocumentMask {
    pub fn new() -> DocumentMask {
        DocumentMask {
            docs: RoaringBitmap::new(),
        }
    }

    /// Masks `doc`. Returns whether it was newly masked.
    pub fn insert(&mut self, doc: DocId) -> bool {
        self.docs.insert(doc)
    }

    pub fn contains(&self, doc: DocId) -> bool {
        self.docs.contains(doc)
    }

    pub fn len(&self) -> u32 {
        self.docs.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Masked documents in ascending order.
    pub fn iter<'a>(&'a self) -> impl Iterator<Item = DocId> + 'a {
        self.docs.iter()
    }

    /// Adds every document masked in `other`. Returns the number of newly masked documents.
    pub fn union(&mut self, other: &DocumentMask) -> u32 {
        let before = self.docs.len();
        self.docs |= &other.docs;
        (self.docs.len() - before) as u32
    }

    pub fn write_to(&self, write: &mut dyn Write) -> Result<(), Error> {
        write.write_u32::<BigEndian>(self.len())?;
        self.docs.serialize_into(write)?;
        Ok(())
    }

    pub fn read_from(read: &mut dyn Read) -> Result<DocumentMask, Error> {
        let count = read.read_u32::<BigEndian>()?;
        let docs = RoaringBitmap::deserialize_from(read)
            .map_err(|e| Error::corrupted(format!("document mask: {}", e)))?;
        if docs.len() != u64::from(count) {
            return Err(Error::corrupted("document mask count does not match"));
        }
        Ok(DocumentMask { docs })
    }
}
