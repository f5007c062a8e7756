use crate::error::Error;
use crate::DocId;

/// Ascending iteration over document ids.
pub trait DocIter {
    fn current_doc(&self) -> Option<DocId>;
    fn next_doc(&mut self) -> Result<Option<DocId>, Error>;
    fn advance(&mut self, target: DocId) -> Result<Option<DocId>, Error> {
        loop {
            let next = self.next_doc()?;
            match next {
                Some(doc_id) => {
                    if doc_id < target {
                        continue;
                    } else {
                        return Ok(Some(doc_id));
                    }
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }
}

pub struct VecDocIter {
    doc_ids: Vec<DocId>,
    pos: usize,
}

impl VecDocIter {
    /// `doc_ids` must be sorted.
    pub fn new(doc_ids: Vec<DocId>) -> VecDocIter {
        VecDocIter { doc_ids, pos: 0 }
    }
}

impl DocIter for VecDocIter {
    fn current_doc(&self) -> Option<DocId> {
        if self.pos == 0 {
            None
        } else {
            self.doc_ids.get(self.pos - 1).cloned()
        }
    }

    fn next_doc(&mut self) -> Result<Option<DocId>, Error> {
        if self.pos >= self.doc_ids.len() {
            self.pos = self.doc_ids.len() + 1;
            Ok(None)
        } else {
            let res = Some(self.doc_ids[self.pos]);
            self.pos += 1;
            Ok(res)
        }
    }
}

/// Every document id of a segment, `DOC_ID_MIN..=docs_count`.
pub struct AllDocsDocIter {
    docs_count: DocId,
    current: DocId,
}

impl AllDocsDocIter {
    pub fn new(docs_count: DocId) -> AllDocsDocIter {
        AllDocsDocIter {
            docs_count,
            current: 0,
        }
    }
}

impl DocIter for AllDocsDocIter {
    fn current_doc(&self) -> Option<DocId> {
        if self.current == 0 || self.current > self.docs_count {
            None
        } else {
            Some(self.current)
        }
    }

    fn next_doc(&mut self) -> Result<Option<DocId>, Error> {
        if self.current >= self.docs_count {
            self.current = self.docs_count + 1;
            Ok(None)
        } else {
            self.current += 1;
            Ok(Some(self.current))
        }
    }

    fn advance(&mut self, target: DocId) -> Result<Option<DocId>, Error> {
        if target > self.current {
            self.current = target - 1;
        }
        self.next_doc()
    }
}

pub struct EmptyDocIter;

impl DocIter for EmptyDocIter {
    fn current_doc(&self) -> Option<DocId> {
        None
    }

    fn next_doc(&mut self) -> Result<Option<DocId>, Error> {
        Ok(None)
    }
}

/// Drains `iter` into a vector.
pub fn collect_docs(iter: &mut dyn DocIter) -> Result<Vec<DocId>, Error> {
    let mut docs = Vec::new();
    while let Some(doc) = iter.next_doc()? {
        docs.push(doc);
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_docs_starts_at_one() {
        let mut iter = AllDocsDocIter::new(3);
        assert_eq!(None, iter.current_doc());
        assert_eq!(vec![1, 2, 3], collect_docs(&mut iter).unwrap());
        assert_eq!(None, iter.current_doc());
    }

    #[test]
    fn advance_skips_ahead() {
        let mut iter = VecDocIter::new(vec![1, 4, 9]);
        assert_eq!(Some(4), iter.advance(3).unwrap());
        assert_eq!(Some(4), iter.current_doc());
        assert_eq!(Some(9), iter.next_doc().unwrap());
        assert_eq!(None, iter.next_doc().unwrap());

        let mut all = AllDocsDocIter::new(10);
        assert_eq!(Some(7), all.advance(7).unwrap());
        assert_eq!(Some(8), all.next_doc().unwrap());
        assert_eq!(None, all.advance(11).unwrap());
    }
}
