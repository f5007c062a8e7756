use std::cmp::Ordering;
use std::fmt;

/// Total order over raw sort values, deciding the physical order of documents in a segment.
pub trait Comparator: Send + Sync + fmt::Debug {
    /// Stored in segment metas, so segments sorted by different comparators can be told apart.
    fn name(&self) -> &str;
    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BytesComparator;

impl Comparator for BytesComparator {
    fn name(&self) -> &str {
        "bytes"
    }

    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        lhs.cmp(rhs)
    }
}

#[derive(Clone, Debug)]
pub struct ReverseComparator<C> {
    inner: C,
    name: String,
}

impl<C: Comparator> ReverseComparator<C> {
    pub fn new(inner: C) -> ReverseComparator<C> {
        let name = format!("reverse:{}", inner.name());
        ReverseComparator { inner, name }
    }
}

impl<C: Comparator> Comparator for ReverseComparator<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        self.inner.compare(lhs, rhs).reverse()
    }
}

/// Orders documents by optional sort values: valued documents first by the comparator, then
/// documents without a value. Ties keep the original order, given by `lhs.0` and `rhs.0`.
pub(crate) fn compare_docs<K: Ord>(
    comparator: &dyn Comparator,
    lhs: &(K, Option<&[u8]>),
    rhs: &(K, Option<&[u8]>),
) -> Ordering {
    let by_value = match (lhs.1, rhs.1) {
        (Some(l), Some(r)) => comparator.compare(l, r),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_value.then_with(|| lhs.0.cmp(&rhs.0))
}
