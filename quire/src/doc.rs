use serde::de::{self, Visitor};
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use crate::analyzis::{Analyzer, NoopAnalyzer, UAX29Analyzer};
use crate::meta::IndexFeatures;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldValue {
    String(String),
}

impl FieldValue {
    pub fn as_str(&self) -> &str {
        match *self {
            FieldValue::String(ref value) => value,
        }
    }
}

/// A loosely typed document, as read from JSON input.
pub type Doc = HashMap<String, FieldValue>;

impl Serialize for FieldValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match *self {
            FieldValue::String(ref value) => serializer.serialize_str(&value),
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D>(deserializer: D) -> Result<FieldValue, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(FieldValueVisitor)
    }
}

struct FieldValueVisitor;

impl<'de> Visitor<'de> for FieldValueVisitor {
    type Value = FieldValue;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("A string value")
    }

    fn visit_str<E>(self, value: &str) -> Result<FieldValue, E>
    where
        E: de::Error,
    {
        Ok(FieldValue::String(String::from(value)))
    }
}

/// A named value which can be indexed (tokenized into terms) and/or stored.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
    pub features: IndexFeatures,
    pub analyzer: Box<dyn Analyzer>,
}

impl Field {
    /// Full text: word tokens with frequencies and positions.
    pub fn text<N: Into<String>, V: Into<String>>(name: N, value: V) -> Field {
        Field {
            name: name.into(),
            value: FieldValue::String(value.into()),
            features: IndexFeatures::ALL,
            analyzer: Box::new(UAX29Analyzer),
        }
    }

    /// An exact value indexed as a single term.
    pub fn string<N: Into<String>, V: Into<String>>(name: N, value: V) -> Field {
        Field {
            name: name.into(),
            value: FieldValue::String(value.into()),
            features: IndexFeatures::NONE,
            analyzer: Box::new(NoopAnalyzer),
        }
    }

    pub fn with_analyzer(mut self, analyzer: Box<dyn Analyzer>) -> Field {
        self.analyzer = analyzer;
        self
    }

    pub fn with_features(mut self, features: IndexFeatures) -> Field {
        self.features = features;
        self
    }

    pub fn tokens<'a>(&'a self) -> Box<dyn Iterator<Item = Cow<'a, str>> + 'a> {
        self.analyzer.analyze(self.value.as_str())
    }

    pub fn value_bytes(&self) -> &[u8] {
        self.value.as_str().as_bytes()
    }
}

/// Turns every value of `doc` into a full text field, ordered by name.
pub fn text_fields(doc: &Doc) -> Vec<Field> {
    let mut fields: Vec<Field> = doc
        .iter()
        .map(|(name, value)| Field::text(name.clone(), value.as_str()))
        .collect();
    fields.sort_by(|a, b| a.name.cmp(&b.name));
    fields
}

#[cfg(test)]
mod tests {

    use super::*;
    use proptest::collection::hash_map;
    use proptest::prelude::*;
    use rmps::{Deserializer, Serializer};
    use serde::{Deserialize, Serialize};

    fn arb_fieldvalue() -> BoxedStrategy<FieldValue> {
        prop_oneof![".*".prop_map(FieldValue::String),].boxed()
    }

    fn arb_fieldname() -> BoxedStrategy<String> {
        "[a-z]+".prop_map(|s| s).boxed()
    }

    fn arb_doc() -> BoxedStrategy<Doc> {
        hash_map(arb_fieldname(), arb_fieldvalue(), 0..100).boxed()
    }

    proptest! {
        #[test]
        fn serializes_doc_correct(ref doc in arb_doc()) {
            let mut buf = Vec::new();
            doc.serialize(&mut Serializer::new(&mut buf)).unwrap();
            let mut de = Deserializer::new(&buf[..]);
            let read: Doc = Deserialize::deserialize(&mut de).unwrap();
            prop_assert_eq!(doc, &read);
        }
    }

    #[test]
    fn text_fields_are_sorted_and_tokenized() {
        let mut doc = Doc::new();
        doc.insert("title".to_string(), FieldValue::String("Quire Book".to_string()));
        doc.insert("body".to_string(), FieldValue::String("a b".to_string()));
        let fields = text_fields(&doc);
        assert_eq!("body", fields[0].name);
        let tokens: Vec<String> = fields[1].tokens().map(|t| t.into_owned()).collect();
        assert_eq!(vec!["quire", "book"], tokens);
    }

    #[test]
    fn string_field_is_one_term() {
        let field = Field::string("id", "A 1");
        assert_eq!(1, field.tokens().count());
        assert_eq!(IndexFeatures::NONE, field.features);
    }
}
