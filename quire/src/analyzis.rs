use std::borrow::Cow;
use std::fmt::Debug;
use std::iter;
use unicode_segmentation::UnicodeSegmentation;

/// Turns a field value into the tokens that get indexed.
pub trait Analyzer: AnalyzerClone + Send + Sync + Debug {
    fn analyzer_type(&self) -> &'static str;
    fn analyze<'a>(&self, value: &'a str) -> Box<dyn Iterator<Item = Cow<'a, str>> + 'a>;
}

impl dyn Analyzer {
    pub fn for_name(name: &str) -> Option<Box<dyn Analyzer>> {
        match name {
            "uax29" => Some(Box::new(UAX29Analyzer)),
            "whitespace" => Some(Box::new(WhiteSpaceAnalyzer)),
            "noop" => Some(Box::new(NoopAnalyzer)),
            _ => None,
        }
    }
}

pub trait AnalyzerClone {
    fn clone_box(&self) -> Box<dyn Analyzer>;
}

impl<T> AnalyzerClone for T
where
    T: 'static + Analyzer + Clone,
{
    fn clone_box(&self) -> Box<dyn Analyzer> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn Analyzer> {
    fn clone(&self) -> Box<dyn Analyzer> {
        self.clone_box()
    }
}

/// Splits on unicode word boundaries and lowercases.
#[derive(Clone, Debug, Default)]
pub struct UAX29Analyzer;

impl Analyzer for UAX29Analyzer {
    fn analyzer_type(&self) -> &'static str {
        "uax29"
    }

    fn analyze<'a>(&self, value: &'a str) -> Box<dyn Iterator<Item = Cow<'a, str>> + 'a> {
        Box::new(
            value
                .split_word_bounds()
                .filter(|token| !is_only_whitespace_or_control_char(token))
                .map(|token| {
                    if token.find(char::is_uppercase).is_some() {
                        Cow::Owned(token.to_lowercase())
                    } else {
                        Cow::Borrowed(token)
                    }
                }),
        )
    }
}

fn is_only_whitespace_or_control_char(s: &str) -> bool {
    s.chars().all(|c| c.is_whitespace() || c.is_control())
}

#[derive(Clone, Debug, Default)]
pub struct WhiteSpaceAnalyzer;

impl Analyzer for WhiteSpaceAnalyzer {
    fn analyzer_type(&self) -> &'static str {
        "whitespace"
    }

    fn analyze<'a>(&self, value: &'a str) -> Box<dyn Iterator<Item = Cow<'a, str>> + 'a> {
        Box::new(value.split_whitespace().map(Cow::Borrowed))
    }
}

/// The whole value is a single token.
#[derive(Clone, Debug, Default)]
pub struct NoopAnalyzer;

impl Analyzer for NoopAnalyzer {
    fn analyzer_type(&self) -> &'static str {
        "noop"
    }

    fn analyze<'a>(&self, value: &'a str) -> Box<dyn Iterator<Item = Cow<'a, str>> + 'a> {
        Box::new(iter::once(Cow::Borrowed(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(analyzer: &dyn Analyzer, value: &str) -> Vec<String> {
        analyzer.analyze(value).map(|t| t.into_owned()).collect()
    }

    #[test]
    fn uax29_lowercases_and_drops_whitespace() {
        assert_eq!(
            vec!["hello", ",", "world"],
            tokens(&UAX29Analyzer, "Hello, World")
        );
    }

    #[test]
    fn noop_keeps_value() {
        assert_eq!(vec!["Hello, World"], tokens(&NoopAnalyzer, "Hello, World"));
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(
            "whitespace",
            <dyn Analyzer>::for_name("whitespace").unwrap().analyzer_type()
        );
        assert!(<dyn Analyzer>::for_name("snowball").is_none());
    }
}
