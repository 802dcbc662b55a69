//! Keyword-based intent routing.

use async_trait::async_trait;
use duplex_voice::{IntentClassifier, Verdict};
use tracing::debug;

/// Routes a query to the local agent when it names one of the keywords or runs long.
pub struct KeywordClassifier {
    keywords: Vec<String>,
    long_query_words: usize,
}

impl KeywordClassifier {
    pub fn new(keywords: impl IntoIterator<Item = String>, long_query_words: usize) -> Self {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            long_query_words,
        }
    }

    pub fn verdict(&self, text: &str) -> Verdict {
        let lowered = text.to_lowercase();
        if let Some(keyword) = self.keywords.iter().find(|k| lowered.contains(k.as_str())) {
            debug!(keyword = %keyword, "Query matched agent keyword");
            return Verdict::Complex;
        }
        if self.long_query_words > 0 && text.split_whitespace().count() > self.long_query_words {
            return Verdict::Complex;
        }
        Verdict::Simple
    }
}

#[async_trait]
impl IntentClassifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Verdict {
        self.verdict(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> KeywordClassifier {
        KeywordClassifier::new(
            vec!["Weather".to_string(), " look up ".to_string(), String::new()],
            12,
        )
    }

    #[test]
    fn test_keywords_case_insensitive() {
        let c = classifier();
        assert_eq!(c.verdict("what's the WEATHER tomorrow"), Verdict::Complex);
        assert_eq!(c.verdict("please look up the train times"), Verdict::Complex);
        assert_eq!(c.verdict("tell me a joke"), Verdict::Simple);
    }

    #[test]
    fn test_empty_keyword_ignored() {
        let c = KeywordClassifier::new(vec![String::new()], 0);
        assert_eq!(c.verdict("anything at all"), Verdict::Simple);
    }

    #[test]
    fn test_long_queries_go_to_agent() {
        let c = classifier();
        let long = "one two three four five six seven eight nine ten eleven twelve thirteen";
        assert_eq!(c.verdict(long), Verdict::Complex);
    }

    #[tokio::test]
    async fn test_trait_classify() {
        let c: Box<dyn IntentClassifier> = Box::new(classifier());
        assert_eq!(c.classify("weather in Oslo").await, Verdict::Complex);
    }
}
