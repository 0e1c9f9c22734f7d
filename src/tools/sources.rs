//! Citation sources gathered from search-type tool results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A citation-worthy reference attached to a delivered message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub title: String,
    pub url: String,
}

/// Pull sources out of a search tool's JSON output.
///
/// Accepts either `{"results": [...]}` or a bare array; each entry needs a
/// non-empty `url` and falls back to the URL when `title` is missing.
pub fn extract_sources(output: &Value) -> Vec<Source> {
    let entries = match output {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("results").and_then(Value::as_array) {
            Some(items) => items.as_slice(),
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    entries
        .iter()
        .filter_map(|entry| {
            let url = entry.get("url").and_then(Value::as_str)?.trim();
            if url.is_empty() {
                return None;
            }
            let title = entry
                .get("title")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(url);
            Some(Source {
                title: title.to_string(),
                url: url.to_string(),
            })
        })
        .collect()
}

/// Ordered, URL-deduplicated set of sources for one run.
#[derive(Debug, Clone, Default)]
pub struct SourceCollector {
    sources: Vec<Source>,
}

impl SourceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add sources, skipping URLs already collected. Returns how many were new.
    pub fn extend<I: IntoIterator<Item = Source>>(&mut self, sources: I) -> usize {
        let before = self.sources.len();
        for source in sources {
            if !self.sources.iter().any(|s| s.url == source.url) {
                self.sources.push(source);
            }
        }
        self.sources.len() - before
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn as_slice(&self) -> &[Source] {
        &self.sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_from_results_object() {
        let output = json!({
            "query": "tides",
            "results": [
                {"title": "Tide tables", "url": "https://tides.example/a", "snippet": "..."},
                {"url": "https://tides.example/b"},
                {"title": "no url"}
            ]
        });

        let sources = extract_sources(&output);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].title, "Tide tables");
        assert_eq!(sources[1].title, "https://tides.example/b");
    }

    #[test]
    fn non_search_shapes_yield_nothing() {
        assert!(extract_sources(&json!("plain text")).is_empty());
        assert!(extract_sources(&json!({"status": "ok"})).is_empty());
    }

    #[test]
    fn collector_dedupes_by_url() {
        let mut collector = SourceCollector::new();
        let a = Source {
            title: "A".to_string(),
            url: "https://a.example".to_string(),
        };
        let a_again = Source {
            title: "A (mirror title)".to_string(),
            url: "https://a.example".to_string(),
        };

        assert_eq!(collector.extend(vec![a.clone()]), 1);
        assert_eq!(collector.extend(vec![a_again]), 0);
        assert_eq!(collector.as_slice(), &[a]);
    }
}
