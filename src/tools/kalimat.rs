//! Search tools backed by the Kalimat API.
//!
//! `search_quran` and `search_hadith` query the same endpoint with a
//! different corpus selector. Results come back as document blocks with the
//! citation id, Arabic text and English text embedded in the metadata so
//! the UI can render references.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, info};

use crate::history::DocumentBlock;

use super::Tool;

const KALIMAT_BASE_URL: &str = "https://api.kalimat.dev/search";
const DEFAULT_NUM_RESULTS: u32 = 10;

/// Corpus selector understood by the Kalimat API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Corpus {
    Quran,
    Hadith,
}

impl Corpus {
    fn get_text(self) -> u8 {
        match self {
            Self::Quran => 1,
            Self::Hadith => 2,
        }
    }
}

/// One search hit as returned by Kalimat.
#[derive(Debug, Deserialize)]
struct KalimatHit {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    en_text: Option<String>,
}

/// Pooled HTTP client for the Kalimat search service.
pub struct KalimatClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl KalimatClient {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, KALIMAT_BASE_URL)
    }

    #[must_use]
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    async fn search(&self, query: &str, corpus: Corpus) -> anyhow::Result<Vec<DocumentBlock>> {
        debug!(query = %query, corpus = ?corpus, "Kalimat search");

        let num_results = DEFAULT_NUM_RESULTS.to_string();
        let get_text = corpus.get_text().to_string();
        let response = self
            .http
            .get(&self.base_url)
            .header("x-api-key", &self.api_key)
            .query(&[
                ("query", query),
                ("numResults", num_results.as_str()),
                ("getText", get_text.as_str()),
            ])
            .send()
            .await
            .context("Kalimat request failed")?
            .error_for_status()
            .context("Kalimat returned error status")?;

        let hits: Vec<KalimatHit> = response
            .json()
            .await
            .context("failed to parse Kalimat response")?;

        info!(query = %query, hits = hits.len(), "Kalimat search complete");

        Ok(hits.into_iter().map(|hit| to_document(hit, query)).collect())
    }
}

fn to_document(hit: KalimatHit, query: &str) -> DocumentBlock {
    let citation = hit.id.unwrap_or_else(|| "Unknown".to_string());
    let arabic = hit.text.unwrap_or_else(|| "Not retrieved".to_string());
    let english = hit.en_text.unwrap_or_else(|| "Not retrieved".to_string());

    DocumentBlock::new(
        citation.clone(),
        format!("Arabic: {arabic}\n\nEnglish: {english}"),
        serde_json::json!({
            "citation": citation,
            "arabic": arabic,
            "english": english,
            "query": query,
        }),
    )
}

fn query_arg(args: &serde_json::Value) -> anyhow::Result<&str> {
    args["query"]
        .as_str()
        .filter(|q| !q.trim().is_empty())
        .context("missing required argument: query")
}

/// Search and retrieve relevant ayahs for a topic.
pub struct SearchQuran {
    client: Arc<KalimatClient>,
}

impl SearchQuran {
    #[must_use]
    pub fn new(client: Arc<KalimatClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for SearchQuran {
    fn name(&self) -> &str {
        "search_quran"
    }

    fn description(&self) -> &str {
        "Search and retrieve relevant ayahs based on a specific topic. \
         Returns multiple ayahs when applicable."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Topic or subject matter to search for within the Holy Quran. \
                        Make this as specific as possible. \
                        Do not include the word quran in the request.",
                }
            },
            "required": ["query"],
        })
    }

    async fn invoke(&self, args: serde_json::Value) -> anyhow::Result<Vec<DocumentBlock>> {
        let query = query_arg(&args)?;
        self.client.search(query, Corpus::Quran).await
    }
}

/// Search and retrieve relevant hadith for a topic.
pub struct SearchHadith {
    client: Arc<KalimatClient>,
}

impl SearchHadith {
    #[must_use]
    pub fn new(client: Arc<KalimatClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for SearchHadith {
    fn name(&self) -> &str {
        "search_hadith"
    }

    fn description(&self) -> &str {
        "Search and retrieve relevant hadith based on a specific topic. \
         Returns multiple narrations when applicable."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Topic or subject matter to search for in the hadith corpus. \
                        Make this as specific as possible.",
                }
            },
            "required": ["query"],
        })
    }

    async fn invoke(&self, args: serde_json::Value) -> anyhow::Result<Vec<DocumentBlock>> {
        let query = query_arg(&args)?;
        self.client.search(query, Corpus::Hadith).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_to_document() {
        let hit = KalimatHit {
            id: Some("2:153".to_string()),
            text: Some("arabic text".to_string()),
            en_text: Some("O you who believe, seek help through patience".to_string()),
        };
        let doc = to_document(hit, "patience");

        assert_eq!(doc.title, "2:153");
        assert!(doc.text.contains("patience"));
        assert_eq!(doc.metadata["citation"], "2:153");
        assert_eq!(doc.metadata["query"], "patience");
    }

    #[test]
    fn test_hit_with_missing_fields() {
        let hit = KalimatHit {
            id: None,
            text: None,
            en_text: None,
        };
        let doc = to_document(hit, "q");
        assert_eq!(doc.title, "Unknown");
        assert!(doc.text.contains("Not retrieved"));
    }

    #[test]
    fn test_query_arg_validation() {
        assert!(query_arg(&serde_json::json!({"query": "patience"})).is_ok());
        assert!(query_arg(&serde_json::json!({"query": "  "})).is_err());
        assert!(query_arg(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_corpus_selectors_differ() {
        assert_ne!(Corpus::Quran.get_text(), Corpus::Hadith.get_text());
    }
}
