//! DuckDuckGo search backend
//!
//! Uses the Instant Answer JSON API: no key, no HTML scraping. Results are the
//! abstract (when present) followed by related topics, flattened.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use threadline_core::error::{AgentError, Result};
use threadline_core::tool::{SearchBackend, SearchHit};

const API_URL: &str = "https://api.duckduckgo.com/";
const USER_AGENT: &str = concat!("threadline/", env!("CARGO_PKG_VERSION"));

/// Search backend for the `web_search` tool
pub struct DuckDuckGoSearch {
    client: reqwest::Client,
    api_url: String,
}

impl DuckDuckGoSearch {
    pub fn new() -> Result<Self> {
        Self::with_api_url(API_URL)
    }

    /// Point at a different endpoint (a proxy or a local fake)
    pub fn with_api_url(api_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AgentError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_url: api_url.into(),
        })
    }
}

#[async_trait]
impl SearchBackend for DuckDuckGoSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await
            .map_err(|e| AgentError::ToolExecution(format!("search request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AgentError::ToolExecution(format!(
                "DuckDuckGo returned status {}",
                response.status()
            )));
        }

        let answer: InstantAnswer = response
            .json()
            .await
            .map_err(|e| AgentError::ToolExecution(format!("unreadable search response: {e}")))?;

        let hits = answer.into_hits(max_results);
        tracing::debug!(query, hits = hits.len(), "DuckDuckGo search");
        Ok(hits)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstantAnswer {
    #[serde(default)]
    heading: String,
    #[serde(default)]
    abstract_text: String,
    #[serde(rename = "AbstractURL", default)]
    abstract_url: String,
    #[serde(default)]
    related_topics: Vec<RelatedTopic>,
}

/// Either a leaf topic or a named group of topics
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RelatedTopic {
    Leaf {
        #[serde(rename = "Text")]
        text: String,
        #[serde(rename = "FirstURL", default)]
        first_url: String,
    },
    Group {
        #[serde(rename = "Topics")]
        topics: Vec<RelatedTopic>,
    },
}

impl RelatedTopic {
    fn flatten_into(self, out: &mut Vec<SearchHit>) {
        match self {
            Self::Leaf { text, first_url } if !text.trim().is_empty() => {
                // Topic text reads "Title - description"
                let title = text
                    .split_once(" - ")
                    .map_or_else(|| text.clone(), |(title, _)| title.to_string());
                out.push(SearchHit {
                    title,
                    url: first_url,
                    snippet: text,
                });
            }
            Self::Leaf { .. } => {}
            Self::Group { topics } => {
                for topic in topics {
                    topic.flatten_into(out);
                }
            }
        }
    }
}

impl InstantAnswer {
    fn into_hits(self, max_results: usize) -> Vec<SearchHit> {
        let mut hits = Vec::new();
        if !self.abstract_text.trim().is_empty() {
            hits.push(SearchHit {
                title: self.heading,
                url: self.abstract_url,
                snippet: self.abstract_text,
            });
        }
        for topic in self.related_topics {
            topic.flatten_into(&mut hits);
        }
        hits.truncate(max_results);
        hits
    }
}
