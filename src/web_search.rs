//! Single-pass web search pre-flight: decide, search, optionally read, augment.
//!
//! Every failure degrades to "no search"; the turn then runs on the original message.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::UserPreferences;
use crate::llm_client::{generate_json, GenerationOptions, LanguageModel};
use crate::streaming::{Source, StepStatus, TurnStream};
use crate::tools::fetch::{html_to_text, truncate_chars};

pub const MAX_SEARCH_RESULTS: usize = 5;
pub const DEEP_READ_PAGES: usize = 2;
pub const DEEP_READ_CHARS: usize = 1500;
pub const SNIPPET_SCORE: f64 = 100.0;
const DECISION_MAX_TOKENS: u32 = 100;

const DECISION_SYSTEM_PROMPT: &str = "You decide whether answering a message needs a web search. \
Given the user message, do you need to search? Reply JSON {\"search\": bool, \"query\": string} and nothing else.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCredentials {
    pub api_key: String,
    pub engine_id: String,
}

impl SearchCredentials {
    pub fn from_preferences(prefs: &UserPreferences) -> Option<Self> {
        let api_key = prefs.google_api_key.as_deref()?.trim();
        let engine_id = prefs.google_cse_id.as_deref()?.trim();
        if api_key.is_empty() || engine_id.is_empty() {
            return None;
        }
        Some(Self {
            api_key: api_key.to_string(),
            engine_id: engine_id.to_string(),
        })
    }
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        query: &str,
        credentials: &SearchCredentials,
        limit: usize,
    ) -> Result<Vec<SearchResult>>;
}

#[async_trait]
pub trait PageReader: Send + Sync {
    async fn read(&self, url: &str) -> Result<String>;
}

/// Google Programmable Search (`customsearch/v1`).
pub struct GoogleSearchProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl GoogleSearchProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: "https://www.googleapis.com/customsearch/v1".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct GoogleResponse {
    #[serde(default)]
    items: Vec<SearchResult>,
}

#[async_trait]
impl SearchProvider for GoogleSearchProvider {
    async fn search(
        &self,
        query: &str,
        credentials: &SearchCredentials,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let num = limit.clamp(1, 10).to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("key", credentials.api_key.as_str()),
                ("cx", credentials.engine_id.as_str()),
                ("q", query),
                ("num", num.as_str()),
            ])
            .send()
            .await
            .context("Search request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Search provider returned HTTP {}", status.as_u16());
        }
        let parsed: GoogleResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;
        Ok(parsed.items.into_iter().take(limit).collect())
    }
}

/// Downloads a page and reduces it to text.
pub struct HttpPageReader {
    client: reqwest::Client,
}

impl HttpPageReader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageReader for HttpPageReader {
    async fn read(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;
        if !response.status().is_success() {
            anyhow::bail!("{} returned HTTP {}", url, response.status().as_u16());
        }
        let body = response.text().await.context("Failed to read page body")?;
        Ok(html_to_text(&body))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SearchDecision {
    #[serde(default)]
    pub search: bool,
    #[serde(default)]
    pub query: String,
}

/// The replacement user message plus its citations.
#[derive(Debug, Clone, PartialEq)]
pub struct WebAugmentation {
    pub query: String,
    pub prompt: String,
    pub sources: Vec<Source>,
}

pub struct WebSearchAgent {
    provider: Arc<dyn SearchProvider>,
    reader: Option<Arc<dyn PageReader>>,
}

impl WebSearchAgent {
    pub fn new(provider: Arc<dyn SearchProvider>, reader: Option<Arc<dyn PageReader>>) -> Self {
        Self { provider, reader }
    }

    /// Runs the pre-flight. `None` means the original message should be used as is.
    pub async fn augment(
        &self,
        model: &dyn LanguageModel,
        prefs: &UserPreferences,
        user_message: &str,
        stream: &mut TurnStream,
    ) -> Option<WebAugmentation> {
        let Some(credentials) = SearchCredentials::from_preferences(prefs) else {
            tracing::info!("Web search enabled but no search credentials are configured");
            return None;
        };

        let decision: SearchDecision = match generate_json(
            model,
            DECISION_SYSTEM_PROMPT,
            user_message,
            &GenerationOptions::deterministic(DECISION_MAX_TOKENS),
        )
        .await
        {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!("Search decision failed: {:#}", e);
                return None;
            }
        };
        let query = decision.query.trim();
        if !decision.search || query.is_empty() {
            tracing::debug!("Search decision: no search needed");
            return None;
        }

        let step = stream.step_start(format!("Searching the web for \"{}\"", query));
        let results = match self
            .provider
            .search(query, &credentials, MAX_SEARCH_RESULTS)
            .await
        {
            Ok(results) if !results.is_empty() => results,
            Ok(_) => {
                stream.step_end(&step, "No search results", StepStatus::Failure);
                return None;
            }
            Err(e) => {
                tracing::warn!("Web search failed: {:#}", e);
                stream.step_end(&step, "Web search failed", StepStatus::Failure);
                return None;
            }
        };

        let pages = if prefs.web_search_deep_analysis {
            self.read_pages(&results).await
        } else {
            Vec::new()
        };

        let context = build_search_context(&results, &pages);
        let sources: Vec<Source> = results
            .iter()
            .map(|result| Source {
                title: result.title.clone(),
                source: result.link.clone(),
                content: result.snippet.clone(),
                score: SNIPPET_SCORE,
            })
            .collect();
        stream.sources(sources.clone());
        stream.step_end(
            &step,
            format!("Found {} results", results.len()),
            StepStatus::Success,
        );

        Some(WebAugmentation {
            query: query.to_string(),
            prompt: build_augmented_prompt(user_message, &context),
            sources,
        })
    }

    /// Text of the top pages; unreadable pages are skipped.
    async fn read_pages(&self, results: &[SearchResult]) -> Vec<(usize, String)> {
        let Some(reader) = self.reader.as_ref() else {
            return Vec::new();
        };
        let mut pages = Vec::new();
        for (index, result) in results.iter().enumerate().take(DEEP_READ_PAGES) {
            match reader.read(&result.link).await {
                Ok(text) => {
                    let (text, _) = truncate_chars(text.trim(), DEEP_READ_CHARS);
                    if !text.is_empty() {
                        pages.push((index, text));
                    }
                }
                Err(e) => tracing::debug!("Skipping page {}: {:#}", result.link, e),
            }
        }
        pages
    }
}

pub fn build_search_context(results: &[SearchResult], pages: &[(usize, String)]) -> String {
    let mut context = String::new();
    for (index, result) in results.iter().enumerate() {
        context.push_str(&format!(
            "[{}] {} ({})\n{}\n",
            index + 1,
            result.title,
            result.link,
            result.snippet.trim()
        ));
        if let Some((_, page)) = pages.iter().find(|(i, _)| *i == index) {
            context.push_str("Page content: ");
            context.push_str(page);
            context.push('\n');
        }
        context.push('\n');
    }
    context.trim_end().to_string()
}

pub fn build_augmented_prompt(user_message: &str, context: &str) -> String {
    format!(
        "{}\n\n[Context from Web Search]:\n{}\n\n[Instruction]: Answer using the context. Cite sources.",
        user_message, context
    )
}
