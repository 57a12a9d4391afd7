//! Bounded-length summarization used for both research reports and
//! uploaded documents.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DocumentError;
use crate::security::SecretValue;

/// Input sent to a remote summarizer is capped to keep requests small.
const MAX_LLM_INPUT_CHARS: usize = 24_000;

static SENTENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?](\s|$)").expect("invalid sentence regex"));

#[async_trait]
pub trait Summarizer: Send + Sync {
    fn name(&self) -> &str;

    /// Summarize `text` into at most `max_chars` characters.
    async fn summarize(&self, text: &str, max_chars: usize) -> Result<String, DocumentError>;
}

/// Keeps the leading sentences that fit the bound.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractiveSummarizer;

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn summarize(&self, text: &str, max_chars: usize) -> Result<String, DocumentError> {
        let summary = bound_text(text, max_chars);
        if summary.is_empty() && !text.trim().is_empty() && max_chars > 0 {
            return Err(DocumentError::Summarization(
                "summary collapsed to nothing".to_string(),
            ));
        }
        Ok(summary)
    }
}

/// Normalise whitespace and cut at the last sentence boundary that fits.
/// Falls back to a hard cut with an ellipsis when the first sentence alone
/// exceeds the bound. The result never exceeds `max_chars` characters.
pub fn bound_text(text: &str, max_chars: usize) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.chars().count() <= max_chars {
        return normalized;
    }
    if max_chars == 0 {
        return String::new();
    }

    let mut cut = None;
    for found in SENTENCE_END.find_iter(&normalized) {
        let end = found.start() + 1;
        if normalized[..end].chars().count() > max_chars {
            break;
        }
        cut = Some(end);
    }

    match cut {
        Some(end) => normalized[..end].to_string(),
        None => {
            let mut truncated: String = normalized.chars().take(max_chars - 1).collect();
            truncated = truncated.trim_end().to_string();
            truncated.push('…');
            truncated
        }
    }
}

/// Summarizes through an OpenAI-compatible chat completions endpoint.
pub struct LlmSummarizer {
    endpoint: String,
    model: String,
    api_key: Option<SecretValue>,
    client: Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl LlmSummarizer {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<SecretValue>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    fn name(&self) -> &str {
        "llm"
    }

    async fn summarize(&self, text: &str, max_chars: usize) -> Result<String, DocumentError> {
        let input: String = text.chars().take(MAX_LLM_INPUT_CHARS).collect();
        let request = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: format!(
                        "Summarize the user's text in plain prose using at most {max_chars} characters. Keep concrete facts and figures."
                    ),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: input,
                },
            ],
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose());
        }

        debug!(%url, model = %self.model, "requesting summary");
        let response = builder
            .send()
            .await
            .map_err(|err| DocumentError::Summarization(format!("request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "summarizer rejected request");
            return Err(DocumentError::Summarization(format!(
                "summarizer returned HTTP {status}: {}",
                body.chars().take(256).collect::<String>()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| DocumentError::Summarization(format!("undecodable response: {err}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| DocumentError::Summarization("summarizer returned no text".to_string()))?;

        Ok(bound_text(&content, max_chars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_only_normalised() {
        assert_eq!(bound_text("  a   b\n c ", 100), "a b c");
    }

    #[test]
    fn cuts_at_sentence_boundary() {
        let text = "First sentence. Second sentence is here. Third one runs long.";
        assert_eq!(bound_text(text, 45), "First sentence. Second sentence is here.");
    }

    #[test]
    fn hard_cut_when_first_sentence_is_too_long() {
        let text = "x".repeat(50);
        let bounded = bound_text(&text, 10);
        assert_eq!(bounded.chars().count(), 10);
        assert!(bounded.ends_with('…'));
    }

    #[test]
    fn never_exceeds_bound() {
        let text = "Lorem ipsum dolor sit amet. ".repeat(200);
        for max in [1, 7, 64, 1000] {
            assert!(bound_text(&text, max).chars().count() <= max, "max {max}");
        }
    }

    #[tokio::test]
    async fn extractive_summarizer_bounds_reports() {
        let report = "The market grew. ".repeat(100);
        let summary = ExtractiveSummarizer.summarize(&report, 1000).await.unwrap();
        assert!(summary.chars().count() <= 1000);
        assert!(summary.ends_with('.'));
    }
}
