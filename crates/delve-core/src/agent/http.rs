use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{EngineOutput, EngineRequest, RawTraceEvent, ResearchEngine};
use crate::error::AgentExecutionError;
use crate::events::AgentEventCollector;
use crate::security::SecretValue;

const RUN_ID_HEADER: &str = "x-run-id";
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Research engine served over HTTP at `<endpoint>/research`.
pub struct HttpResearchEngine {
    endpoint: String,
    model: String,
    api_key: Option<SecretValue>,
    client: Client,
}

#[derive(Serialize)]
struct ResearchPayload<'a> {
    query: &'a str,
    run_label: &'a str,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ResearchResponse {
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    final_report: Option<String>,
    #[serde(default)]
    trace: Vec<RawTraceEvent>,
    #[serde(default)]
    usage: Vec<UsageEntry>,
}

#[derive(Debug, Deserialize)]
struct UsageEntry {
    model: String,
    #[serde(default, alias = "prompt_tokens")]
    input_tokens: u64,
    #[serde(default, alias = "completion_tokens")]
    output_tokens: u64,
}

impl HttpResearchEngine {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretValue>,
    ) -> Self {
        Self::with_client(endpoint, model, api_key, Client::new())
    }

    pub fn with_client(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretValue>,
        client: Client,
    ) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self {
            endpoint,
            model: model.into(),
            api_key,
            client,
        }
    }

    fn url(&self) -> String {
        format!("{}/research", self.endpoint)
    }
}

#[async_trait]
impl ResearchEngine for HttpResearchEngine {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(
        &self,
        request: EngineRequest,
        events: AgentEventCollector,
    ) -> Result<EngineOutput, AgentExecutionError> {
        let payload = ResearchPayload {
            query: &request.query,
            run_label: &request.run_label,
            model: &self.model,
            trace_id: request.trace_id.as_deref(),
        };

        let mut builder = self.client.post(self.url()).json(&payload);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose());
        }

        debug!(url = %self.url(), "dispatching research request");
        let response = builder.send().await.map_err(|err| {
            error!(error = %err, "research request failed to send");
            AgentExecutionError::transport(err.to_string())
        })?;

        let status = response.status();
        let header_run_id = response
            .headers()
            .get(RUN_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(upstream_error(status, &body, header_run_id));
        }

        let body = response.text().await.map_err(|err| AgentExecutionError::Transport {
            message: format!("failed to read research response: {err}"),
            trace_id: header_run_id.clone(),
        })?;

        let parsed: ResearchResponse =
            serde_json::from_str(&body).map_err(|err| AgentExecutionError::MalformedOutput {
                message: format!("undecodable research response: {err}"),
                trace_id: header_run_id.clone(),
            })?;

        for usage in &parsed.usage {
            events.emit_token_usage(usage.model.clone(), usage.input_tokens, usage.output_tokens);
        }

        let run_id = parsed.run_id.or(header_run_id);
        let final_report = parsed
            .final_report
            .filter(|report| !report.trim().is_empty())
            .ok_or_else(|| AgentExecutionError::MalformedOutput {
                message: "research response carried no final report".to_string(),
                trace_id: run_id.clone(),
            })?;

        Ok(EngineOutput {
            final_report,
            trace: parsed.trace,
            run_id,
        })
    }
}

fn upstream_error(status: StatusCode, body: &str, trace_id: Option<String>) -> AgentExecutionError {
    let message: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    error!(status = status.as_u16(), body = %message, "research engine rejected request");
    AgentExecutionError::Upstream {
        status: status.as_u16(),
        message,
        trace_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_classify_by_status() {
        let busy = upstream_error(StatusCode::SERVICE_UNAVAILABLE, "busy", None);
        assert!(busy.is_retryable());
        let throttled = upstream_error(StatusCode::TOO_MANY_REQUESTS, "slow down", None);
        assert!(throttled.is_retryable());
        let rejected = upstream_error(StatusCode::UNPROCESSABLE_ENTITY, "bad query", Some("r1".into()));
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.trace_id(), Some("r1"));
    }

    #[test]
    fn response_accepts_openai_style_usage() {
        let parsed: ResearchResponse = serde_json::from_str(
            r#"{"final_report":"ok","usage":[{"model":"gpt-4o","prompt_tokens":12,"completion_tokens":3}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.usage[0].input_tokens, 12);
        assert_eq!(parsed.usage[0].output_tokens, 3);
        assert!(parsed.trace.is_empty());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_failure() {
        let engine = HttpResearchEngine::new("http://127.0.0.1:9", "gpt-4o", None);
        let (events, _rx) = AgentEventCollector::new();
        let err = engine
            .execute(
                EngineRequest {
                    query: "q".into(),
                    run_label: "l".into(),
                    trace_id: None,
                },
                events,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentExecutionError::Transport { .. }));
    }
}
