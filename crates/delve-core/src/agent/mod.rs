//! Boundary to the external reasoning engine.
//!
//! The engine is opaque: the adapter hands it the composed query, forwards
//! every token-usage event to the run's [`CostAccountant`], captures a trace
//! identifier and reduces the engine's full trace to coarse reasoning steps.
//! Changes in an engine's wire shape stay inside its [`ResearchEngine`] impl.

mod http;
mod stub;

pub use http::HttpResearchEngine;
pub use stub::StubResearchEngine;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::cost::CostAccountant;
use crate::error::AgentExecutionError;
use crate::events::{AgentEvent, AgentEventCollector, AgentEventKind};
use crate::model::{ReasoningStep, StepType};
use crate::trace::{TraceOutcome, TraceScope, TraceSink};

const MAX_DESCRIPTION_CHARS: usize = 240;
const DELIBERATION_LABELS: &[&str] = &[
    "thought",
    "thinking",
    "reasoning",
    "llm_output",
    "deliberation",
    "scratchpad",
];
const RAW_METADATA_KEYS: &[&str] = &[
    "messages",
    "raw",
    "content",
    "prompt",
    "completion",
    "thinking",
];

/// What an engine is asked to do.
#[derive(Debug, Clone, Serialize)]
pub struct EngineRequest {
    pub query: String,
    pub run_label: String,
    /// Identifier assigned by the local trace sink, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// One node of the engine's internal trace, as reported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTraceEvent {
    pub step: String,
    #[serde(default)]
    pub summary: Option<String>,
    /// Verbatim model output. Never persisted.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl RawTraceEvent {
    pub fn new(step: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            summary: Some(summary.into()),
            ..Self::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub final_report: String,
    pub trace: Vec<RawTraceEvent>,
    /// Correlation id assigned by the engine itself.
    pub run_id: Option<String>,
}

/// Opaque external research capability.
#[async_trait]
pub trait ResearchEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        request: EngineRequest,
        events: AgentEventCollector,
    ) -> Result<EngineOutput, AgentExecutionError>;
}

/// Result of one adapter call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub final_report: String,
    pub reasoning_steps: Vec<ReasoningStep>,
    pub trace_id: Option<String>,
}

#[derive(Clone)]
pub struct ResearchAgentAdapter {
    engine: Arc<dyn ResearchEngine>,
    trace_sink: Arc<dyn TraceSink>,
    timeout: Duration,
    max_steps: usize,
}

impl ResearchAgentAdapter {
    pub fn new(
        engine: Arc<dyn ResearchEngine>,
        trace_sink: Arc<dyn TraceSink>,
        timeout: Duration,
        max_steps: usize,
    ) -> Self {
        Self {
            engine,
            trace_sink,
            timeout,
            max_steps: max_steps.max(1),
        }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    #[instrument(name = "agent.run", skip(self, enhanced_query, accountant), fields(engine = self.engine.name()))]
    pub async fn run(
        &self,
        enhanced_query: &str,
        run_label: &str,
        accountant: &mut CostAccountant,
    ) -> Result<AgentRun, AgentExecutionError> {
        let scope = TraceScope::begin_blocking(self.trace_sink.clone(), run_label).await;
        let local_trace_id = scope.trace_id().map(str::to_string);

        let (collector, mut receiver) = AgentEventCollector::new();
        let request = EngineRequest {
            query: enhanced_query.to_string(),
            run_label: run_label.to_string(),
            trace_id: local_trace_id.clone(),
        };

        let call = tokio::time::timeout(self.timeout, self.engine.execute(request, collector));
        tokio::pin!(call);

        let outcome = loop {
            tokio::select! {
                outcome = &mut call => break outcome,
                Some(event) = receiver.recv() => observe(event, accountant),
            }
        };
        while let Ok(event) = receiver.try_recv() {
            observe(event, accountant);
        }

        let output = match outcome {
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                warn!(timeout_ms, "research engine timed out");
                scope.finish_blocking(TraceOutcome::Timeout { timeout_ms }).await;
                return Err(AgentExecutionError::Timeout {
                    timeout_ms,
                    trace_id: local_trace_id,
                });
            }
            Ok(Err(err)) => {
                scope
                    .finish_blocking(TraceOutcome::Failure {
                        reason: err.to_string(),
                    })
                    .await;
                return Err(err.with_fallback_trace_id(local_trace_id));
            }
            Ok(Ok(output)) => output,
        };

        let trace_id = output.run_id.clone().or(local_trace_id);
        if output.final_report.trim().is_empty() {
            scope
                .finish_blocking(TraceOutcome::Failure {
                    reason: "empty final report".to_string(),
                })
                .await;
            return Err(AgentExecutionError::MalformedOutput {
                message: "engine returned an empty final report".to_string(),
                trace_id,
            });
        }

        scope.finish_blocking(TraceOutcome::Success).await;
        let reasoning_steps = reduce_trace(&output.trace, self.max_steps);
        info!(
            trace_id = ?trace_id,
            steps = reasoning_steps.len(),
            report_chars = output.final_report.len(),
            "research engine finished"
        );

        Ok(AgentRun {
            final_report: output.final_report,
            reasoning_steps,
            trace_id,
        })
    }
}

fn observe(event: AgentEvent, accountant: &mut CostAccountant) {
    match event.kind {
        AgentEventKind::TokenUsage {
            model,
            input_tokens,
            output_tokens,
        } => {
            debug!(%model, input_tokens, output_tokens, "token usage");
            accountant.record(&model, input_tokens, output_tokens);
        }
        AgentEventKind::Progress { node, message } => {
            debug!(%node, %message, "engine progress");
        }
    }
}

/// Collapse an engine trace into at most `max_steps` decision records.
///
/// Deliberation nodes and unknown labels are dropped, raw content never
/// survives, consecutive duplicates collapse into one step.
pub fn reduce_trace(trace: &[RawTraceEvent], max_steps: usize) -> Vec<ReasoningStep> {
    let mut steps: Vec<ReasoningStep> = Vec::new();

    for event in trace {
        let label = event.step.trim().to_ascii_lowercase();
        if DELIBERATION_LABELS.contains(&label.as_str()) {
            continue;
        }
        let Some(step_type) = StepType::from_label(&label) else {
            debug!(step = %event.step, "skipping unrecognised trace node");
            continue;
        };

        let description = event
            .summary
            .as_deref()
            .map(str::trim)
            .filter(|summary| !summary.is_empty())
            .map(truncate_description)
            .unwrap_or_else(|| step_type.default_description().to_string());

        let duplicate = steps
            .last()
            .is_some_and(|last| last.step_type == step_type && last.description == description);
        if duplicate {
            continue;
        }

        steps.push(ReasoningStep {
            index: steps.len() + 1,
            step_type,
            description,
            metadata: event.metadata.as_ref().and_then(scrub_metadata),
        });

        if steps.len() == max_steps {
            break;
        }
    }

    steps
}

fn truncate_description(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_DESCRIPTION_CHARS {
        return collapsed;
    }
    let mut truncated: String = collapsed.chars().take(MAX_DESCRIPTION_CHARS - 1).collect();
    truncated.push('…');
    truncated
}

fn scrub_metadata(metadata: &Value) -> Option<Value> {
    let Value::Object(map) = metadata else {
        return None;
    };
    let kept: serde_json::Map<String, Value> = map
        .iter()
        .filter(|(key, _)| !RAW_METADATA_KEYS.contains(&key.to_ascii_lowercase().as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(Value::Object(kept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::PricingTable;
    use crate::trace::NoopTraceSink;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedEngine {
        delay: Duration,
        result: Result<EngineOutput, AgentExecutionError>,
    }

    #[async_trait]
    impl ResearchEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(
            &self,
            _request: EngineRequest,
            events: AgentEventCollector,
        ) -> Result<EngineOutput, AgentExecutionError> {
            events.emit_token_usage("gpt-4-turbo-preview", 5000, 2000);
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    #[derive(Default)]
    struct CountingSink {
        ended: Mutex<Vec<TraceOutcome>>,
    }

    impl TraceSink for CountingSink {
        fn begin(&self, _label: &str) -> Option<String> {
            Some("local-trace".into())
        }

        fn end(&self, _trace_id: &str, outcome: &TraceOutcome) {
            self.ended.lock().unwrap().push(outcome.clone());
        }
    }

    fn accountant() -> CostAccountant {
        CostAccountant::new(Arc::new(PricingTable::builtin()), "gpt-4-turbo-preview")
    }

    fn adapter(engine: ScriptedEngine, sink: Arc<dyn TraceSink>, timeout: Duration) -> ResearchAgentAdapter {
        ResearchAgentAdapter::new(Arc::new(engine), sink, timeout, 10)
    }

    #[tokio::test]
    async fn usage_reaches_accountant_and_engine_run_id_wins() {
        let engine = ScriptedEngine {
            delay: Duration::ZERO,
            result: Ok(EngineOutput {
                final_report: "report".into(),
                trace: vec![RawTraceEvent::new("plan", "outlined sections")],
                run_id: Some("engine-run".into()),
            }),
        };
        let sink = Arc::new(CountingSink::default());
        let mut accountant = accountant();
        let run = adapter(engine, sink.clone(), Duration::from_secs(5))
            .run("query", "label", &mut accountant)
            .await
            .unwrap();

        assert_eq!(run.trace_id.as_deref(), Some("engine-run"));
        assert_eq!(run.reasoning_steps.len(), 1);
        assert_eq!(accountant.total_tokens(), 7000);
        assert_eq!(*sink.ended.lock().unwrap(), vec![TraceOutcome::Success]);
    }

    #[tokio::test]
    async fn timeout_keeps_local_trace_id_and_ends_scope() {
        let engine = ScriptedEngine {
            delay: Duration::from_secs(5),
            result: Ok(EngineOutput::default()),
        };
        let sink = Arc::new(CountingSink::default());
        let err = adapter(engine, sink.clone(), Duration::from_millis(20))
            .run("query", "label", &mut accountant())
            .await
            .unwrap_err();

        assert!(matches!(err, AgentExecutionError::Timeout { .. }));
        assert_eq!(err.trace_id(), Some("local-trace"));
        assert_eq!(
            *sink.ended.lock().unwrap(),
            vec![TraceOutcome::Timeout { timeout_ms: 20 }]
        );
    }

    #[tokio::test]
    async fn empty_report_is_malformed() {
        let engine = ScriptedEngine {
            delay: Duration::ZERO,
            result: Ok(EngineOutput {
                final_report: "   ".into(),
                ..EngineOutput::default()
            }),
        };
        let err = adapter(engine, Arc::new(NoopTraceSink), Duration::from_secs(5))
            .run("query", "label", &mut accountant())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentExecutionError::MalformedOutput { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn engine_failure_gets_fallback_trace_id() {
        let engine = ScriptedEngine {
            delay: Duration::ZERO,
            result: Err(AgentExecutionError::transport("connection refused")),
        };
        let sink = Arc::new(CountingSink::default());
        let err = adapter(engine, sink, Duration::from_secs(5))
            .run("query", "label", &mut accountant())
            .await
            .unwrap_err();
        assert_eq!(err.trace_id(), Some("local-trace"));
    }

    #[test]
    fn reduction_drops_deliberation_and_raw_content() {
        let trace = vec![
            RawTraceEvent::new("thought", "I should look at battery chemistry first"),
            RawTraceEvent::new("generate_report_plan", "Outlined four sections")
                .with_content("SYSTEM: you are a planner...")
                .with_metadata(json!({"sections": 4, "prompt": "secret prompt"})),
            RawTraceEvent::new("web_search", "Selected 6 sources"),
            RawTraceEvent::new("web_search", "Selected 6 sources"),
            RawTraceEvent::new("mystery_node", "ignored"),
            RawTraceEvent {
                step: "synthesize".into(),
                ..RawTraceEvent::default()
            },
        ];

        let steps = reduce_trace(&trace, 10);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].step_type, StepType::QueryPlanning);
        assert_eq!(steps[0].metadata, Some(json!({"sections": 4})));
        assert_eq!(steps[1].step_type, StepType::SourceSelection);
        assert_eq!(steps[2].description, StepType::Synthesis.default_description());
        assert_eq!(
            steps.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let serialized = serde_json::to_string(&steps).unwrap();
        assert!(!serialized.contains("SYSTEM"));
        assert!(!serialized.contains("secret prompt"));
    }

    #[test]
    fn reduction_is_bounded() {
        let trace: Vec<_> = (0..50)
            .map(|i| RawTraceEvent::new("research", format!("section {i}")))
            .collect();
        assert_eq!(reduce_trace(&trace, 5).len(), 5);

        let long = "word ".repeat(200);
        let steps = reduce_trace(&[RawTraceEvent::new("research", long)], 5);
        assert_eq!(steps[0].description.chars().count(), MAX_DESCRIPTION_CHARS);
        assert!(steps[0].description.ends_with('…'));
    }
}
