use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{EngineOutput, EngineRequest, RawTraceEvent, ResearchEngine};
use crate::context::FINDINGS_HEADER;
use crate::error::AgentExecutionError;
use crate::events::AgentEventCollector;

/// Deterministic offline engine.
///
/// Token counts are derived from text length (four characters per token),
/// so repeated runs over the same query cost the same.
#[derive(Debug, Clone)]
pub struct StubResearchEngine {
    model: String,
    latency: Duration,
}

impl StubResearchEngine {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4).max(1)
}

#[async_trait]
impl ResearchEngine for StubResearchEngine {
    fn name(&self) -> &str {
        "stub"
    }

    async fn execute(
        &self,
        request: EngineRequest,
        events: AgentEventCollector,
    ) -> Result<EngineOutput, AgentExecutionError> {
        events.emit_progress("plan", "drafting report outline");
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let question = request.query.lines().next().unwrap_or_default().trim();
        let continues = request.query.contains(FINDINGS_HEADER);
        let references = request.query.matches("=== Reference material:").count();

        let mut report = format!("# Research report\n\n## Question\n{question}\n\n## Findings\n");
        report.push_str(&format!(
            "- Offline analysis of \"{question}\" produced a structured overview.\n"
        ));
        if continues {
            report.push_str("- Extends earlier findings without revisiting covered topics.\n");
        }
        if references > 0 {
            report.push_str(&format!("- Consulted {references} reference document(s).\n"));
        }
        report.push_str("\n## Conclusion\nNo external sources were contacted in offline mode.\n");

        events.emit_token_usage(
            self.model.clone(),
            estimate_tokens(&request.query),
            estimate_tokens(&report),
        );

        let trace = vec![
            RawTraceEvent::new("plan", format!("Outlined a report for \"{question}\""))
                .with_metadata(json!({ "continuation": continues })),
            RawTraceEvent::new("thought", "internal deliberation")
                .with_content("considering which angle to take first"),
            RawTraceEvent::new("search", format!("Selected {references} reference document(s)"))
                .with_metadata(json!({ "references": references })),
            RawTraceEvent::new("research", "Summarised offline findings"),
            RawTraceEvent::new("synthesize", "Compiled the final report"),
        ];

        Ok(EngineOutput {
            final_report: report,
            trace,
            run_id: None,
        })
    }
}
