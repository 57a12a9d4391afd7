use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use graph_flow::{Context, NextAction, Task, TaskResult};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{AgentRun, ResearchAgentAdapter};
use crate::context::{compose, document_contexts};
use crate::cost::{CostAccountant, CostReport, PricingTable};
use crate::model::{SessionId, UploadedDocument};
use crate::store::SessionStore;
use crate::summarize::Summarizer;

pub(crate) const KEY_SESSION_ID: &str = "session.id";
pub(crate) const KEY_QUERY: &str = "session.query";
pub(crate) const KEY_PARENT_ID: &str = "session.parent_id";
pub(crate) const KEY_ENHANCED_QUERY: &str = "context.enhanced_query";
pub(crate) const KEY_AGENT_RUN: &str = "agent.run";
pub(crate) const KEY_COST: &str = "cost.report";
pub(crate) const KEY_SUMMARY: &str = "summary.text";
pub(crate) const KEY_FAILURE: &str = "run.failure";

const DOCUMENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why a pipeline run stopped short of a completed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub reason: String,
    pub retryable: bool,
    pub trace_id: Option<String>,
}

impl RunFailure {
    pub fn new(reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            reason: reason.into(),
            retryable,
            trace_id: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

async fn fail(context: &Context, failure: RunFailure) -> graph_flow::Result<TaskResult> {
    warn!(reason = %failure.reason, retryable = failure.retryable, "pipeline step failed");
    let message = failure.reason.clone();
    context.set(KEY_FAILURE, failure).await;
    Ok(TaskResult::new(Some(message), NextAction::End))
}

async fn session_id(context: &Context) -> Option<SessionId> {
    context.get::<Uuid>(KEY_SESSION_ID).await
}

/// Builds the enhanced query from the ancestor summary and settled documents.
pub struct ComposeContextTask {
    store: Arc<dyn SessionStore>,
    document_wait: Duration,
}

impl ComposeContextTask {
    pub fn new(store: Arc<dyn SessionStore>, document_wait: Duration) -> Self {
        Self {
            store,
            document_wait,
        }
    }

    /// Poll until every attached document settled or the window closed.
    async fn settled_documents(&self, session_id: SessionId) -> Result<Vec<UploadedDocument>, RunFailure> {
        let deadline = Instant::now() + self.document_wait;
        loop {
            let documents = self
                .store
                .documents_for_session(session_id)
                .await
                .map_err(|err| RunFailure::new(format!("failed to load documents: {err}"), true))?;

            let pending = documents
                .iter()
                .filter(|doc| !doc.status.is_settled())
                .count();
            if pending == 0 {
                return Ok(documents);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(%session_id, pending, "documents still processing; continuing without them");
                return Ok(documents);
            }
            sleep(DOCUMENT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

#[async_trait]
impl Task for ComposeContextTask {
    fn id(&self) -> &str {
        "compose_context"
    }

    #[instrument(name = "task.compose_context", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let Some(session_id) = session_id(&context).await else {
            return fail(&context, RunFailure::new("pipeline started without a session id", false)).await;
        };
        let query: String = context.get(KEY_QUERY).await.unwrap_or_default();
        let parent_id = context.get::<Option<Uuid>>(KEY_PARENT_ID).await.flatten();

        let ancestor_summary = match parent_id {
            Some(parent_id) => match self.store.summary(parent_id).await {
                Ok(Some(summary)) => Some(summary.text),
                Ok(None) => {
                    return fail(
                        &context,
                        RunFailure::new(
                            format!("summary of parent session {parent_id} is not available"),
                            false,
                        ),
                    )
                    .await;
                }
                Err(err) => {
                    return fail(
                        &context,
                        RunFailure::new(format!("failed to load parent summary: {err}"), true),
                    )
                    .await;
                }
            },
            None => None,
        };

        let documents = match self.settled_documents(session_id).await {
            Ok(documents) => documents,
            Err(failure) => return fail(&context, failure).await,
        };
        let references = document_contexts(&documents);

        let enhanced = compose(&query, ancestor_summary.as_deref(), &references);
        debug!(
            %session_id,
            continuation = ancestor_summary.is_some(),
            documents = references.len(),
            skipped = documents.len() - references.len(),
            "composed research context"
        );
        context.set(KEY_ENHANCED_QUERY, enhanced).await;

        Ok(TaskResult::new(
            Some(format!("Context composed with {} reference(s)", references.len())),
            NextAction::ContinueAndExecute,
        ))
    }
}

/// Runs the external engine and prices the run.
pub struct ResearchAgentTask {
    adapter: ResearchAgentAdapter,
    pricing: Arc<PricingTable>,
    default_model: String,
}

impl ResearchAgentTask {
    pub fn new(adapter: ResearchAgentAdapter, pricing: Arc<PricingTable>, default_model: impl Into<String>) -> Self {
        Self {
            adapter,
            pricing,
            default_model: default_model.into(),
        }
    }
}

#[async_trait]
impl Task for ResearchAgentTask {
    fn id(&self) -> &str {
        "research_agent"
    }

    #[instrument(name = "task.research_agent", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let session_id = session_id(&context).await.unwrap_or_default();
        let Some(enhanced) = context.get::<String>(KEY_ENHANCED_QUERY).await else {
            return fail(&context, RunFailure::new("no composed query available", false)).await;
        };

        let mut accountant = CostAccountant::new(self.pricing.clone(), self.default_model.clone());
        let run_label = format!("session-{session_id}");
        let run: AgentRun = match self.adapter.run(&enhanced, &run_label, &mut accountant).await {
            Ok(run) => run,
            Err(err) => {
                let failure = RunFailure::new(err.to_string(), err.is_retryable())
                    .with_trace_id(err.trace_id().map(str::to_string));
                return fail(&context, failure).await;
            }
        };

        let cost: CostReport = match accountant.finalize() {
            Ok(cost) => cost,
            Err(err) => {
                return fail(
                    &context,
                    RunFailure::new(err.to_string(), false).with_trace_id(run.trace_id.clone()),
                )
                .await;
            }
        };

        info!(
            %session_id,
            model = %cost.model_name,
            total_tokens = cost.total_tokens,
            estimated_cost_usd = cost.estimated_cost_usd,
            "agent run priced"
        );
        context.set(KEY_AGENT_RUN, run).await;
        context.set(KEY_COST, cost).await;

        Ok(TaskResult::new(
            Some("Research agent finished".to_string()),
            NextAction::ContinueAndExecute,
        ))
    }
}

/// Derives the bounded summary used by continuations.
pub struct SummarizeReportTask {
    summarizer: Arc<dyn Summarizer>,
    max_chars: usize,
}

impl SummarizeReportTask {
    pub fn new(summarizer: Arc<dyn Summarizer>, max_chars: usize) -> Self {
        Self {
            summarizer,
            max_chars,
        }
    }
}

#[async_trait]
impl Task for SummarizeReportTask {
    fn id(&self) -> &str {
        "summarize_report"
    }

    #[instrument(name = "task.summarize_report", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let Some(run) = context.get::<AgentRun>(KEY_AGENT_RUN).await else {
            return fail(&context, RunFailure::new("no agent report to summarize", false)).await;
        };

        let summary = match self.summarizer.summarize(&run.final_report, self.max_chars).await {
            Ok(summary) => summary,
            Err(err) => {
                let failure = RunFailure::new(err.to_string(), err.is_retryable())
                    .with_trace_id(run.trace_id.clone());
                return fail(&context, failure).await;
            }
        };

        debug!(chars = summary.chars().count(), summarizer = self.summarizer.name(), "report summarized");
        context.set(KEY_SUMMARY, summary).await;

        Ok(TaskResult::new(
            Some("Report summarized".to_string()),
            NextAction::End,
        ))
    }
}
