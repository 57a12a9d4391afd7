use std::sync::Arc;

use graph_flow::{
    ExecutionStatus, FlowRunner, Graph, GraphBuilder, InMemorySessionStorage, Session,
    SessionStorage, Task,
};
use tracing::{debug, instrument};

use crate::agent::{AgentRun, ResearchAgentAdapter};
use crate::cost::{CostReport, PricingTable};
use crate::model::{ResearchSession, SessionCompletion};
use crate::store::SessionStore;
use crate::summarize::Summarizer;
use crate::tasks::{
    ComposeContextTask, KEY_AGENT_RUN, KEY_COST, KEY_FAILURE, KEY_PARENT_ID, KEY_QUERY,
    KEY_SESSION_ID, KEY_SUMMARY, ResearchAgentTask, RunFailure, SummarizeReportTask,
};

/// Collaborators the per-session graph is wired from.
pub struct PipelineDeps {
    pub store: Arc<dyn SessionStore>,
    pub adapter: ResearchAgentAdapter,
    pub summarizer: Arc<dyn Summarizer>,
    pub pricing: Arc<PricingTable>,
    pub default_model: String,
    pub summary_max_chars: usize,
    pub document_wait: std::time::Duration,
}

/// The strictly sequential compose → research → summarize graph of one session.
#[derive(Clone)]
pub struct SessionPipeline {
    graph: Arc<Graph>,
    start_task: String,
}

impl SessionPipeline {
    pub fn new(deps: PipelineDeps) -> Self {
        let compose = Arc::new(ComposeContextTask::new(deps.store.clone(), deps.document_wait));
        let research = Arc::new(ResearchAgentTask::new(
            deps.adapter,
            deps.pricing,
            deps.default_model,
        ));
        let summarize = Arc::new(SummarizeReportTask::new(
            deps.summarizer,
            deps.summary_max_chars,
        ));

        let start_task = compose.id().to_string();
        let graph = GraphBuilder::new("delve_session")
            .add_task(compose.clone())
            .add_task(research.clone())
            .add_task(summarize.clone())
            .add_edge(compose.id(), research.id())
            .add_edge(research.id(), summarize.id())
            .set_start_task(compose.id())
            .build();

        Self {
            graph: Arc::new(graph),
            start_task,
        }
    }

    /// Run one attempt for `session` from scratch. Each attempt gets its own
    /// flow session, so nothing from an abandoned attempt leaks into the next.
    #[allow(unreachable_patterns)]
    #[instrument(name = "pipeline.run", skip(self, session), fields(session_id = %session.id))]
    pub async fn run(
        &self,
        session: &ResearchSession,
        attempt: u32,
    ) -> Result<SessionCompletion, RunFailure> {
        let storage = Arc::new(InMemorySessionStorage::new());
        let runner = FlowRunner::new(self.graph.clone(), storage.clone());

        let flow_id = format!("{}-attempt-{attempt}", session.id);
        let flow = Session::new_from_task(flow_id.clone(), &self.start_task);
        flow.context.set(KEY_SESSION_ID, session.id).await;
        flow.context.set(KEY_QUERY, session.query.clone()).await;
        flow.context.set(KEY_PARENT_ID, session.parent_id()).await;

        storage
            .save(flow)
            .await
            .map_err(|err| RunFailure::new(format!("failed to persist flow state: {err}"), true))?;

        loop {
            let result = runner
                .run(&flow_id)
                .await
                .map_err(|err| RunFailure::new(format!("graph execution failure: {err}"), true))?;

            match result.status {
                ExecutionStatus::Completed => break,
                ExecutionStatus::WaitingForInput => continue,
                ExecutionStatus::Error(message) => return Err(RunFailure::new(message, true)),
                _ => continue,
            }
        }

        let flow = storage
            .get(&flow_id)
            .await
            .map_err(|err| RunFailure::new(format!("failed to reload flow state: {err}"), true))?
            .ok_or_else(|| RunFailure::new("flow state missing after execution", true))?;

        if let Some(failure) = flow.context.get::<RunFailure>(KEY_FAILURE).await {
            return Err(failure);
        }

        let run: AgentRun = flow
            .context
            .get(KEY_AGENT_RUN)
            .await
            .ok_or_else(|| RunFailure::new("pipeline finished without an agent run", false))?;
        let cost: CostReport = flow.context.get(KEY_COST).await.ok_or_else(|| {
            RunFailure::new("pipeline finished without a cost report", false)
                .with_trace_id(run.trace_id.clone())
        })?;
        let summary: String = flow.context.get(KEY_SUMMARY).await.ok_or_else(|| {
            RunFailure::new("pipeline finished without a summary", false)
                .with_trace_id(run.trace_id.clone())
        })?;

        debug!(trace_id = ?run.trace_id, "pipeline attempt completed");
        Ok(SessionCompletion {
            final_report: run.final_report,
            summary,
            reasoning: run.reasoning_steps,
            cost,
            trace_id: run.trace_id,
        })
    }
}
