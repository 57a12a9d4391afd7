use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use delve_core::{
    AgentEventCollector, AgentExecutionError, Config, DelveError, DocumentError, DocumentId,
    DocumentStatus, DocumentUpload, EngineOutput, EngineRequest, FINDINGS_HEADER, HistoryFilter,
    InMemorySessionStore, NO_REPEAT_INSTRUCTION, RawTraceEvent, ReasoningStep, ResearchCost,
    ResearchEngine, ResearchService, ResearchSession, ResearchSummary, ServiceComponents,
    SessionCompletion, SessionId, SessionRequest, SessionStatus, SessionStore, StepType,
    StubResearchEngine, UploadedDocument, WorkItem,
};

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> Config {
    let mut config = Config::default();
    config.scheduler.initial_backoff_ms = 1;
    config.scheduler.max_backoff_ms = 2;
    config.context.document_wait_ms = 2_000;
    config
}

/// Records every composed query and answers with a fixed report.
struct RecordingEngine {
    report: String,
    model: String,
    queries: Mutex<Vec<String>>,
}

impl RecordingEngine {
    fn new(report: &str) -> Arc<Self> {
        Self::with_model(report, "gpt-4-turbo-preview")
    }

    fn with_model(report: &str, model: &str) -> Arc<Self> {
        Arc::new(Self {
            report: report.to_string(),
            model: model.to_string(),
            queries: Mutex::new(Vec::new()),
        })
    }

    fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResearchEngine for RecordingEngine {
    fn name(&self) -> &str {
        "recording"
    }

    async fn execute(
        &self,
        request: EngineRequest,
        events: AgentEventCollector,
    ) -> Result<EngineOutput, AgentExecutionError> {
        self.queries.lock().unwrap().push(request.query);
        events.emit_token_usage(self.model.clone(), 5_000, 2_000);
        Ok(EngineOutput {
            final_report: self.report.clone(),
            trace: vec![
                RawTraceEvent::new("plan", "outlined the report"),
                RawTraceEvent::new("thought", "private").with_content("raw model text"),
                RawTraceEvent::new("web_search", "looked up sources"),
                RawTraceEvent::new("final_report", "wrote the report"),
            ],
            run_id: Some("run-42".to_string()),
        })
    }
}

struct FailingEngine {
    error: AgentExecutionError,
    calls: AtomicUsize,
}

impl FailingEngine {
    fn new(error: AgentExecutionError) -> Arc<Self> {
        Arc::new(Self {
            error,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ResearchEngine for FailingEngine {
    fn name(&self) -> &str {
        "failing"
    }

    async fn execute(
        &self,
        _request: EngineRequest,
        _events: AgentEventCollector,
    ) -> Result<EngineOutput, AgentExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

fn start_with(config: &Config, engine: Arc<dyn ResearchEngine>) -> ResearchService {
    let components = ServiceComponents::offline(config).with_engine(engine);
    ResearchService::start(config, components)
}

#[tokio::test]
async fn fresh_session_sends_query_verbatim_and_persists_artifacts() {
    let config = test_config();
    let engine = RecordingEngine::new("Battery chemistry is improving. Costs keep falling.");
    let service = start_with(&config, engine.clone());
    let manager = service.manager();

    let session = manager
        .start_session(SessionRequest::new("Solid-state batteries"))
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Pending);

    let done = manager.wait_for_terminal(session.id, WAIT).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.trace_id.as_deref(), Some("run-42"));
    assert_eq!(engine.queries(), vec!["Solid-state batteries".to_string()]);

    let detail = manager.session_detail(session.id).await.unwrap();
    assert_eq!(
        detail.session.final_report.as_deref(),
        Some("Battery chemistry is improving. Costs keep falling.")
    );
    assert!(detail.summary.unwrap().text.contains("Battery chemistry"));

    let cost = detail.cost.unwrap();
    assert_eq!(cost.model_name, "gpt-4-turbo-preview");
    assert_eq!(cost.total_tokens, 7_000);
    assert!((cost.estimated_cost_usd - 0.11).abs() < 1e-9);

    let steps: Vec<StepType> = detail.reasoning.iter().map(|step| step.step_type).collect();
    assert_eq!(
        steps,
        vec![StepType::QueryPlanning, StepType::SourceSelection, StepType::Synthesis]
    );
    assert!(detail.reasoning.iter().all(|step| !step.description.contains("raw model text")));

    service.shutdown().await;
}

#[tokio::test]
async fn continuation_carries_parent_summary_into_the_query() {
    let config = test_config();
    let engine = RecordingEngine::new("S1 findings about grid storage.");
    let service = start_with(&config, engine.clone());
    let manager = service.manager();

    let parent = manager
        .start_session(SessionRequest::new("Grid storage"))
        .await
        .unwrap();
    manager.wait_for_terminal(parent.id, WAIT).await.unwrap();

    let child = manager
        .start_continuation(parent.id, "Y: what about sodium-ion?")
        .await
        .unwrap();
    assert_eq!(child.parent_id(), Some(parent.id));
    let child = manager.wait_for_terminal(child.id, WAIT).await.unwrap();
    assert_eq!(child.status, SessionStatus::Completed);

    let queries = engine.queries();
    let enhanced = &queries[1];
    let query_at = enhanced.find("Y: what about sodium-ion?").unwrap();
    let header_at = enhanced.find(FINDINGS_HEADER).unwrap();
    let summary_at = enhanced.find("S1 findings").unwrap();
    let instruction_at = enhanced.find(NO_REPEAT_INSTRUCTION).unwrap();
    assert!(query_at < header_at);
    assert!(header_at < summary_at);
    assert!(summary_at < instruction_at);

    let lineage = manager.lineage(child.id).await.unwrap();
    let ids: Vec<_> = lineage.iter().map(|session| session.id).collect();
    assert_eq!(ids, vec![parent.id, child.id]);

    let children = manager.children(parent.id).await.unwrap();
    assert_eq!(children.len(), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn processed_documents_become_reference_material() {
    let config = test_config();
    let engine = RecordingEngine::new("Report.");
    let service = start_with(&config, engine.clone());
    let manager = service.manager();

    let request = SessionRequest::new("Summarize the notes")
        .with_document(DocumentUpload::new("notes.txt", "Doc1 says storage is cheap."));
    let session = manager.start_session(request).await.unwrap();
    manager.wait_for_terminal(session.id, WAIT).await.unwrap();

    let enhanced = &engine.queries()[0];
    assert!(enhanced.starts_with("Summarize the notes"));
    assert!(enhanced.contains("=== Reference material: notes.txt ==="));
    assert!(enhanced.contains("Doc1"));

    let detail = manager.session_detail(session.id).await.unwrap();
    assert_eq!(detail.documents.len(), 1);
    let document = &detail.documents[0];
    assert_eq!(document.status, DocumentStatus::Processed);
    assert!(document.extracted_text.is_none());
    assert!(document.summary.as_deref().unwrap().contains("Doc1"));

    service.shutdown().await;
}

#[tokio::test]
async fn failed_documents_are_skipped_without_failing_the_session() {
    let config = test_config();
    let engine = RecordingEngine::new("Report.");
    let service = start_with(&config, engine.clone());
    let manager = service.manager();

    let request = SessionRequest::new("Only the query")
        .with_document(DocumentUpload::new("broken.txt", vec![0xff, 0xfe, 0xfd]));
    let session = manager.start_session(request).await.unwrap();
    let done = manager.wait_for_terminal(session.id, WAIT).await.unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(engine.queries(), vec!["Only the query".to_string()]);

    let detail = manager.session_detail(session.id).await.unwrap();
    assert_eq!(detail.documents[0].status, DocumentStatus::Failed);
    assert!(detail.documents[0].failure_reason.is_some());

    service.shutdown().await;
}

#[tokio::test]
async fn agent_failure_fails_session_without_artifacts() {
    let config = test_config();
    let engine = FailingEngine::new(AgentExecutionError::malformed("no report section"));
    let service = start_with(&config, engine.clone());
    let manager = service.manager();

    let session = manager
        .start_session(SessionRequest::new("Doomed query"))
        .await
        .unwrap();
    let done = manager.wait_for_terminal(session.id, WAIT).await.unwrap();

    assert_eq!(done.status, SessionStatus::Failed);
    assert!(done.failure_reason.unwrap().contains("no report section"));
    assert_eq!(engine.calls.load(Ordering::SeqCst), 1);

    let detail = manager.session_detail(session.id).await.unwrap();
    assert!(detail.summary.is_none());
    assert!(detail.cost.is_none());
    assert!(detail.reasoning.is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn transient_agent_failures_are_retried_up_to_the_bound() {
    let config = test_config();
    let engine = FailingEngine::new(AgentExecutionError::transport("connection reset"));
    let service = start_with(&config, engine.clone());
    let manager = service.manager();

    let session = manager
        .start_session(SessionRequest::new("Flaky upstream"))
        .await
        .unwrap();
    let done = manager.wait_for_terminal(session.id, WAIT).await.unwrap();

    assert_eq!(done.status, SessionStatus::Failed);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 3);

    service.shutdown().await;
}

#[tokio::test]
async fn unpriced_model_fails_the_session() {
    let config = test_config();
    let engine = RecordingEngine::with_model("Report.", "mystery-model");
    let service = start_with(&config, engine.clone());
    let manager = service.manager();

    let session = manager
        .start_session(SessionRequest::new("Who prices this?"))
        .await
        .unwrap();
    let done = manager.wait_for_terminal(session.id, WAIT).await.unwrap();

    assert_eq!(done.status, SessionStatus::Failed);
    assert!(done.failure_reason.unwrap().contains("mystery-model"));
    assert_eq!(engine.queries().len(), 1);
    assert!(manager.session_detail(session.id).await.unwrap().cost.is_none());

    service.shutdown().await;
}

#[tokio::test]
async fn continuation_requires_a_completed_parent() {
    let config = test_config();
    let store = Arc::new(InMemorySessionStore::new());
    let components = ServiceComponents::offline(&config).with_store(store.clone());
    let service = ResearchService::start(&config, components);
    let manager = service.manager();

    let pending = ResearchSession::new("never scheduled");
    store.insert_session(pending.clone()).await.unwrap();
    let err = manager.start_continuation(pending.id, "follow up").await.unwrap_err();
    assert!(matches!(
        err,
        DelveError::InvalidParentState {
            status: SessionStatus::Pending,
            ..
        }
    ));

    store.claim_session(pending.id).await.unwrap();
    let err = manager.start_continuation(pending.id, "follow up").await.unwrap_err();
    assert!(matches!(
        err,
        DelveError::InvalidParentState {
            status: SessionStatus::Running,
            ..
        }
    ));

    store
        .fail_session(pending.id, "gave up".to_string(), None)
        .await
        .unwrap();
    let err = manager.start_continuation(pending.id, "follow up").await.unwrap_err();
    assert!(matches!(
        err,
        DelveError::InvalidParentState {
            status: SessionStatus::Failed,
            ..
        }
    ));

    let missing = manager
        .start_continuation(uuid_like(), "follow up")
        .await
        .unwrap_err();
    assert!(matches!(missing, DelveError::SessionNotFound(_)));

    assert_eq!(manager.history(&HistoryFilter::default()).await.unwrap().len(), 1);
    service.shutdown().await;
}

fn uuid_like() -> delve_core::SessionId {
    ResearchSession::new("id source").id
}

#[tokio::test]
async fn invalid_requests_create_nothing() {
    let config = test_config();
    let service = ResearchService::start(&config, ServiceComponents::offline(&config));
    let manager = service.manager();

    let err = manager.start_session(SessionRequest::new("   ")).await.unwrap_err();
    assert!(matches!(err, DelveError::InvalidRequest(_)));

    let request = SessionRequest::new("Has a bad attachment")
        .with_document(DocumentUpload::new("slides.pptx", "binary"));
    let err = manager.start_session(request).await.unwrap_err();
    assert!(matches!(
        err,
        DelveError::Document(DocumentError::UnsupportedFormat(_))
    ));

    assert!(manager.history(&HistoryFilter::default()).await.unwrap().is_empty());
    service.shutdown().await;
}

#[tokio::test]
async fn duplicate_delivery_does_not_rerun_a_finished_session() {
    let config = test_config();
    let engine = RecordingEngine::new("Once only.");
    let service = start_with(&config, engine.clone());
    let manager = service.manager();

    let session = manager
        .start_session(SessionRequest::new("Run me once"))
        .await
        .unwrap();
    manager.wait_for_terminal(session.id, WAIT).await.unwrap();

    manager
        .scheduler()
        .schedule(WorkItem::Session {
            session_id: session.id,
        })
        .unwrap();
    service.shutdown().await;

    assert_eq!(engine.queries().len(), 1);
    assert_eq!(
        manager.session(session.id).await.unwrap().status,
        SessionStatus::Completed
    );
}

#[tokio::test]
async fn deleting_a_parent_keeps_its_children() {
    let config = test_config();
    let service = ResearchService::start(&config, ServiceComponents::offline(&config));
    let manager = service.manager();

    let parent = manager
        .start_session(SessionRequest::new("Root question"))
        .await
        .unwrap();
    manager.wait_for_terminal(parent.id, WAIT).await.unwrap();
    let child = manager
        .start_continuation(parent.id, "Deeper question")
        .await
        .unwrap();
    manager.wait_for_terminal(child.id, WAIT).await.unwrap();

    manager.delete_session(parent.id).await.unwrap();

    assert!(matches!(
        manager.session(parent.id).await.unwrap_err(),
        DelveError::SessionNotFound(_)
    ));
    let orphan = manager.session(child.id).await.unwrap();
    assert_eq!(orphan.status, SessionStatus::Completed);
    assert_eq!(orphan.parent_id(), Some(parent.id));

    let lineage = manager.lineage(child.id).await.unwrap();
    assert_eq!(lineage.len(), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn uploads_attach_to_existing_sessions_only() {
    let config = test_config();
    let service = ResearchService::start(&config, ServiceComponents::offline(&config));
    let manager = service.manager();

    let err = manager
        .upload_document(uuid_like(), DocumentUpload::new("a.txt", "text"))
        .await
        .unwrap_err();
    assert!(matches!(err, DelveError::SessionNotFound(_)));

    let session = manager
        .start_session(SessionRequest::new("Attach later"))
        .await
        .unwrap();
    let document = manager
        .upload_document(session.id, DocumentUpload::new("later.txt", "Late notes."))
        .await
        .unwrap();
    assert_eq!(document.session_id, session.id);
    assert_eq!(document.status, DocumentStatus::Uploaded);

    service.shutdown().await;
    let settled = manager.document(document.id).await.unwrap();
    assert_eq!(settled.status, DocumentStatus::Processed);
}

#[tokio::test]
async fn continuation_sees_only_its_own_documents() {
    let config = test_config();
    let engine = RecordingEngine::new("Findings on cathodes.");
    let service = start_with(&config, engine.clone());
    let manager = service.manager();

    let parent = manager
        .start_session(
            SessionRequest::new("Cathode materials")
                .with_document(DocumentUpload::new("parent.txt", "ParentDoc covers nickel.")),
        )
        .await
        .unwrap();
    manager.wait_for_terminal(parent.id, WAIT).await.unwrap();

    let child = manager
        .start_session(
            SessionRequest::new("And manganese?")
                .continuing(parent.id)
                .with_document(DocumentUpload::new("child.txt", "ChildDoc covers manganese.")),
        )
        .await
        .unwrap();
    let child = manager.wait_for_terminal(child.id, WAIT).await.unwrap();
    assert_eq!(child.status, SessionStatus::Completed);

    let queries = engine.queries();
    assert!(queries[0].contains("=== Reference material: parent.txt ==="));
    let enhanced = &queries[1];
    assert!(enhanced.contains(FINDINGS_HEADER));
    assert!(enhanced.contains("=== Reference material: child.txt ==="));
    assert!(!enhanced.contains("parent.txt"));
    assert!(!enhanced.contains("ParentDoc"));

    service.shutdown().await;
}

#[tokio::test]
async fn agent_timeout_fails_the_session() {
    let mut config = test_config();
    config.agent.timeout_secs = 1;
    config.scheduler.max_attempts = 1;
    let engine = Arc::new(
        StubResearchEngine::new("gpt-4-turbo-preview").with_latency(Duration::from_secs(3)),
    );
    let service = start_with(&config, engine);
    let manager = service.manager();

    let session = manager
        .start_session(SessionRequest::new("Slow upstream"))
        .await
        .unwrap();
    let done = manager.wait_for_terminal(session.id, WAIT).await.unwrap();

    assert_eq!(done.status, SessionStatus::Failed);
    assert!(done.failure_reason.unwrap().contains("timed out"));
    assert!(done.final_report.is_none());

    service.shutdown().await;
}

/// Delegates to the in-memory store but refuses to record completions.
struct UnwritableStore {
    inner: InMemorySessionStore,
    completions: AtomicUsize,
}

#[async_trait]
impl SessionStore for UnwritableStore {
    async fn insert_session(&self, session: ResearchSession) -> Result<(), DelveError> {
        self.inner.insert_session(session).await
    }

    async fn session(&self, id: SessionId) -> Result<Option<ResearchSession>, DelveError> {
        self.inner.session(id).await
    }

    async fn claim_session(&self, id: SessionId) -> Result<ResearchSession, DelveError> {
        self.inner.claim_session(id).await
    }

    async fn complete_session(
        &self,
        _id: SessionId,
        _completion: SessionCompletion,
    ) -> Result<ResearchSession, DelveError> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        Err(DelveError::Other(anyhow::anyhow!("disk full")))
    }

    async fn fail_session(
        &self,
        id: SessionId,
        reason: String,
        trace_id: Option<String>,
    ) -> Result<ResearchSession, DelveError> {
        self.inner.fail_session(id, reason, trace_id).await
    }

    async fn summary(&self, id: SessionId) -> Result<Option<ResearchSummary>, DelveError> {
        self.inner.summary(id).await
    }

    async fn reasoning(&self, id: SessionId) -> Result<Vec<ReasoningStep>, DelveError> {
        self.inner.reasoning(id).await
    }

    async fn cost(&self, id: SessionId) -> Result<Option<ResearchCost>, DelveError> {
        self.inner.cost(id).await
    }

    async fn list_sessions(
        &self,
        filter: &HistoryFilter,
    ) -> Result<Vec<ResearchSession>, DelveError> {
        self.inner.list_sessions(filter).await
    }

    async fn delete_session(&self, id: SessionId) -> Result<(), DelveError> {
        self.inner.delete_session(id).await
    }

    async fn insert_document(
        &self,
        document: UploadedDocument,
        content: Vec<u8>,
    ) -> Result<(), DelveError> {
        self.inner.insert_document(document, content).await
    }

    async fn document(&self, id: DocumentId) -> Result<Option<UploadedDocument>, DelveError> {
        self.inner.document(id).await
    }

    async fn claim_document(&self, id: DocumentId) -> Result<UploadedDocument, DelveError> {
        self.inner.claim_document(id).await
    }

    async fn upload_content(&self, id: DocumentId) -> Result<Option<Vec<u8>>, DelveError> {
        self.inner.upload_content(id).await
    }

    async fn complete_document(
        &self,
        id: DocumentId,
        extracted_text: String,
        summary: String,
    ) -> Result<UploadedDocument, DelveError> {
        self.inner.complete_document(id, extracted_text, summary).await
    }

    async fn fail_document(
        &self,
        id: DocumentId,
        reason: String,
    ) -> Result<UploadedDocument, DelveError> {
        self.inner.fail_document(id, reason).await
    }

    async fn documents_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<UploadedDocument>, DelveError> {
        self.inner.documents_for_session(session_id).await
    }
}

#[tokio::test]
async fn store_fault_on_the_last_attempt_fails_the_session() {
    let config = test_config();
    let store = Arc::new(UnwritableStore {
        inner: InMemorySessionStore::new(),
        completions: AtomicUsize::new(0),
    });
    let engine = RecordingEngine::new("Never persisted.");
    let components = ServiceComponents::offline(&config)
        .with_store(store.clone())
        .with_engine(engine.clone());
    let service = ResearchService::start(&config, components);
    let manager = service.manager();

    let session = manager
        .start_session(SessionRequest::new("Write me down"))
        .await
        .unwrap();
    let done = manager.wait_for_terminal(session.id, WAIT).await.unwrap();

    assert_eq!(done.status, SessionStatus::Failed);
    assert!(done.failure_reason.unwrap().contains("disk full"));
    assert!(done.final_report.is_none());
    assert_eq!(store.completions.load(Ordering::SeqCst), 3);
    assert_eq!(engine.queries().len(), 3);

    service.shutdown().await;
}
