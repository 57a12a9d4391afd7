//! Session lifecycle: creation and continuation on the request path, state
//! transitions and artifact persistence on the worker path.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::documents::TextExtractor;
use crate::error::{DelveError, TaskError};
use crate::logging::{SessionLogInput, SessionLogSettings, log_session_outcome, remove_session_logs};
use crate::model::{
    DocumentId, DocumentStatus, DocumentUpload, HistoryFilter, ResearchCost, ResearchSession,
    SessionDetail, SessionId, SessionStatus, UploadedDocument,
};
use crate::scheduler::{Attempt, TaskScheduler, WorkHandler, WorkItem};
use crate::store::SessionStore;
use crate::summarize::Summarizer;
use crate::workflow::SessionPipeline;

const TERMINAL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A request to start a session, optionally continuing a completed one.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub query: String,
    pub parent_id: Option<SessionId>,
    pub documents: Vec<DocumentUpload>,
}

impl SessionRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn continuing(mut self, parent_id: SessionId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_document(mut self, upload: DocumentUpload) -> Self {
        self.documents.push(upload);
        self
    }
}

/// Request-path entry point. Validates, persists and enqueues; never runs
/// the expensive work itself.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    scheduler: TaskScheduler,
    session_log: Option<SessionLogSettings>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        scheduler: TaskScheduler,
        session_log: Option<SessionLogSettings>,
    ) -> Self {
        Self {
            store,
            scheduler,
            session_log,
        }
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    #[instrument(name = "session.start", skip(self, request), fields(parent_id = ?request.parent_id))]
    pub async fn start_session(&self, request: SessionRequest) -> Result<ResearchSession, DelveError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(DelveError::InvalidRequest("query must not be empty".into()));
        }

        let session = match request.parent_id {
            Some(parent_id) => {
                let parent = self
                    .store
                    .session(parent_id)
                    .await?
                    .ok_or(DelveError::SessionNotFound(parent_id))?;
                ResearchSession::continuation(&parent, query)?
            }
            None => ResearchSession::new(query),
        };

        let mut documents = Vec::with_capacity(request.documents.len());
        for upload in &request.documents {
            documents.push(prepare_document(session.id, upload)?);
        }

        self.store.insert_session(session.clone()).await?;
        if let Err(err) = self.enqueue(&session, documents, request.documents).await {
            warn!(session_id = %session.id, error = %err, "rolling back session that could not be scheduled");
            if let Err(cleanup) = self.store.delete_session(session.id).await {
                warn!(session_id = %session.id, error = %cleanup, "rollback failed");
            }
            return Err(err);
        }

        info!(session_id = %session.id, continuation = session.is_continuation(), "session accepted");
        Ok(session)
    }

    async fn enqueue(
        &self,
        session: &ResearchSession,
        documents: Vec<UploadedDocument>,
        uploads: Vec<DocumentUpload>,
    ) -> Result<(), DelveError> {
        for (document, upload) in documents.into_iter().zip(uploads) {
            let document_id = document.id;
            self.store.insert_document(document, upload.content).await?;
            self.scheduler.schedule(WorkItem::Document { document_id })?;
        }
        self.scheduler.schedule(WorkItem::Session {
            session_id: session.id,
        })?;
        Ok(())
    }

    /// Continue a completed session with a new query.
    pub async fn start_continuation(
        &self,
        parent_id: SessionId,
        query: impl Into<String>,
    ) -> Result<ResearchSession, DelveError> {
        self.start_session(SessionRequest::new(query).continuing(parent_id))
            .await
    }

    #[instrument(name = "document.upload", skip(self, upload), fields(name = %upload.name))]
    pub async fn upload_document(
        &self,
        session_id: SessionId,
        upload: DocumentUpload,
    ) -> Result<UploadedDocument, DelveError> {
        let session = self
            .store
            .session(session_id)
            .await?
            .ok_or(DelveError::SessionNotFound(session_id))?;
        if session.status.is_terminal() {
            warn!(%session_id, status = %session.status, "document attached to a finished session");
        }

        let document = prepare_document(session_id, &upload)?;
        let document_id = document.id;
        self.store.insert_document(document.clone(), upload.content).await?;

        if let Err(err) = self.scheduler.schedule(WorkItem::Document { document_id }) {
            self.store.claim_document(document_id).await?;
            self.store
                .fail_document(document_id, format!("not scheduled: {err}"))
                .await?;
            return Err(err);
        }
        Ok(document)
    }

    pub async fn session(&self, id: SessionId) -> Result<ResearchSession, DelveError> {
        self.store
            .session(id)
            .await?
            .ok_or(DelveError::SessionNotFound(id))
    }

    /// Session with everything it owns. Document text is left out.
    pub async fn session_detail(&self, id: SessionId) -> Result<SessionDetail, DelveError> {
        let session = self.session(id).await?;
        let summary = self.store.summary(id).await?;
        let reasoning = self.store.reasoning(id).await?;
        let cost = self.store.cost(id).await?;
        let documents = self
            .store
            .documents_for_session(id)
            .await?
            .into_iter()
            .map(UploadedDocument::without_text)
            .collect();

        Ok(SessionDetail {
            session,
            summary,
            reasoning,
            cost,
            documents,
        })
    }

    pub async fn history(&self, filter: &HistoryFilter) -> Result<Vec<ResearchSession>, DelveError> {
        self.store.list_sessions(filter).await
    }

    pub async fn children(&self, id: SessionId) -> Result<Vec<ResearchSession>, DelveError> {
        self.store.list_sessions(&HistoryFilter::children_of(id)).await
    }

    /// Ancestor chain ending in `id`, root first. Stops at a deleted ancestor.
    pub async fn lineage(&self, id: SessionId) -> Result<Vec<ResearchSession>, DelveError> {
        let mut chain = vec![self.session(id).await?];
        let mut seen = HashSet::from([id]);
        while let Some(parent_id) = chain.last().and_then(ResearchSession::parent_id) {
            if !seen.insert(parent_id) {
                break;
            }
            match self.store.session(parent_id).await? {
                Some(parent) => chain.push(parent),
                None => break,
            }
        }
        chain.reverse();
        Ok(chain)
    }

    pub async fn delete_session(&self, id: SessionId) -> Result<(), DelveError> {
        self.store.delete_session(id).await?;
        if let Some(settings) = self.session_log.clone() {
            let session_id = id.to_string();
            let outcome =
                tokio::task::spawn_blocking(move || remove_session_logs(&settings, &session_id)).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%id, error = %err, "failed to purge session logs"),
                Err(err) => warn!(%id, error = %err, "session log purge aborted"),
            }
        }
        info!(session_id = %id, "session deleted");
        Ok(())
    }

    pub async fn document(&self, id: DocumentId) -> Result<UploadedDocument, DelveError> {
        self.store
            .document(id)
            .await?
            .ok_or(DelveError::DocumentNotFound(id))
    }

    /// Poll until the session reaches `completed` or `failed`.
    pub async fn wait_for_terminal(
        &self,
        id: SessionId,
        timeout: Duration,
    ) -> Result<ResearchSession, DelveError> {
        let wait = async {
            loop {
                let session = self.session(id).await?;
                if session.status.is_terminal() {
                    return Ok::<_, DelveError>(session);
                }
                tokio::time::sleep(TERMINAL_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            DelveError::InvalidRequest(format!(
                "session {id} did not finish within {}s",
                timeout.as_secs()
            ))
        })?
    }
}

fn prepare_document(session_id: SessionId, upload: &DocumentUpload) -> Result<UploadedDocument, DelveError> {
    if upload.name.trim().is_empty() {
        return Err(DelveError::InvalidRequest("document name must not be empty".into()));
    }
    if upload.content.is_empty() {
        return Err(DelveError::InvalidRequest(format!(
            "document `{}` is empty",
            upload.name
        )));
    }
    let file_type = upload.resolve_type()?;
    Ok(UploadedDocument::new(
        session_id,
        upload.name.trim(),
        file_type,
        upload.content.len(),
    ))
}

/// Worker-path handler. Every transition goes through the store's state
/// machine, which makes duplicate deliveries no-ops.
pub struct SessionWorker {
    store: Arc<dyn SessionStore>,
    pipeline: SessionPipeline,
    extractor: Arc<dyn TextExtractor>,
    summarizer: Arc<dyn Summarizer>,
    summary_max_chars: usize,
    session_log: Option<SessionLogSettings>,
}

impl SessionWorker {
    pub fn new(
        store: Arc<dyn SessionStore>,
        pipeline: SessionPipeline,
        extractor: Arc<dyn TextExtractor>,
        summarizer: Arc<dyn Summarizer>,
        summary_max_chars: usize,
        session_log: Option<SessionLogSettings>,
    ) -> Self {
        Self {
            store,
            pipeline,
            extractor,
            summarizer,
            summary_max_chars,
            session_log,
        }
    }

    #[instrument(name = "worker.session", skip(self), fields(attempt = attempt.number))]
    async fn run_session(&self, session_id: SessionId, attempt: Attempt) -> Result<(), TaskError> {
        let current = match self.store.session(session_id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                debug!(%session_id, "session no longer exists; dropping work");
                return Ok(());
            }
            Err(err) => return Err(self.store_fault(session_id, err, None, attempt).await),
        };

        let session = match current.status {
            SessionStatus::Pending => match self.store.claim_session(session_id).await {
                Ok(session) => session,
                Err(DelveError::Transition(_)) | Err(DelveError::SessionNotFound(_)) => {
                    debug!(%session_id, "session claimed elsewhere");
                    return Ok(());
                }
                Err(err) => return Err(self.store_fault(session_id, err, None, attempt).await),
            },
            SessionStatus::Running if !attempt.is_first() => current,
            status => {
                debug!(%session_id, %status, "duplicate delivery ignored");
                return Ok(());
            }
        };

        match self.pipeline.run(&session, attempt.number).await {
            Ok(completion) => {
                let cost = ResearchCost::new(session_id, completion.cost.clone());
                let summary = completion.summary.clone();
                let trace_id = completion.trace_id.clone();
                match self.store.complete_session(session_id, completion).await {
                    Ok(done) => {
                        info!(%session_id, trace_id = ?done.trace_id, "session completed");
                        self.audit(&done, Some(summary), Some(cost)).await;
                        Ok(())
                    }
                    Err(DelveError::Transition(_)) | Err(DelveError::SessionNotFound(_)) => {
                        debug!(%session_id, "session changed state during run; result discarded");
                        Ok(())
                    }
                    Err(err) => Err(self.store_fault(session_id, err, trace_id, attempt).await),
                }
            }
            Err(failure) if failure.retryable && !attempt.is_last() => {
                Err(TaskError::retryable(failure.reason))
            }
            Err(failure) => Err(self.record_failure(session_id, failure.reason, failure.trace_id).await),
        }
    }

    /// Store faults are retried; on the last attempt the session is failed
    /// so it never stays `running`.
    async fn store_fault(
        &self,
        session_id: SessionId,
        err: DelveError,
        trace_id: Option<String>,
        attempt: Attempt,
    ) -> TaskError {
        if !attempt.is_last() {
            return retryable(err);
        }
        self.record_failure(session_id, format!("internal error: {err}"), trace_id)
            .await
    }

    async fn record_failure(
        &self,
        session_id: SessionId,
        reason: String,
        trace_id: Option<String>,
    ) -> TaskError {
        match self.store.fail_session(session_id, reason.clone(), trace_id).await {
            Ok(failed) => {
                warn!(%session_id, %reason, "session failed");
                self.audit(&failed, None, None).await;
            }
            Err(err) => warn!(%session_id, error = %err, "could not record session failure"),
        }
        TaskError::terminal(reason)
    }

    #[instrument(name = "worker.document", skip(self), fields(attempt = attempt.number))]
    async fn process_document(&self, document_id: DocumentId, attempt: Attempt) -> Result<(), TaskError> {
        let Some(current) = self.store.document(document_id).await.map_err(retryable)? else {
            debug!(%document_id, "document no longer exists; dropping work");
            return Ok(());
        };

        let document = match current.status {
            DocumentStatus::Uploaded => match self.store.claim_document(document_id).await {
                Ok(document) => document,
                Err(DelveError::Transition(_)) | Err(DelveError::DocumentNotFound(_)) => return Ok(()),
                Err(err) => return Err(retryable(err)),
            },
            DocumentStatus::Processing if !attempt.is_first() => current,
            _ => return Ok(()),
        };

        let Some(bytes) = self.store.upload_content(document_id).await.map_err(retryable)? else {
            return self.fail_document(document_id, "upload content is gone".into()).await;
        };

        let extractor = self.extractor.clone();
        let file_type = document.file_type;
        let extracted =
            tokio::task::spawn_blocking(move || extractor.extract(&bytes, file_type)).await;
        let text = match extracted {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => return self.fail_document(document_id, err.to_string()).await,
            Err(err) => {
                return self
                    .fail_document(document_id, format!("extraction aborted: {err}"))
                    .await;
            }
        };

        let summary = match self.summarizer.summarize(&text, self.summary_max_chars).await {
            Ok(summary) => summary,
            Err(err) if err.is_retryable() && !attempt.is_last() => {
                return Err(TaskError::retryable(err.to_string()));
            }
            Err(err) => return self.fail_document(document_id, err.to_string()).await,
        };

        match self.store.complete_document(document_id, text, summary).await {
            Ok(done) => {
                info!(%document_id, session_id = %done.session_id, "document processed");
                Ok(())
            }
            Err(DelveError::DocumentNotFound(_)) => Ok(()),
            Err(err) => Err(retryable(err)),
        }
    }

    async fn fail_document(&self, document_id: DocumentId, reason: String) -> Result<(), TaskError> {
        warn!(%document_id, %reason, "document processing failed");
        match self.store.fail_document(document_id, reason.clone()).await {
            Ok(_) | Err(DelveError::DocumentNotFound(_)) => {}
            Err(err) => warn!(%document_id, error = %err, "could not record document failure"),
        }
        Err(TaskError::terminal(reason))
    }

    async fn audit(&self, session: &ResearchSession, summary: Option<String>, cost: Option<ResearchCost>) {
        let Some(settings) = self.session_log.clone() else {
            return;
        };
        let input = SessionLogInput {
            session_id: session.id.to_string(),
            parent_id: session.parent_id().map(|id| id.to_string()),
            query: session.query.clone(),
            status: session.status,
            summary,
            failure_reason: session.failure_reason.clone(),
            trace_id: session.trace_id.clone(),
            cost,
        };
        match tokio::task::spawn_blocking(move || log_session_outcome(&settings, input)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(session_id = %session.id, error = %err, "failed to write session log"),
            Err(err) => warn!(session_id = %session.id, error = %err, "session log write aborted"),
        }
    }
}

fn retryable(err: DelveError) -> TaskError {
    TaskError::retryable(err.to_string())
}

#[async_trait]
impl WorkHandler for SessionWorker {
    async fn handle(&self, item: &WorkItem, attempt: Attempt) -> Result<(), TaskError> {
        match *item {
            WorkItem::Session { session_id } => self.run_session(session_id, attempt).await,
            WorkItem::Document { document_id } => self.process_document(document_id, attempt).await,
        }
    }
}
