//! Persistence boundary for sessions, their artifacts and uploaded documents.
//!
//! Sessions live in an arena keyed by id; the parent link is a plain id, so
//! deleting a parent leaves its children (and their dangling parent id)
//! untouched. Every state change goes through the entity's state machine
//! while holding exactly one map entry, which makes each transition atomic
//! and single-owner.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{DelveError, InvalidTransition};
use crate::model::{
    DocumentId, DocumentStatus, HistoryFilter, ReasoningStep, ResearchCost, ResearchSession,
    ResearchSummary, SessionCompletion, SessionId, SessionStatus, UploadedDocument,
};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: ResearchSession) -> Result<(), DelveError>;

    async fn session(&self, id: SessionId) -> Result<Option<ResearchSession>, DelveError>;

    /// `pending → running`. Only one caller can win the claim.
    async fn claim_session(&self, id: SessionId) -> Result<ResearchSession, DelveError>;

    /// `running → completed`, writing report, summary, reasoning and cost together.
    async fn complete_session(
        &self,
        id: SessionId,
        completion: SessionCompletion,
    ) -> Result<ResearchSession, DelveError>;

    /// `running → failed`. Nothing but the reason and trace id is kept.
    async fn fail_session(
        &self,
        id: SessionId,
        reason: String,
        trace_id: Option<String>,
    ) -> Result<ResearchSession, DelveError>;

    async fn summary(&self, id: SessionId) -> Result<Option<ResearchSummary>, DelveError>;

    async fn reasoning(&self, id: SessionId) -> Result<Vec<ReasoningStep>, DelveError>;

    async fn cost(&self, id: SessionId) -> Result<Option<ResearchCost>, DelveError>;

    /// Newest first.
    async fn list_sessions(&self, filter: &HistoryFilter)
    -> Result<Vec<ResearchSession>, DelveError>;

    /// Remove a session with everything it owns. Children are kept.
    async fn delete_session(&self, id: SessionId) -> Result<(), DelveError>;

    async fn insert_document(
        &self,
        document: UploadedDocument,
        content: Vec<u8>,
    ) -> Result<(), DelveError>;

    async fn document(&self, id: DocumentId) -> Result<Option<UploadedDocument>, DelveError>;

    /// `uploaded → processing`.
    async fn claim_document(&self, id: DocumentId) -> Result<UploadedDocument, DelveError>;

    /// Raw bytes, available until processing settles.
    async fn upload_content(&self, id: DocumentId) -> Result<Option<Vec<u8>>, DelveError>;

    async fn complete_document(
        &self,
        id: DocumentId,
        extracted_text: String,
        summary: String,
    ) -> Result<UploadedDocument, DelveError>;

    async fn fail_document(
        &self,
        id: DocumentId,
        reason: String,
    ) -> Result<UploadedDocument, DelveError>;

    /// Documents attached to `session_id`, in upload order.
    async fn documents_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<UploadedDocument>, DelveError>;
}

#[derive(Debug)]
struct SessionEntry {
    session: ResearchSession,
    summary: Option<ResearchSummary>,
    reasoning: Vec<ReasoningStep>,
    cost: Option<ResearchCost>,
    documents: Vec<DocumentId>,
}

impl SessionEntry {
    fn new(session: ResearchSession) -> Self {
        Self {
            session,
            summary: None,
            reasoning: Vec::new(),
            cost: None,
            documents: Vec::new(),
        }
    }
}

/// `DashMap`-backed store. Never holds entries of two maps at once.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<SessionId, SessionEntry>,
    documents: DashMap<DocumentId, UploadedDocument>,
    uploads: DashMap<DocumentId, Vec<u8>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn session_transition(
        &self,
        id: SessionId,
        next: SessionStatus,
        apply: impl FnOnce(&mut SessionEntry),
    ) -> Result<ResearchSession, DelveError> {
        let mut entry = self
            .sessions
            .get_mut(&id)
            .ok_or(DelveError::SessionNotFound(id))?;
        entry.session.status = entry.session.status.transition(next)?;
        apply(&mut entry);
        Ok(entry.session.clone())
    }

    fn document_transition(
        &self,
        id: DocumentId,
        next: DocumentStatus,
        apply: impl FnOnce(&mut UploadedDocument),
    ) -> Result<UploadedDocument, DelveError> {
        let updated = {
            let mut document = self
                .documents
                .get_mut(&id)
                .ok_or(DelveError::DocumentNotFound(id))?;
            document.status = document.status.transition(next)?;
            apply(&mut document);
            document.clone()
        };
        if updated.status.is_settled() {
            self.uploads.remove(&id);
        }
        Ok(updated)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert_session(&self, session: ResearchSession) -> Result<(), DelveError> {
        if self.sessions.contains_key(&session.id) {
            return Err(DelveError::InvalidRequest(format!(
                "session {} already exists",
                session.id
            )));
        }
        self.sessions.insert(session.id, SessionEntry::new(session));
        Ok(())
    }

    async fn session(&self, id: SessionId) -> Result<Option<ResearchSession>, DelveError> {
        Ok(self.sessions.get(&id).map(|entry| entry.session.clone()))
    }

    async fn claim_session(&self, id: SessionId) -> Result<ResearchSession, DelveError> {
        self.session_transition(id, SessionStatus::Running, |entry| {
            entry.session.started_at = Some(Utc::now());
        })
    }

    async fn complete_session(
        &self,
        id: SessionId,
        completion: SessionCompletion,
    ) -> Result<ResearchSession, DelveError> {
        let now = Utc::now();
        self.session_transition(id, SessionStatus::Completed, move |entry| {
            entry.session.final_report = Some(completion.final_report);
            entry.session.trace_id = completion.trace_id;
            entry.session.failure_reason = None;
            entry.session.finished_at = Some(now);
            entry.summary = Some(ResearchSummary {
                session_id: id,
                text: completion.summary,
                created_at: now,
            });
            entry.reasoning = completion.reasoning;
            entry.cost = Some(ResearchCost::new(id, completion.cost));
        })
    }

    async fn fail_session(
        &self,
        id: SessionId,
        reason: String,
        trace_id: Option<String>,
    ) -> Result<ResearchSession, DelveError> {
        self.session_transition(id, SessionStatus::Failed, move |entry| {
            entry.session.failure_reason = Some(reason);
            if trace_id.is_some() {
                entry.session.trace_id = trace_id;
            }
            entry.session.final_report = None;
            entry.session.finished_at = Some(Utc::now());
            entry.summary = None;
            entry.reasoning.clear();
            entry.cost = None;
        })
    }

    async fn summary(&self, id: SessionId) -> Result<Option<ResearchSummary>, DelveError> {
        Ok(self
            .sessions
            .get(&id)
            .and_then(|entry| entry.summary.clone()))
    }

    async fn reasoning(&self, id: SessionId) -> Result<Vec<ReasoningStep>, DelveError> {
        Ok(self
            .sessions
            .get(&id)
            .map(|entry| entry.reasoning.clone())
            .unwrap_or_default())
    }

    async fn cost(&self, id: SessionId) -> Result<Option<ResearchCost>, DelveError> {
        Ok(self.sessions.get(&id).and_then(|entry| entry.cost.clone()))
    }

    async fn list_sessions(
        &self,
        filter: &HistoryFilter,
    ) -> Result<Vec<ResearchSession>, DelveError> {
        let mut sessions: Vec<ResearchSession> = self
            .sessions
            .iter()
            .filter(|entry| filter.matches(&entry.session))
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    async fn delete_session(&self, id: SessionId) -> Result<(), DelveError> {
        let status = self
            .sessions
            .get(&id)
            .map(|entry| entry.session.status)
            .ok_or(DelveError::SessionNotFound(id))?;
        if status == SessionStatus::Running {
            return Err(InvalidTransition {
                entity: "session",
                from: status.to_string(),
                to: "deleted".to_string(),
            }
            .into());
        }

        let (_, entry) = self
            .sessions
            .remove_if(&id, |_, entry| entry.session.status != SessionStatus::Running)
            .ok_or(DelveError::SessionNotFound(id))?;
        for document_id in &entry.documents {
            self.documents.remove(document_id);
            self.uploads.remove(document_id);
        }
        debug!(session_id = %id, documents = entry.documents.len(), "session deleted");
        Ok(())
    }

    async fn insert_document(
        &self,
        document: UploadedDocument,
        content: Vec<u8>,
    ) -> Result<(), DelveError> {
        let id = document.id;
        let session_id = document.session_id;
        self.documents.insert(id, document);
        self.uploads.insert(id, content);

        let attached = match self.sessions.get_mut(&session_id) {
            Some(mut entry) => {
                entry.documents.push(id);
                true
            }
            None => false,
        };
        if !attached {
            self.documents.remove(&id);
            self.uploads.remove(&id);
            return Err(DelveError::SessionNotFound(session_id));
        }
        Ok(())
    }

    async fn document(&self, id: DocumentId) -> Result<Option<UploadedDocument>, DelveError> {
        Ok(self.documents.get(&id).map(|doc| doc.clone()))
    }

    async fn claim_document(&self, id: DocumentId) -> Result<UploadedDocument, DelveError> {
        self.document_transition(id, DocumentStatus::Processing, |_| {})
    }

    async fn upload_content(&self, id: DocumentId) -> Result<Option<Vec<u8>>, DelveError> {
        Ok(self.uploads.get(&id).map(|bytes| bytes.clone()))
    }

    async fn complete_document(
        &self,
        id: DocumentId,
        extracted_text: String,
        summary: String,
    ) -> Result<UploadedDocument, DelveError> {
        self.document_transition(id, DocumentStatus::Processed, move |document| {
            document.extracted_text = Some(extracted_text);
            document.summary = Some(summary);
            document.processed_at = Some(Utc::now());
        })
    }

    async fn fail_document(
        &self,
        id: DocumentId,
        reason: String,
    ) -> Result<UploadedDocument, DelveError> {
        self.document_transition(id, DocumentStatus::Failed, move |document| {
            document.failure_reason = Some(reason);
            document.summary = None;
            document.processed_at = Some(Utc::now());
        })
    }

    async fn documents_for_session(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<UploadedDocument>, DelveError> {
        let ids = self
            .sessions
            .get(&session_id)
            .map(|entry| entry.documents.clone())
            .ok_or(DelveError::SessionNotFound(session_id))?;
        Ok(ids
            .iter()
            .filter_map(|id| self.documents.get(id).map(|doc| doc.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::CostReport;
    use crate::model::{FileType, ModelUsage};

    fn completion() -> SessionCompletion {
        SessionCompletion {
            final_report: "full report".into(),
            summary: "short".into(),
            reasoning: Vec::new(),
            cost: CostReport {
                model_name: "gpt-4o".into(),
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
                estimated_cost_usd: 0.000125,
                breakdown: vec![ModelUsage {
                    model_name: "gpt-4o".into(),
                    input_tokens: 10,
                    output_tokens: 5,
                }],
            },
            trace_id: Some("trace".into()),
        }
    }

    #[tokio::test]
    async fn claim_is_single_owner() {
        let store = InMemorySessionStore::new();
        let session = ResearchSession::new("q");
        let id = session.id;
        store.insert_session(session).await.unwrap();

        assert!(store.claim_session(id).await.is_ok());
        let second = store.claim_session(id).await.unwrap_err();
        assert!(matches!(second, DelveError::Transition(_)));
    }

    #[tokio::test]
    async fn pending_cannot_complete_or_fail() {
        let store = InMemorySessionStore::new();
        let session = ResearchSession::new("q");
        let id = session.id;
        store.insert_session(session).await.unwrap();

        assert!(store.complete_session(id, completion()).await.is_err());
        assert!(store.fail_session(id, "x".into(), None).await.is_err());
        assert_eq!(
            store.session(id).await.unwrap().unwrap().status,
            SessionStatus::Pending
        );
    }

    #[tokio::test]
    async fn completion_writes_all_artifacts() {
        let store = InMemorySessionStore::new();
        let session = ResearchSession::new("q");
        let id = session.id;
        store.insert_session(session).await.unwrap();
        store.claim_session(id).await.unwrap();

        let done = store.complete_session(id, completion()).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.trace_id.as_deref(), Some("trace"));
        assert_eq!(store.summary(id).await.unwrap().unwrap().text, "short");
        assert_eq!(store.cost(id).await.unwrap().unwrap().total_tokens, 15);

        // completed is terminal
        assert!(store.fail_session(id, "late".into(), None).await.is_err());
        assert!(store.claim_session(id).await.is_err());
    }

    #[tokio::test]
    async fn delete_cascades_but_keeps_children() {
        let store = InMemorySessionStore::new();
        let parent = ResearchSession::new("parent");
        let parent_id = parent.id;
        store.insert_session(parent).await.unwrap();
        store.claim_session(parent_id).await.unwrap();
        let parent = store.complete_session(parent_id, completion()).await.unwrap();

        let child = ResearchSession::continuation(&parent, "child").unwrap();
        let child_id = child.id;
        store.insert_session(child).await.unwrap();

        let doc = UploadedDocument::new(parent_id, "a.txt", FileType::Txt, 3);
        let doc_id = doc.id;
        store.insert_document(doc, b"abc".to_vec()).await.unwrap();

        store.delete_session(parent_id).await.unwrap();
        assert!(store.session(parent_id).await.unwrap().is_none());
        assert!(store.summary(parent_id).await.unwrap().is_none());
        assert!(store.cost(parent_id).await.unwrap().is_none());
        assert!(store.document(doc_id).await.unwrap().is_none());

        let child = store.session(child_id).await.unwrap().unwrap();
        assert_eq!(child.parent_id(), Some(parent_id));
    }

    #[tokio::test]
    async fn running_sessions_cannot_be_deleted() {
        let store = InMemorySessionStore::new();
        let session = ResearchSession::new("q");
        let id = session.id;
        store.insert_session(session).await.unwrap();
        store.claim_session(id).await.unwrap();
        assert!(matches!(
            store.delete_session(id).await,
            Err(DelveError::Transition(_))
        ));
    }

    #[tokio::test]
    async fn document_lifecycle_drops_upload_bytes() {
        let store = InMemorySessionStore::new();
        let session = ResearchSession::new("q");
        let session_id = session.id;
        store.insert_session(session).await.unwrap();

        let first = UploadedDocument::new(session_id, "one.txt", FileType::Txt, 3);
        let second = UploadedDocument::new(session_id, "two.txt", FileType::Txt, 3);
        let (first_id, second_id) = (first.id, second.id);
        store.insert_document(first, b"one".to_vec()).await.unwrap();
        store.insert_document(second, b"two".to_vec()).await.unwrap();

        store.claim_document(first_id).await.unwrap();
        assert!(store.claim_document(first_id).await.is_err());
        store
            .complete_document(first_id, "one".into(), "1".into())
            .await
            .unwrap();
        assert!(store.upload_content(first_id).await.unwrap().is_none());
        assert!(store.upload_content(second_id).await.unwrap().is_some());

        let names: Vec<_> = store
            .documents_for_session(session_id)
            .await
            .unwrap()
            .into_iter()
            .map(|doc| doc.name)
            .collect();
        assert_eq!(names, vec!["one.txt", "two.txt"]);
    }

    #[tokio::test]
    async fn documents_need_an_existing_session() {
        let store = InMemorySessionStore::new();
        let doc = UploadedDocument::new(uuid::Uuid::new_v4(), "a.txt", FileType::Txt, 1);
        let doc_id = doc.id;
        assert!(matches!(
            store.insert_document(doc, b"a".to_vec()).await,
            Err(DelveError::SessionNotFound(_))
        ));
        assert!(store.document(doc_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn history_filters_by_parent_and_limits() {
        let store = InMemorySessionStore::new();
        let parent = ResearchSession::new("root");
        let parent_id = parent.id;
        store.insert_session(parent).await.unwrap();
        store.claim_session(parent_id).await.unwrap();
        let parent = store.complete_session(parent_id, completion()).await.unwrap();
        for i in 0..3 {
            let child = ResearchSession::continuation(&parent, format!("child {i}")).unwrap();
            store.insert_session(child).await.unwrap();
        }

        let all = store.list_sessions(&HistoryFilter::default()).await.unwrap();
        assert_eq!(all.len(), 4);
        let children = store
            .list_sessions(&HistoryFilter::children_of(parent_id).with_limit(2))
            .await
            .unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|s| s.parent_id() == Some(parent_id)));
    }
}
