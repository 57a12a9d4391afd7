//! Entities persisted for a research session and the state machines that
//! govern sessions and uploaded documents.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cost::CostReport;
use crate::error::{DelveError, DocumentError, InvalidTransition};

pub type SessionId = Uuid;
pub type DocumentId = Uuid;

/// Lifecycle of a research session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Pending, SessionStatus::Running)
                | (SessionStatus::Running, SessionStatus::Completed)
                | (SessionStatus::Running, SessionStatus::Failed)
        )
    }

    pub fn transition(self, next: SessionStatus) -> Result<SessionStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                entity: "session",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = DelveError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(DelveError::InvalidRequest(format!(
                "unknown session status `{other}`"
            ))),
        }
    }
}

/// One research execution unit, either fresh or a continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSession {
    pub id: SessionId,
    pub query: String,
    pub status: SessionStatus,
    parent_id: Option<SessionId>,
    pub trace_id: Option<String>,
    pub final_report: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ResearchSession {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            query: query.into(),
            status: SessionStatus::Pending,
            parent_id: None,
            trace_id: None,
            final_report: None,
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Create a continuation seeded from `parent`, which must have completed.
    pub fn continuation(
        parent: &ResearchSession,
        query: impl Into<String>,
    ) -> Result<Self, DelveError> {
        if parent.status != SessionStatus::Completed {
            return Err(DelveError::InvalidParentState {
                parent_id: parent.id,
                status: parent.status,
            });
        }

        let mut session = Self::new(query);
        session.parent_id = Some(parent.id);
        Ok(session)
    }

    /// The ancestor this session continues; fixed at creation.
    pub fn parent_id(&self) -> Option<SessionId> {
        self.parent_id
    }

    pub fn is_continuation(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// Condensed report used only as context for continuations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSummary {
    pub session_id: SessionId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Closed set of agent-level decisions kept in the reasoning log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    QueryPlanning,
    SourceSelection,
    Research,
    Synthesis,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::QueryPlanning => "query_planning",
            StepType::SourceSelection => "source_selection",
            StepType::Research => "research",
            StepType::Synthesis => "synthesis",
        }
    }

    /// Map an engine node label onto a step type. Unknown labels map to `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "query_planning" | "planning" | "plan" | "generate_report_plan" => {
                Some(StepType::QueryPlanning)
            }
            "source_selection" | "select_sources" | "search" | "web_search" => {
                Some(StepType::SourceSelection)
            }
            "research" | "section_research" | "write_section" | "build_section" => {
                Some(StepType::Research)
            }
            "synthesis" | "synthesize" | "final_report" | "compile_final_report" => {
                Some(StepType::Synthesis)
            }
            _ => None,
        }
    }

    pub fn default_description(&self) -> &'static str {
        match self {
            StepType::QueryPlanning => "Planned the research approach",
            StepType::SourceSelection => "Selected sources to consult",
            StepType::Research => "Researched a section of the report",
            StepType::Synthesis => "Synthesized findings into the final report",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single high-level decision record of an agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub index: usize,
    pub step_type: StepType,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Document formats accepted for upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Pdf,
    Txt,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Txt => "txt",
        }
    }

    /// Infer the type from a file name's extension.
    pub fn from_name(name: &str) -> Result<Self, DocumentError> {
        let extension = name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
            .ok_or_else(|| {
                DocumentError::UnsupportedFormat(format!("`{name}` has no file extension"))
            })?;
        extension.parse()
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = DocumentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pdf" | "application/pdf" => Ok(FileType::Pdf),
            "txt" | "text" | "text/plain" => Ok(FileType::Txt),
            other => Err(DocumentError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Processing lifecycle of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Processed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn is_settled(self) -> bool {
        matches!(self, DocumentStatus::Processed | DocumentStatus::Failed)
    }

    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        matches!(
            (self, next),
            (DocumentStatus::Uploaded, DocumentStatus::Processing)
                | (DocumentStatus::Processing, DocumentStatus::Processed)
                | (DocumentStatus::Processing, DocumentStatus::Failed)
        )
    }

    pub fn transition(self, next: DocumentStatus) -> Result<DocumentStatus, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                entity: "document",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file attached to exactly one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedDocument {
    pub id: DocumentId,
    pub session_id: SessionId,
    pub name: String,
    pub file_type: FileType,
    pub status: DocumentStatus,
    pub size_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl UploadedDocument {
    pub fn new(
        session_id: SessionId,
        name: impl Into<String>,
        file_type: FileType,
        size_bytes: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            name: name.into(),
            file_type,
            status: DocumentStatus::Uploaded,
            size_bytes,
            extracted_text: None,
            summary: None,
            failure_reason: None,
            uploaded_at: Utc::now(),
            processed_at: None,
        }
    }

    /// The same record without the (potentially large) extracted text.
    pub fn without_text(mut self) -> Self {
        self.extracted_text = None;
        self
    }
}

/// Raw file handed in by a client.
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub name: String,
    pub declared_type: Option<FileType>,
    pub content: Vec<u8>,
}

impl DocumentUpload {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            declared_type: None,
            content: content.into(),
        }
    }

    pub fn with_declared_type(mut self, file_type: FileType) -> Self {
        self.declared_type = Some(file_type);
        self
    }

    pub fn resolve_type(&self) -> Result<FileType, DocumentError> {
        match self.declared_type {
            Some(file_type) => Ok(file_type),
            None => FileType::from_name(&self.name),
        }
    }
}

/// Per-model token usage inside a cost record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Token usage and estimated spend of one session run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchCost {
    pub session_id: SessionId,
    pub model_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// An estimate derived from token counts, never billing-grade.
    pub estimated_cost_usd: f64,
    #[serde(default)]
    pub breakdown: Vec<ModelUsage>,
}

impl ResearchCost {
    pub fn new(session_id: SessionId, report: CostReport) -> Self {
        Self {
            session_id,
            model_name: report.model_name,
            input_tokens: report.input_tokens,
            output_tokens: report.output_tokens,
            total_tokens: report.total_tokens,
            estimated_cost_usd: report.estimated_cost_usd,
            breakdown: report.breakdown,
        }
    }
}

/// Everything a successful run persists in one atomic write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCompletion {
    pub final_report: String,
    pub summary: String,
    pub reasoning: Vec<ReasoningStep>,
    pub cost: CostReport,
    pub trace_id: Option<String>,
}

/// Aggregated read model returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    pub session: ResearchSession,
    pub summary: Option<ResearchSummary>,
    pub reasoning: Vec<ReasoningStep>,
    pub cost: Option<ResearchCost>,
    pub documents: Vec<UploadedDocument>,
}

/// Filter for history listings.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub limit: Option<usize>,
    pub parent_id: Option<SessionId>,
    pub status: Option<SessionStatus>,
}

impl HistoryFilter {
    pub fn children_of(parent_id: SessionId) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, session: &ResearchSession) -> bool {
        if let Some(parent_id) = self.parent_id {
            if session.parent_id() != Some(parent_id) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if session.status != status {
                return false;
            }
        }
        true
    }
}
