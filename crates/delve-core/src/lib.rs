//! Delve core: research session orchestration on top of `graph_flow`.
//!
//! A session is created on the request path, executed asynchronously by the
//! [`TaskScheduler`] through a compose → research → summarize graph, and
//! persisted with its report, summary, reasoning steps and cost. Completed
//! sessions can be continued; their summary seeds the follow-up query.

mod agent;
mod config;
mod context;
mod cost;
mod documents;
mod error;
mod events;
mod lifecycle;
mod logging;
pub mod metrics;
mod model;
mod scheduler;
mod security;
mod service;
mod store;
mod summarize;
mod tasks;
mod telemetry;
mod trace;
mod usage;
mod workflow;

pub use agent::{
    AgentRun, EngineOutput, EngineRequest, HttpResearchEngine, RawTraceEvent,
    ResearchAgentAdapter, ResearchEngine, StubResearchEngine, reduce_trace,
};
pub use config::{
    AgentConfig, AgentProvider, Config, ConfigLoader, ContextConfig, DEFAULT_MODEL, LoggingConfig,
    SchedulerConfig, SummarizerConfig, SummarizerProvider, TracingConfig,
};
pub use context::{DocumentContext, FINDINGS_HEADER, NO_REPEAT_INSTRUCTION, compose, document_contexts};
pub use cost::{CostAccountant, CostReport, ModelPrice, PricingTable};
pub use documents::{DefaultTextExtractor, TextExtractor};
pub use error::{
    AgentExecutionError, DelveError, DocumentError, InvalidTransition, PricingNotFoundError,
    TaskError,
};
pub use events::{AgentEvent, AgentEventCollector, AgentEventKind};
pub use lifecycle::{SessionManager, SessionRequest, SessionWorker};
pub use logging::{
    DEFAULT_RETENTION_DAYS, SESSION_LOG_FILE, SessionLogInput, SessionLogRecord,
    SessionLogSettings, log_session_outcome, remove_session_logs,
};
pub use model::{
    DocumentId, DocumentStatus, DocumentUpload, FileType, HistoryFilter, ModelUsage,
    ReasoningStep, ResearchCost, ResearchSession, ResearchSummary, SessionCompletion,
    SessionDetail, SessionId, SessionStatus, StepType, UploadedDocument,
};
pub use scheduler::{Accepted, Attempt, TaskScheduler, WorkHandler, WorkItem};
pub use security::{SecretValue, optional_env, require_env};
pub use service::{ResearchService, ServiceComponents};
pub use store::{InMemorySessionStore, SessionStore};
pub use summarize::{ExtractiveSummarizer, LlmSummarizer, Summarizer, bound_text};
pub use tasks::RunFailure;
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{
    ExplainFormat, FileTraceSink, NoopTraceSink, ReasoningTimeline, TraceEvent, TraceOutcome,
    TraceScope, TraceSink, persist_trace,
};
pub use usage::{ModelTotals, UsageReport};
pub use workflow::{PipelineDeps, SessionPipeline};
