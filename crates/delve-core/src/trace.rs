use std::fmt::Write as _;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::ReasoningStep;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub phase: String,
    pub message: String,
    pub timestamp_ms: u128,
}

impl TraceEvent {
    pub fn new(phase: impl Into<String>, message: impl Into<String>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            phase: phase.into(),
            message: message.into(),
            timestamp_ms,
        }
    }
}

/// How a traced execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TraceOutcome {
    Success,
    Failure { reason: String },
    Timeout { timeout_ms: u64 },
    /// The scope was dropped without an explicit outcome.
    Abandoned,
}

impl TraceOutcome {
    pub fn describe(&self) -> String {
        match self {
            TraceOutcome::Success => "success".to_string(),
            TraceOutcome::Failure { reason } => format!("failure: {reason}"),
            TraceOutcome::Timeout { timeout_ms } => format!("timeout after {timeout_ms}ms"),
            TraceOutcome::Abandoned => "abandoned".to_string(),
        }
    }
}

/// Best-effort correlation of one execution with external observability.
///
/// Implementations must never fail the caller: `begin` returns `None` when
/// no identifier could be assigned.
pub trait TraceSink: Send + Sync {
    fn begin(&self, label: &str) -> Option<String>;
    fn end(&self, trace_id: &str, outcome: &TraceOutcome);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn begin(&self, _label: &str) -> Option<String> {
        None
    }

    fn end(&self, _trace_id: &str, _outcome: &TraceOutcome) {}
}

/// Writes `<dir>/<trace_id>.json` with the begin and end events of each run.
///
/// Writes are synchronous; async callers go through
/// [`TraceScope::begin_blocking`] and [`TraceScope::finish_blocking`].
#[derive(Debug)]
pub struct FileTraceSink {
    dir: PathBuf,
    open: DashMap<String, Vec<TraceEvent>>,
}

impl FileTraceSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            open: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl TraceSink for FileTraceSink {
    fn begin(&self, label: &str) -> Option<String> {
        let trace_id = format!("trace-{}", Uuid::new_v4());
        let events = vec![TraceEvent::new("begin", label)];
        if let Err(err) = persist_trace(&self.dir, &trace_id, &events) {
            tracing::warn!(error = %err, label, "trace sink unavailable; continuing untraced");
            return None;
        }
        self.open.insert(trace_id.clone(), events);
        Some(trace_id)
    }

    fn end(&self, trace_id: &str, outcome: &TraceOutcome) {
        let Some((_, mut events)) = self.open.remove(trace_id) else {
            tracing::debug!(trace_id, "end called for unknown trace");
            return;
        };
        events.push(TraceEvent::new("end", outcome.describe()));
        if let Err(err) = persist_trace(&self.dir, trace_id, &events) {
            tracing::warn!(error = %err, trace_id, "failed to persist trace end");
        }
    }
}

/// Begin/end pair around one traced call.
///
/// `finish` records the outcome; a scope dropped without it still ends the
/// trace as [`TraceOutcome::Abandoned`].
pub struct TraceScope {
    sink: Arc<dyn TraceSink>,
    trace_id: Option<String>,
    finished: bool,
}

impl TraceScope {
    pub fn begin(sink: Arc<dyn TraceSink>, label: &str) -> Self {
        let trace_id = sink.begin(label);
        Self {
            sink,
            trace_id,
            finished: false,
        }
    }

    /// [`TraceScope::begin`] with the sink call moved onto the blocking pool.
    pub async fn begin_blocking(sink: Arc<dyn TraceSink>, label: &str) -> Self {
        let task_sink = sink.clone();
        let label = label.to_string();
        let trace_id = match tokio::task::spawn_blocking(move || task_sink.begin(&label)).await {
            Ok(trace_id) => trace_id,
            Err(err) => {
                tracing::warn!(error = %err, "trace begin aborted; continuing untraced");
                None
            }
        };
        Self {
            sink,
            trace_id,
            finished: false,
        }
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// [`TraceScope::finish`] with the sink call moved onto the blocking pool.
    pub async fn finish_blocking(mut self, outcome: TraceOutcome) -> Option<String> {
        self.finished = true;
        let trace_id = self.trace_id.take()?;
        let sink = self.sink.clone();
        let id = trace_id.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || sink.end(&id, &outcome)).await {
            tracing::warn!(error = %err, %trace_id, "trace end aborted");
        }
        Some(trace_id)
    }

    pub fn finish(mut self, outcome: TraceOutcome) -> Option<String> {
        self.close(&outcome);
        self.trace_id.take()
    }

    fn close(&mut self, outcome: &TraceOutcome) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(trace_id) = &self.trace_id {
            self.sink.end(trace_id, outcome);
        }
    }
}

impl Drop for TraceScope {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(trace_id = ?self.trace_id, "trace scope dropped before finish");
            self.close(&TraceOutcome::Abandoned);
        }
    }
}

pub fn persist_trace<P: AsRef<Path>>(
    dir: P,
    trace_id: &str,
    events: &[TraceEvent],
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
    let path = dir.join(format!("{trace_id}.json"));
    let payload = serde_json::to_vec_pretty(events)?;
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write trace file {}", path.display()))?;
    Ok(path)
}

/// Renders a session's reasoning steps for humans.
#[derive(Debug, Clone, Copy)]
pub struct ReasoningTimeline<'a> {
    steps: &'a [ReasoningStep],
}

impl<'a> ReasoningTimeline<'a> {
    pub fn new(steps: &'a [ReasoningStep]) -> Self {
        Self { steps }
    }

    pub fn render(&self, format: ExplainFormat) -> String {
        match format {
            ExplainFormat::Markdown => self.render_markdown(),
            ExplainFormat::Mermaid => self.render_mermaid(),
        }
    }

    pub fn render_markdown(&self) -> String {
        if self.steps.is_empty() {
            return "No reasoning steps recorded.".to_string();
        }
        let mut output = String::from("### Reasoning\n");
        for step in self.steps {
            let _ = writeln!(
                output,
                "{}. **{}** → {}",
                step.index, step.step_type, step.description
            );
        }
        output
    }

    pub fn render_mermaid(&self) -> String {
        if self.steps.is_empty() {
            return "flowchart TD\n  %% no reasoning steps recorded".to_string();
        }

        let mut output = String::from("flowchart TD\n");
        for step in self.steps {
            let label = sanitize_mermaid(&format!("{}: {}", step.step_type, step.description));
            let _ = writeln!(output, "  step{}[\"{label}\"]", step.index);
        }

        for pair in self.steps.windows(2) {
            let _ = writeln!(output, "  step{} --> step{}", pair[0].index, pair[1].index);
        }

        output
    }
}

/// Output formats accepted by `--explain` and `?explain=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplainFormat {
    Markdown,
    Mermaid,
}

impl ExplainFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExplainFormat::Markdown => "markdown",
            ExplainFormat::Mermaid => "mermaid",
        }
    }
}

impl std::str::FromStr for ExplainFormat {
    type Err = crate::error::DelveError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(ExplainFormat::Markdown),
            "mermaid" => Ok(ExplainFormat::Mermaid),
            other => Err(crate::error::DelveError::InvalidRequest(format!(
                "unknown explain format `{other}`"
            ))),
        }
    }
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}
