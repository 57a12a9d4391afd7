use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions, create_dir_all};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::warn;

use crate::model::{ResearchCost, SessionStatus};

pub const DEFAULT_RETENTION_DAYS: u64 = 90;
pub const SESSION_LOG_FILE: &str = "session.jsonl";
const AUDIT_LOG_FILE: &str = "audit.jsonl";

static REDACTION_PATTERNS: Lazy<Vec<(String, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api_key".to_string(),
            Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid api_key regex"),
        ),
        (
            "secret".to_string(),
            Regex::new(r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid secret regex"),
        ),
        (
            "bearer".to_string(),
            Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        ),
        (
            "sk_token".to_string(),
            Regex::new(r"(sk-[A-Za-z0-9]{16,})").expect("invalid sk_token regex"),
        ),
    ]
});

/// Where terminal session outcomes are appended.
#[derive(Debug, Clone)]
pub struct SessionLogSettings {
    pub dir: PathBuf,
    pub retention_days: u64,
}

impl SessionLogSettings {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    pub fn with_retention_days(mut self, days: u64) -> Self {
        self.retention_days = days;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SessionLogInput {
    pub session_id: String,
    pub parent_id: Option<String>,
    pub query: String,
    pub status: SessionStatus,
    pub summary: Option<String>,
    pub failure_reason: Option<String>,
    pub trace_id: Option<String>,
    pub cost: Option<ResearchCost>,
}

/// Usage columns of a logged session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedCost {
    pub model_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
}

/// One line of `session.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLogRecord {
    pub timestamp: String,
    pub session_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub query: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub cost: Option<LoggedCost>,
    #[serde(default)]
    pub redactions: Vec<String>,
}

#[derive(Serialize)]
struct AuditLogRecord {
    timestamp: String,
    session_id: String,
    redactions: Vec<String>,
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{}", line)
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn sanitize_text(input: &str, redactions: &mut BTreeSet<String>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .to_string();
        if matched {
            redactions.insert(name.clone());
        }
    }
    output
}

/// Append the terminal outcome of a session to the monthly audit log.
pub fn log_session_outcome(settings: &SessionLogSettings, input: SessionLogInput) -> Result<()> {
    let timestamp = Utc::now();
    let mut redactions = BTreeSet::new();

    let query = sanitize_text(&input.query, &mut redactions);
    let summary = input
        .summary
        .as_deref()
        .map(|value| sanitize_text(value, &mut redactions));
    let failure_reason = input
        .failure_reason
        .as_deref()
        .map(|value| sanitize_text(value, &mut redactions));
    let cost = input.cost.map(|cost| LoggedCost {
        model_name: cost.model_name,
        input_tokens: cost.input_tokens,
        output_tokens: cost.output_tokens,
        total_tokens: cost.total_tokens,
        estimated_cost_usd: cost.estimated_cost_usd,
    });

    let record = SessionLogRecord {
        timestamp: timestamp.to_rfc3339(),
        session_id: input.session_id.clone(),
        parent_id: input.parent_id,
        query,
        status: input.status,
        summary,
        failure_reason,
        trace_id: input.trace_id,
        cost,
        redactions: redactions.into_iter().collect(),
    };

    let month_dir = settings
        .dir
        .join(format!("{:04}", timestamp.year()))
        .join(format!("{:02}", timestamp.month()));
    append_json_line(&month_dir.join(SESSION_LOG_FILE), &record)?;

    if !record.redactions.is_empty() {
        let audit = AuditLogRecord {
            timestamp: record.timestamp.clone(),
            session_id: input.session_id.clone(),
            redactions: record.redactions.clone(),
        };
        append_json_line(&month_dir.join(AUDIT_LOG_FILE), &audit)?;
        warn!(
            session_id = %input.session_id,
            fields = ?record.redactions,
            "redacted potential secrets from session log"
        );
    }

    enforce_retention(&settings.dir, settings.retention_days)?;

    Ok(())
}

fn enforce_retention(base_dir: &Path, retention_days: u64) -> Result<()> {
    if retention_days == 0 || !base_dir.exists() {
        return Ok(());
    }
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention_days.saturating_mul(86_400)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    prune_directory(base_dir, cutoff)?;
    Ok(())
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            if path.read_dir()?.next().is_none() {
                fs::remove_dir(&path).ok();
            }
        } else if metadata.is_file()
            && metadata
                .modified()
                .map(|time| time < cutoff)
                .unwrap_or(false)
        {
            fs::remove_file(&path).ok();
        }
    }

    Ok(())
}

/// Strip every line mentioning `session_id` from the session and audit logs.
pub fn remove_session_logs(settings: &SessionLogSettings, session_id: &str) -> Result<()> {
    let base_dir = &settings.dir;
    if !base_dir.exists() {
        return Ok(());
    }

    for year_entry in fs::read_dir(base_dir)? {
        let year_entry = year_entry?;
        if !year_entry.file_type()?.is_dir() {
            continue;
        }
        for month_entry in fs::read_dir(year_entry.path())? {
            let month_entry = month_entry?;
            if !month_entry.file_type()?.is_dir() {
                continue;
            }
            for name in [SESSION_LOG_FILE, AUDIT_LOG_FILE] {
                let path = month_entry.path().join(name);
                rewrite_jsonl_without(&path, session_id)?;
                cleanup_empty_file(&path)?;
            }

            if month_entry.path().read_dir()?.next().is_none() {
                fs::remove_dir(month_entry.path()).ok();
            }
        }
        if year_entry.path().read_dir()?.next().is_none() {
            fs::remove_dir(year_entry.path()).ok();
        }
    }

    Ok(())
}

fn rewrite_jsonl_without(path: &Path, session_id: &str) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let file =
        File::open(path).with_context(|| format!("failed to open log file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut retained = Vec::new();
    let mut removed = false;
    for line in reader.lines() {
        let line = line?;
        let matches = serde_json::from_str::<serde_json::Value>(&line)
            .ok()
            .and_then(|value| value.get("session_id").and_then(|v| v.as_str()).map(str::to_string))
            .is_some_and(|id| id == session_id);
        if matches {
            removed = true;
            continue;
        }
        retained.push(line);
    }

    if removed {
        let file = File::create(path)
            .with_context(|| format!("failed to rewrite log file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for line in retained {
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;
    }

    Ok(())
}

fn cleanup_empty_file(path: &Path) -> Result<()> {
    if path.exists() {
        let metadata = path.metadata()?;
        if metadata.len() == 0 {
            fs::remove_file(path).ok();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    fn input(session_id: &str) -> SessionLogInput {
        SessionLogInput {
            session_id: session_id.to_string(),
            parent_id: None,
            query: "Find api_key=abcd1234".to_string(),
            status: SessionStatus::Completed,
            summary: Some("Summary with secret=topsecret".to_string()),
            failure_reason: None,
            trace_id: Some("trace-1".to_string()),
            cost: None,
        }
    }

    #[test]
    fn session_logging_sanitizes_and_persists() -> Result<()> {
        let temp = TempDir::new().expect("temp dir");
        let settings = SessionLogSettings::new(temp.path()).with_retention_days(0);

        log_session_outcome(&settings, input("test-session"))?;

        let year_dir = temp.path().read_dir()?.next().unwrap()?.path();
        let month_dir = year_dir.read_dir()?.next().unwrap()?.path();
        let session_log = month_dir.join(SESSION_LOG_FILE);
        let line = std::fs::read_to_string(&session_log)?;
        let record: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(record["session_id"], "test-session");
        assert_eq!(record["status"], "completed");
        assert!(record["summary"].as_str().unwrap().contains("[REDACTED]"));
        assert!(!line.contains("abcd1234"));
        assert!(month_dir.join(AUDIT_LOG_FILE).exists());

        Ok(())
    }

    #[test]
    fn removal_keeps_other_sessions() -> Result<()> {
        let temp = TempDir::new().expect("temp dir");
        let settings = SessionLogSettings::new(temp.path()).with_retention_days(0);
        log_session_outcome(&settings, input("keep-me"))?;
        log_session_outcome(&settings, input("drop-me"))?;

        remove_session_logs(&settings, "drop-me")?;

        let year_dir = temp.path().read_dir()?.next().unwrap()?.path();
        let month_dir = year_dir.read_dir()?.next().unwrap()?.path();
        let remaining = std::fs::read_to_string(month_dir.join(SESSION_LOG_FILE))?;
        assert!(remaining.contains("keep-me"));
        assert!(!remaining.contains("drop-me"));
        Ok(())
    }
}
