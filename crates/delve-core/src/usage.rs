use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::logging::SessionLogRecord;
use crate::model::SessionStatus;

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ModelTotals {
    pub sessions: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
}

/// Aggregate of a `session.jsonl` audit log.
#[derive(Debug, Default, Clone, Serialize)]
pub struct UsageReport {
    pub total_sessions: usize,
    pub completed: usize,
    pub failed: usize,
    pub continuations: usize,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
    pub per_model: BTreeMap<String, ModelTotals>,
    pub failures: Vec<String>,
}

impl UsageReport {
    pub fn record(&mut self, entry: &SessionLogRecord) {
        self.total_sessions += 1;
        match entry.status {
            SessionStatus::Completed => self.completed += 1,
            SessionStatus::Failed => {
                self.failed += 1;
                self.failures.push(entry.session_id.clone());
            }
            _ => {}
        }
        if entry.parent_id.is_some() {
            self.continuations += 1;
        }

        if let Some(cost) = &entry.cost {
            self.total_tokens += cost.total_tokens;
            self.estimated_cost_usd += cost.estimated_cost_usd;
            let totals = self.per_model.entry(cost.model_name.clone()).or_default();
            totals.sessions += 1;
            totals.input_tokens += cost.input_tokens;
            totals.output_tokens += cost.output_tokens;
            totals.estimated_cost_usd += cost.estimated_cost_usd;
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} session(s) • {} completed • {} failed • {} continuation(s) • {} tokens • ~${:.4}",
            self.total_sessions,
            self.completed,
            self.failed,
            self.continuations,
            self.total_tokens,
            self.estimated_cost_usd
        )
    }

    pub fn analyze_log(path: impl AsRef<Path>) -> Result<UsageReport> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("failed to open log file {}", path.as_ref().display()))?;
        let mut report = UsageReport::default();

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionLogRecord>(&line) {
                Ok(entry) => report.record(&entry),
                Err(err) => {
                    tracing::debug!(%err, "skipping malformed session log entry");
                }
            }
        }

        Ok(report)
    }
}
