//! Asynchronous execution of sessions and document processing.
//!
//! Callers enqueue a [`WorkItem`] and return immediately. A dispatcher hands
//! each item to a bounded pool of workers; a [`WorkHandler`] drives the
//! actual state changes and reports retryable failures, which are retried
//! with exponential backoff up to the configured attempt count. Delivery is
//! at-least-once, so handlers must be idempotent.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{DelveError, TaskError};
use crate::metrics;
use crate::model::{DocumentId, SessionId};

/// Durable descriptor of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    Session { session_id: SessionId },
    Document { document_id: DocumentId },
}

impl WorkItem {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::Session { .. } => "session",
            WorkItem::Document { .. } => "document",
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::Session { session_id } => write!(f, "session:{session_id}"),
            WorkItem::Document { document_id } => write!(f, "document:{document_id}"),
        }
    }
}

/// Which delivery of a work item this is (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub max: u32,
}

impl Attempt {
    pub fn is_first(&self) -> bool {
        self.number <= 1
    }

    pub fn is_last(&self) -> bool {
        self.number >= self.max
    }
}

/// Receipt for an enqueued work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub work_id: Uuid,
    pub item: WorkItem,
}

#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    async fn handle(&self, item: &WorkItem, attempt: Attempt) -> Result<(), TaskError>;
}

#[derive(Debug)]
struct Envelope {
    work_id: Uuid,
    item: WorkItem,
}

/// Cheap-to-clone handle for enqueuing work.
#[derive(Clone)]
pub struct TaskScheduler {
    sender: mpsc::Sender<Envelope>,
    shutdown: Arc<watch::Sender<bool>>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl TaskScheduler {
    /// Spawn the dispatcher. The returned handle resolves once the scheduler
    /// has been shut down and all in-flight work has finished.
    pub fn start(config: &SchedulerConfig, handler: Arc<dyn WorkHandler>) -> (Self, JoinHandle<()>) {
        let workers = config.workers.max(1);
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(workers));

        let join = tokio::spawn(dispatch(
            receiver,
            shutdown_rx,
            permits.clone(),
            handler,
            config.clone(),
        ));

        info!(workers, queue_capacity = config.queue_capacity, "task scheduler started");
        (
            Self {
                sender,
                shutdown: Arc::new(shutdown),
                permits,
                workers,
            },
            join,
        )
    }

    /// Enqueue without waiting. A full queue or a stopped scheduler is
    /// reported as [`DelveError::SchedulerUnavailable`].
    pub fn schedule(&self, item: WorkItem) -> Result<Accepted, DelveError> {
        let work_id = Uuid::new_v4();
        self.sender
            .try_send(Envelope { work_id, item })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    DelveError::SchedulerUnavailable("work queue is full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    DelveError::SchedulerUnavailable("scheduler is shut down".to_string())
                }
            })?;
        debug!(%work_id, %item, "work accepted");
        Ok(Accepted { work_id, item })
    }

    /// Free queue slots.
    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn in_flight(&self) -> usize {
        self.workers.saturating_sub(self.permits.available_permits())
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Stop accepting work. Queued and running items still complete.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn dispatch(
    mut receiver: mpsc::Receiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
    permits: Arc<Semaphore>,
    handler: Arc<dyn WorkHandler>,
    config: SchedulerConfig,
) {
    let workers = config.workers.max(1);
    let mut closing = false;

    loop {
        let next = if closing {
            receiver.recv().await
        } else {
            tokio::select! {
                _ = shutdown.changed() => {
                    closing = true;
                    receiver.close();
                    info!("task scheduler draining");
                    continue;
                }
                next = receiver.recv() => next,
            }
        };
        let Some(envelope) = next else {
            break;
        };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let handler = handler.clone();
        let config = config.clone();
        let span = info_span!(
            "scheduler.unit",
            work_id = %envelope.work_id,
            kind = envelope.item.kind()
        );
        tokio::spawn(
            async move {
                let _permit = permit;
                execute_with_retry(handler.as_ref(), &envelope, &config).await;
            }
            .instrument(span),
        );
    }

    // Wait for in-flight units before reporting the scheduler as stopped.
    let _ = permits.acquire_many(workers as u32).await;
    info!("task scheduler stopped");
}

async fn execute_with_retry(handler: &dyn WorkHandler, envelope: &Envelope, config: &SchedulerConfig) {
    let kind = envelope.item.kind();
    let max = config.max_attempts.max(1);
    let started = Instant::now();
    let mut number = 1;

    let status = loop {
        let attempt = Attempt { number, max };
        match handler.handle(&envelope.item, attempt).await {
            Ok(()) => break "succeeded",
            Err(err) if err.retryable && !attempt.is_last() => {
                let backoff = config.backoff_before(number + 1);
                warn!(
                    item = %envelope.item,
                    error = %err,
                    attempt = number,
                    backoff_ms = backoff.as_millis() as u64,
                    "work unit failed, retrying"
                );
                metrics::record_retry(kind);
                tokio::time::sleep(backoff).await;
                number += 1;
            }
            Err(err) => {
                error!(
                    item = %envelope.item,
                    error = %err,
                    attempt = number,
                    "work unit failed permanently"
                );
                break "failed";
            }
        }
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    metrics::record_work_unit(kind, status, duration_ms, number);
}
