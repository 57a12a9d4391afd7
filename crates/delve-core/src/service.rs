use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::{HttpResearchEngine, ResearchAgentAdapter, ResearchEngine, StubResearchEngine};
use crate::config::{AgentProvider, Config, SummarizerProvider};
use crate::documents::{DefaultTextExtractor, TextExtractor};
use crate::error::DelveError;
use crate::lifecycle::{SessionManager, SessionWorker};
use crate::scheduler::TaskScheduler;
use crate::store::{InMemorySessionStore, SessionStore};
use crate::summarize::{ExtractiveSummarizer, LlmSummarizer, Summarizer};
use crate::trace::{FileTraceSink, NoopTraceSink, TraceSink};
use crate::workflow::{PipelineDeps, SessionPipeline};

/// Pluggable collaborators of a running service.
#[derive(Clone)]
pub struct ServiceComponents {
    pub store: Arc<dyn SessionStore>,
    pub engine: Arc<dyn ResearchEngine>,
    pub trace_sink: Arc<dyn TraceSink>,
    pub extractor: Arc<dyn TextExtractor>,
    pub summarizer: Arc<dyn Summarizer>,
}

impl ServiceComponents {
    /// Components described by `config`. Secrets are read from the
    /// environment here.
    pub fn from_config(config: &Config) -> Result<Self, DelveError> {
        let engine: Arc<dyn ResearchEngine> = match config.agent.provider {
            AgentProvider::Http => {
                let endpoint = config.agent.endpoint.clone().ok_or_else(|| {
                    DelveError::InvalidConfiguration("agent.endpoint is required".into())
                })?;
                Arc::new(HttpResearchEngine::new(
                    endpoint,
                    config.agent.model.clone(),
                    config.agent_api_key()?,
                ))
            }
            AgentProvider::Stub => Arc::new(StubResearchEngine::new(config.agent.model.clone())),
        };

        let summarizer: Arc<dyn Summarizer> = match config.summarizer.provider {
            SummarizerProvider::Extractive => Arc::new(ExtractiveSummarizer),
            SummarizerProvider::Llm => {
                let endpoint = config.summarizer.endpoint.clone().ok_or_else(|| {
                    DelveError::InvalidConfiguration("summarizer.endpoint is required".into())
                })?;
                let model = config
                    .summarizer
                    .model
                    .clone()
                    .unwrap_or_else(|| config.agent.model.clone());
                Arc::new(LlmSummarizer::new(endpoint, model, config.summarizer_api_key()?))
            }
        };

        let trace_sink: Arc<dyn TraceSink> = match &config.tracing.trace_dir {
            Some(dir) => Arc::new(FileTraceSink::new(dir.clone())),
            None => Arc::new(NoopTraceSink),
        };

        Ok(Self {
            store: Arc::new(InMemorySessionStore::new()),
            engine,
            trace_sink,
            extractor: Arc::new(DefaultTextExtractor),
            summarizer,
        })
    }

    /// Everything local: stub engine, extractive summaries, no trace files.
    pub fn offline(config: &Config) -> Self {
        Self {
            store: Arc::new(InMemorySessionStore::new()),
            engine: Arc::new(StubResearchEngine::new(config.agent.model.clone())),
            trace_sink: Arc::new(NoopTraceSink),
            extractor: Arc::new(DefaultTextExtractor),
            summarizer: Arc::new(ExtractiveSummarizer),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn ResearchEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_trace_sink(mut self, trace_sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = trace_sink;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }
}

/// A running orchestration engine: the request-path manager plus the
/// scheduler and workers behind it.
pub struct ResearchService {
    manager: SessionManager,
    scheduler: TaskScheduler,
    dispatcher: JoinHandle<()>,
}

impl ResearchService {
    /// Wire the pipeline and start the worker pool. Must be called inside a
    /// Tokio runtime.
    pub fn start(config: &Config, components: ServiceComponents) -> Self {
        let pricing = Arc::new(config.pricing_table());
        let adapter = ResearchAgentAdapter::new(
            components.engine,
            components.trace_sink,
            config.agent.timeout(),
            config.agent.max_reasoning_steps,
        );
        let engine_name = adapter.engine_name().to_string();

        let pipeline = SessionPipeline::new(PipelineDeps {
            store: components.store.clone(),
            adapter,
            summarizer: components.summarizer.clone(),
            pricing,
            default_model: config.agent.model.clone(),
            summary_max_chars: config.context.summary_max_chars,
            document_wait: config.context.document_wait(),
        });

        let session_log = config.session_log_settings();
        let worker = SessionWorker::new(
            components.store.clone(),
            pipeline,
            components.extractor,
            components.summarizer,
            config.context.summary_max_chars,
            session_log.clone(),
        );

        let (scheduler, dispatcher) = TaskScheduler::start(&config.scheduler, Arc::new(worker));
        let manager = SessionManager::new(components.store, scheduler.clone(), session_log);

        info!(engine = %engine_name, model = %config.agent.model, "research service started");
        Self {
            manager,
            scheduler,
            dispatcher,
        }
    }

    pub fn manager(&self) -> SessionManager {
        self.manager.clone()
    }

    /// Stop accepting work and wait for queued and running units.
    pub async fn shutdown(self) {
        self.scheduler.shutdown();
        if let Err(err) = self.dispatcher.await {
            warn!(error = %err, "scheduler dispatcher ended abnormally");
        }
        info!("research service stopped");
    }
}
