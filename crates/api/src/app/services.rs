use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tokio::sync::mpsc;

use batchflow_core::RunId;
use batchflow_infra::collaborators::{
    HttpInferenceService, HttpRecordQuery, HttpResultWriter, InMemoryInferenceService,
    InMemoryRecordTable,
};
use batchflow_infra::{
    Collaborators, CompletionListener, Config, InMemoryMetadataStore, InMemoryRunStore,
    MetadataStore, Orchestrator, OrchestratorConfig, PostgresMetadataStore, PostgresRunStore,
    ResumeWorker, ResumeWorkerHandle, RunStore, Scheduler, SchedulerHandle, describe_schedule,
};

/// Capacity of the completion → resume queue.
const RESUME_QUEUE_CAPACITY: usize = 1024;

/// Everything the HTTP handlers need.
#[derive(Clone)]
pub struct AppServices {
    pub orchestrator: Arc<Orchestrator>,
    pub listener: CompletionListener,
}

/// Services plus the receiving end of the resume queue, not yet running.
pub struct Wired {
    pub services: Arc<AppServices>,
    pub resume_rx: mpsc::Receiver<RunId>,
}

impl Wired {
    /// Wire an orchestrator over the given stores and collaborators.
    pub fn new(
        runs: Arc<dyn RunStore>,
        metadata: Arc<dyn MetadataStore>,
        collaborators: Collaborators,
        config: &OrchestratorConfig,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(
            runs,
            metadata.clone(),
            collaborators,
            config.budgets.clone(),
            config.retry.clone(),
        )
        .with_job_retention(config.job_retention));
        let (listener, resume_rx) = CompletionListener::new(metadata, RESUME_QUEUE_CAPACITY);
        Self {
            services: Arc::new(AppServices {
                orchestrator,
                listener,
            }),
            resume_rx,
        }
    }
}

/// Background tasks: the resume worker and the scheduler/sweeper.
pub struct Background {
    resume: ResumeWorkerHandle,
    scheduler: Option<SchedulerHandle>,
}

impl Background {
    /// Start the resume worker, and the scheduler unless `scheduler` is `None`.
    pub fn spawn(wired: Wired, scheduler: Option<Scheduler>) -> (Arc<AppServices>, Self) {
        let Wired {
            services,
            resume_rx,
        } = wired;
        let resume = ResumeWorker::spawn(services.orchestrator.clone(), resume_rx);
        let scheduler = scheduler.map(|s| s.spawn(services.orchestrator.clone()));
        (services, Self { resume, scheduler })
    }

    pub async fn shutdown(self) {
        if let Some(scheduler) = self.scheduler {
            scheduler.shutdown().await;
        }
        self.resume.shutdown().await;
    }
}

/// Build stores and collaborators from configuration.
pub async fn build_services(config: &Config) -> anyhow::Result<Wired> {
    let (runs, metadata): (Arc<dyn RunStore>, Arc<dyn MetadataStore>) = match &config.database_url {
        Some(database_url) => {
            tracing::info!("using Postgres-backed stores");
            let pool = PgPool::connect(database_url)
                .await
                .context("failed to connect to Postgres")?;

            let runs = PostgresRunStore::new(pool.clone());
            runs.ensure_schema().await.context("failed to prepare run table")?;
            let metadata = PostgresMetadataStore::new(pool);
            metadata.ensure_schema().await.context("failed to prepare job table")?;
            (Arc::new(runs), Arc::new(metadata))
        }
        None => {
            tracing::warn!("using in-memory stores; runs are lost on restart");
            (InMemoryRunStore::arc(), InMemoryMetadataStore::arc())
        }
    };

    let collaborators = match &config.collaborators {
        Some(urls) => {
            tracing::info!(
                query = %urls.query,
                inference = %urls.inference,
                writer = %urls.writer,
                "using HTTP collaborators"
            );
            Collaborators {
                records: Arc::new(
                    HttpRecordQuery::new(urls.query.clone())
                        .context("failed to build record query client")?,
                ),
                inference: Arc::new(
                    HttpInferenceService::new(urls.inference.clone())
                        .context("failed to build inference client")?,
                ),
                writer: Arc::new(
                    HttpResultWriter::new(urls.writer.clone())
                        .context("failed to build result writer client")?,
                ),
            }
        }
        None => {
            tracing::warn!("no collaborator endpoints configured; using in-memory collaborators");
            let table = InMemoryRecordTable::arc();
            Collaborators {
                records: table.clone(),
                inference: InMemoryInferenceService::arc(),
                writer: table,
            }
        }
    };

    Ok(Wired::new(runs, metadata, collaborators, &config.orchestrator))
}

/// Scheduler for the configured parameters; logs the cadence.
pub fn scheduler(config: &OrchestratorConfig) -> anyhow::Result<Scheduler> {
    let cadence = describe_schedule(config.schedule_interval_hours).map_err(anyhow::Error::msg)?;
    tracing::info!(
        parameters = ?config.parameters.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        schedule = %cadence,
        sweep_interval_secs = config.sweep_interval.as_secs(),
        "scheduler configured"
    );
    Ok(Scheduler {
        parameters: config.parameters.clone(),
        schedule_interval: config.schedule_interval(),
        sweep_interval: config.sweep_interval,
    })
}
