//! Analysis job controller.
//!
//! [`JobController`] admits requests through the [`AdmissionGuard`], queues
//! job ids on a bounded channel, and runs them on a fixed set of tokio
//! workers. Each worker drives one job through the [`Pipeline`]:
//!
//! | State | Work | Limit |
//! |-------|------|-------|
//! | `ingesting` | select and fetch files | `jobs.ingest_timeout_secs` |
//! | `indexing` | chunk, embed, stage, promote (or reuse) | `jobs.index_timeout_secs` |
//! | `retrieving` | one scoped retrieval per instruction | `jobs.retrieve_timeout_secs` |
//! | `generating` | one artifact per instruction | `jobs.generate_timeout_secs` |
//!
//! The full snapshot is written to the [`StatusStore`] on every
//! transition, so callers only ever poll. A stage error or timeout fails
//! the job with its error kind. The generation a job uses stays leased
//! until the job is terminal, after which superseded generations of the
//! repository are collected when `index.gc_on_complete` is set.
//!
//! On start, jobs left non-terminal by a previous process are failed with
//! `job_interrupted`.

use anyhow::{anyhow, Result};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use repo_lens_core::embedding::Embedder;
use repo_lens_core::error::PipelineError;
use repo_lens_core::models::{RepositorySource, RetrievalResult};
use repo_lens_core::retrieve::{retrieve, RetrievalParams};
use repo_lens_core::store::{collect_superseded, GenerationLeases, IndexStore, Lease};

use crate::config::{Config, JobsConfig};
use crate::embedding::create_embedder;
use crate::generate::{
    create_generator, generate_artifact, GenerationContext, GenerationSettings, Generator,
    InstructionKind,
};
use crate::guard::{AdmissionError, AdmissionGuard, Usage};
use crate::index::{EmbedSettings, IndexBuilder, RetryingEmbedder};
use crate::ingest::Ingestor;
use crate::job::{Actor, AnalysisJob, JobError, JobState};
use crate::sqlite_store::SqliteIndexStore;
use crate::status::{SqliteStatusStore, StatusStore};

/// Per-stage maximum durations.
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub ingest: Duration,
    pub index: Duration,
    pub retrieve: Duration,
    pub generate: Duration,
}

impl StageTimeouts {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            ingest: config.ingest_timeout(),
            index: config.index_timeout(),
            retrieve: config.retrieve_timeout(),
            generate: config.generate_timeout(),
        }
    }
}

/// Run `fut` under `limit`, mapping expiry to `StageTimeout`.
async fn stage<T>(
    name: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::StageTimeout {
            stage: name.to_string(),
            limit_secs: limit.as_secs(),
        }),
    }
}

/// Everything a worker needs to run a job.
pub struct Pipeline {
    pub ingestor: Ingestor,
    pub index: IndexBuilder,
    pub store: Arc<dyn IndexStore>,
    /// Query-side embedder; retries transient failures.
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub status: Arc<dyn StatusStore>,
    pub leases: GenerationLeases,
    pub retrieval: RetrievalParams,
    pub generation: GenerationSettings,
    pub timeouts: StageTimeouts,
    pub gc_on_complete: bool,
}

impl Pipeline {
    /// Wire SQLite-backed stores and configured providers.
    pub fn from_config(config: &Config, pool: SqlitePool) -> Result<Self> {
        let store: Arc<dyn IndexStore> = Arc::new(SqliteIndexStore::new(pool.clone()));
        let status: Arc<dyn StatusStore> = Arc::new(SqliteStatusStore::new(pool));
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        let ingestor = Ingestor::from_config(config)?;
        Ok(Self::new(config, ingestor, store, status, embedder, generator))
    }

    /// Assemble a pipeline from explicit collaborators.
    pub fn new(
        config: &Config,
        ingestor: Ingestor,
        store: Arc<dyn IndexStore>,
        status: Arc<dyn StatusStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let leases = GenerationLeases::new();
        let settings = EmbedSettings::from_config(&config.embedding);
        let index = IndexBuilder::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            config.chunking.params(),
            settings.clone(),
            leases.clone(),
        );
        let embedder: Arc<dyn Embedder> = Arc::new(RetryingEmbedder::new(embedder, settings));
        Self {
            ingestor,
            index,
            store,
            embedder,
            generator,
            status,
            leases,
            retrieval: config.retrieval.params(),
            generation: GenerationSettings::from_config(&config.generation),
            timeouts: StageTimeouts::from_config(&config.jobs),
            gc_on_complete: config.index.gc_on_complete,
        }
    }

    /// Retrieve context for `text` from a repository's current generation,
    /// or from an explicit generation id. `None` when nothing is indexed or
    /// the id belongs to another repository.
    pub async fn query(
        &self,
        source: &RepositorySource,
        generation_id: Option<&str>,
        text: &str,
    ) -> Result<Option<RetrievalResult>, PipelineError> {
        let repo_key = source.repo_key();
        let id = match generation_id {
            Some(id) => id.to_string(),
            None => match self.store.current_generation(&repo_key).await? {
                Some(current) => current.id,
                None => return Ok(None),
            },
        };
        // Leased before the read so a concurrent collection cannot remove it.
        let _lease = self.leases.acquire(&id);
        let Some(generation) = self.store.generation(&id).await? else {
            return Ok(None);
        };
        if generation.repo_key != repo_key {
            tracing::debug!(generation = %id, repo = %repo_key, "generation belongs to another repository");
            return Ok(None);
        }
        let result = retrieve(
            self.store.as_ref(),
            self.embedder.as_ref(),
            &generation,
            text,
            &self.retrieval,
        )
        .await?;
        Ok(Some(result))
    }

    /// Delete superseded generations of a repository that neither a local
    /// lease nor an unfinished job in the status store still references.
    pub async fn collect_garbage(&self, repo_key: &str) -> Result<Vec<String>> {
        let in_use: HashSet<String> = self
            .status
            .non_terminal()
            .await?
            .into_iter()
            .filter_map(|job| job.generation_id)
            .collect();
        collect_superseded(self.store.as_ref(), &self.leases, &in_use, repo_key).await
    }

    /// Persist `job` in state `next`. The in-memory job only moves once the
    /// snapshot is written, so a failed write leaves it failable.
    async fn advance(&self, job: &mut AnalysisJob, next: JobState) -> Result<(), PipelineError> {
        let mut snapshot = job.clone();
        snapshot
            .transition(next)
            .map_err(|e| PipelineError::Internal(e.into()))?;
        self.status.write(&snapshot).await?;
        *job = snapshot;
        tracing::info!(job = %job.id, state = %next, "job transition");
        Ok(())
    }

    /// Drive a queued job to a terminal state.
    pub async fn run(&self, job_id: &str) {
        let mut job = match self.status.read(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job = job_id, "queued job not found");
                return;
            }
            Err(e) => {
                tracing::error!(job = job_id, error = %e, "failed to load job");
                return;
            }
        };
        if job.state != JobState::Queued {
            tracing::warn!(job = job_id, state = %job.state, "skipping job that is not queued");
            return;
        }

        let mut lease = None;
        if let Err(err) = self.execute(&mut job, &mut lease).await {
            tracing::error!(job = %job.id, kind = %err.kind(), error = %err, "job failed");
            match job.fail(JobError::from(&err)) {
                Ok(()) => {
                    if let Err(e) = self.status.write(&job).await {
                        tracing::error!(job = %job.id, error = %e, "failed to record job failure");
                    }
                }
                Err(e) => tracing::error!(job = %job.id, error = %e, "cannot fail job"),
            }
        }
        drop(lease);

        if self.gc_on_complete {
            let repo_key = job.source.repo_key();
            match self.collect_garbage(&repo_key).await {
                Ok(deleted) if !deleted.is_empty() => {
                    tracing::info!(repo = %repo_key, deleted = deleted.len(), "collected superseded generations")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(repo = %repo_key, error = %e, "generation gc failed"),
            }
        }
    }

    async fn execute(
        &self,
        job: &mut AnalysisJob,
        lease: &mut Option<Lease>,
    ) -> Result<(), PipelineError> {
        self.advance(job, JobState::Ingesting).await?;
        let selection = stage(
            "ingesting",
            self.timeouts.ingest,
            self.ingestor.select(&job.source),
        )
        .await?;
        job.resolved = Some(selection.resolved.clone());
        job.progress.files_selected = selection.files.len();

        self.advance(job, JobState::Indexing).await?;
        let built = stage("indexing", self.timeouts.index, self.index.build(&selection)).await?;
        drop(selection);
        job.generation_id = Some(built.generation.id.clone());
        job.progress.summary_chunks = built.generation.summary_chunks;
        job.progress.structural_chunks = built.generation.structural_chunks;
        job.progress.dropped_chunks = built.dropped;
        job.progress.reused_generation = built.reused;
        let generation = built.generation.clone();
        *lease = Some(built.lease);

        self.advance(job, JobState::Retrieving).await?;
        let instructions = job.instructions.clone();
        let contexts = stage("retrieving", self.timeouts.retrieve, async {
            let mut contexts = Vec::with_capacity(instructions.len());
            for instruction in &instructions {
                let result = retrieve(
                    self.store.as_ref(),
                    self.embedder.as_ref(),
                    &generation,
                    &instruction.query_text(),
                    &self.retrieval,
                )
                .await?;
                if result.is_empty() {
                    tracing::info!(
                        job = %job.id,
                        instruction = %instruction,
                        "{}; generating without context",
                        PipelineError::RetrievalEmpty
                    );
                }
                contexts.push(GenerationContext::from_result(result));
            }
            Ok(contexts)
        })
        .await?;

        self.advance(job, JobState::Generating).await?;
        let artifacts = stage("generating", self.timeouts.generate, async {
            let mut artifacts = Vec::with_capacity(instructions.len());
            for (instruction, context) in instructions.iter().zip(&contexts) {
                let artifact = generate_artifact(
                    self.generator.as_ref(),
                    context,
                    instruction,
                    &self.generation,
                )
                .await?;
                artifacts.push(artifact);
            }
            Ok(artifacts)
        })
        .await?;
        job.progress.artifacts_done = artifacts.len();
        job.artifacts = artifacts;

        self.advance(job, JobState::Completed).await?;
        Ok(())
    }

    /// Fail every job a previous process left unfinished.
    pub async fn reclaim_interrupted(&self) -> Result<usize> {
        let orphans = self.status.non_terminal().await?;
        let count = orphans.len();
        for mut job in orphans {
            let err = PipelineError::JobInterrupted(format!(
                "worker stopped while job was {}",
                job.state
            ));
            job.fail(JobError::from(&err))
                .map_err(|e| anyhow!("cannot reclaim job {}: {}", job.id, e))?;
            self.status.write(&job).await?;
            tracing::warn!(job = %job.id, "reclaimed interrupted job");
        }
        Ok(count)
    }
}

/// Admission, queueing and workers.
pub struct JobController {
    pipeline: Arc<Pipeline>,
    guard: AdmissionGuard,
    default_instructions: Vec<InstructionKind>,
    poll_interval: Duration,
    sender: mpsc::Sender<String>,
    receiver: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl JobController {
    pub fn new(pipeline: Pipeline, config: &Config) -> Result<Self> {
        let default_instructions = config
            .jobs
            .default_instructions
            .iter()
            .map(|name| InstructionKind::parse(name, None))
            .collect::<Result<Vec<_>>>()?;
        let guard = AdmissionGuard::new(Arc::clone(&pipeline.status), &config.admission);
        let (sender, receiver) = mpsc::channel(config.jobs.queue_capacity.max(1));
        Ok(Self {
            pipeline: Arc::new(pipeline),
            guard,
            default_instructions,
            poll_interval: Duration::from_millis(config.jobs.poll_interval_ms),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        })
    }

    /// SQLite-backed controller for the CLI and server.
    pub fn from_config(config: &Config, pool: SqlitePool) -> Result<Self> {
        Self::new(Pipeline::from_config(config, pool)?, config)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Reclaim interrupted jobs, then spawn `workers` tasks.
    pub async fn start(&self, workers: usize) -> Result<Vec<JoinHandle<()>>> {
        let reclaimed = self.pipeline.reclaim_interrupted().await?;
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "failed jobs left unfinished by a previous run");
        }
        Ok(self.spawn_workers(workers))
    }

    /// Spawn `workers` tasks without touching other jobs. Used by one-shot
    /// CLI runs that may share a database with a running server.
    pub fn spawn_workers(&self, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let pipeline = Arc::clone(&self.pipeline);
                let receiver = Arc::clone(&self.receiver);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(job_id) = next else { break };
                        tracing::debug!(worker, job = %job_id, "picked up job");
                        pipeline.run(&job_id).await;
                    }
                    tracing::debug!(worker, "worker stopped");
                })
            })
            .collect()
    }

    /// Admit and enqueue a job. An empty instruction list uses
    /// `jobs.default_instructions`.
    pub async fn submit(
        &self,
        actor: Actor,
        source: RepositorySource,
        instructions: Vec<InstructionKind>,
    ) -> Result<AnalysisJob, AdmissionError> {
        let instructions = if instructions.is_empty() {
            self.default_instructions.clone()
        } else {
            instructions
        };
        let mut job = self.guard.admit(actor, source, instructions).await?;

        if self.sender.send(job.id.clone()).await.is_err() {
            let err = PipelineError::Internal(anyhow!("job queue is closed"));
            if job.fail(JobError::from(&err)).is_ok() {
                self.pipeline.status.write(&job).await?;
            }
            return Err(AdmissionError::Internal(anyhow!("job queue is closed")));
        }
        Ok(job)
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<AnalysisJob>> {
        self.pipeline.status.read(job_id).await
    }

    pub async fn usage(&self, actor: &Actor) -> Result<Usage, AdmissionError> {
        self.guard.usage(actor).await
    }

    /// Poll until the job is terminal.
    pub async fn wait(&self, job_id: &str) -> Result<AnalysisJob> {
        loop {
            let job = self
                .job(job_id)
                .await?
                .ok_or_else(|| anyhow!("job {} not found", job_id))?;
            if job.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
