//! End-to-end job runs against in-memory stores and fake collaborators.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use repo_lens::config::Config;
use repo_lens::connector_git::CloneStrategy;
use repo_lens::connector_remote::RemoteError;
use repo_lens::generate::{
    EchoGenerator, GenerateError, GenerationContext, Generator, InstructionKind,
};
use repo_lens::guard::AdmissionError;
use repo_lens::ingest::{IngestError, Ingestor, IngestionStrategy};
use repo_lens::job::{Actor, AnalysisJob, JobError, JobState};
use repo_lens::jobs::{JobController, Pipeline};
use repo_lens::select::{Selection, SelectionPolicy};
use repo_lens::status::{MemoryStatusStore, StatusStore};
use repo_lens_core::embedding::{EmbedError, Embedder, HashEmbedder};
use repo_lens_core::error::ErrorKind;
use repo_lens_core::models::{Language, RepositorySource, Tier};
use repo_lens_core::store::memory::InMemoryIndexStore;
use repo_lens_core::store::IndexStore;

/// Remote API stand-in that is always rate limited.
struct RateLimitedApi;

#[async_trait]
impl IngestionStrategy for RateLimitedApi {
    fn name(&self) -> &'static str {
        "remote-api"
    }
    fn supports(&self, _source: &RepositorySource) -> bool {
        true
    }
    async fn select(
        &self,
        _source: &RepositorySource,
        _policy: &SelectionPolicy,
    ) -> Result<Selection, IngestError> {
        Err(RemoteError::RateLimited.into())
    }
}

/// Returns 4-dim vectors, except 3 dims for texts mentioning `Server`.
struct InconsistentEmbedder;

#[async_trait]
impl Embedder for InconsistentEmbedder {
    fn model_name(&self) -> &str {
        "inconsistent"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        if text.contains("Server") {
            Ok(vec![0.5; 3])
        } else {
            Ok(vec![0.5; 4])
        }
    }
}

/// Records whether each call received grounded context.
#[derive(Default)]
struct RecordingGenerator {
    grounded: Mutex<Vec<bool>>,
}

#[async_trait]
impl Generator for RecordingGenerator {
    fn name(&self) -> &str {
        "recording"
    }
    async fn generate(
        &self,
        context: &GenerationContext,
        instruction: &InstructionKind,
    ) -> Result<String, GenerateError> {
        self.grounded.lock().unwrap().push(context.is_grounded());
        Ok(format!("# {}\n", instruction.name()))
    }
}

struct Harness {
    _tmp: TempDir,
    cfg: Config,
    repo: PathBuf,
    store: Arc<InMemoryIndexStore>,
    status: Arc<MemoryStatusStore>,
    jobs: JobController,
}

fn write_repo(root: &Path) {
    fs::create_dir_all(root.join("src")).unwrap();
    fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
    fs::write(
        root.join("src/main.rs"),
        "fn main() {\n    let server = Server::new();\n    server.run();\n}\n\nfn entry_point() -> u32 {\n    42\n}\n",
    )
    .unwrap();
    fs::write(
        root.join("src/server.rs"),
        "pub struct Server;\n\nimpl Server {\n    pub fn new() -> Self {\n        Server\n    }\n\n    pub fn run(&self) {}\n}\n",
    )
    .unwrap();
    fs::write(
        root.join("README.md"),
        "# Demo\n\nThe entry point is src/main.rs, which starts the server.\n",
    )
    .unwrap();
    fs::write(root.join("node_modules/pkg/index.js"), "module.exports = 1;\n").unwrap();
    fs::write(root.join("logo.png"), [0x89u8, 0x50, 0x4e, 0x47]).unwrap();
}

fn config(root: &Path, anonymous_limit: usize) -> Config {
    toml::from_str(&format!(
        r#"[db]
path = "{root}/data/lens.sqlite"

[clone]
cache_dir = "{root}/data/repos"

[generation]
retry_backoff_ms = 1

[jobs]
poll_interval_ms = 10

[admission]
anonymous_job_limit = {anonymous_limit}
"#,
        root = root.display(),
    ))
    .unwrap()
}

fn ingestor(cfg: &Config, primary: Option<Box<dyn IngestionStrategy>>) -> Ingestor {
    Ingestor::new(
        primary,
        Box::new(CloneStrategy::new(&cfg.clone)),
        SelectionPolicy::from_config(&cfg.selection).unwrap(),
    )
}

fn harness(
    primary: Option<Box<dyn IngestionStrategy>>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    anonymous_limit: usize,
) -> Harness {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().join("repo");
    write_repo(&repo);

    let cfg = config(tmp.path(), anonymous_limit);
    let ingestor = ingestor(&cfg, primary);
    let store = Arc::new(InMemoryIndexStore::new());
    let status = Arc::new(MemoryStatusStore::new());
    let pipeline = Pipeline::new(
        &cfg,
        ingestor,
        store.clone(),
        status.clone(),
        embedder,
        generator,
    );
    let jobs = JobController::new(pipeline, &cfg).unwrap();
    Harness {
        _tmp: tmp,
        cfg,
        repo,
        store,
        status,
        jobs,
    }
}

fn source(h: &Harness) -> RepositorySource {
    RepositorySource::parse(h.repo.to_str().unwrap(), None)
}

fn session(id: &str) -> Actor {
    Actor::Anonymous { session: id.into() }
}

#[tokio::test]
async fn three_file_repository_is_indexed_and_queryable() {
    let h = harness(
        None,
        Arc::new(HashEmbedder::new(64)),
        Arc::new(EchoGenerator),
        5,
    );

    let selection = h.jobs.pipeline().ingestor.select(&source(&h)).await.unwrap();
    assert_eq!(selection.files.len(), 3);
    assert!(selection
        .files
        .windows(2)
        .all(|w| w[0].score >= w[1].score));

    h.jobs.spawn_workers(1);
    let job = h
        .jobs
        .submit(session("s"), source(&h), vec![InstructionKind::Documentation])
        .await
        .unwrap();
    let done = h.jobs.wait(&job.id).await.unwrap();
    assert_eq!(done.state, JobState::Completed, "error: {:?}", done.error);
    assert_eq!(done.progress.files_selected, 3);
    assert_eq!(done.progress.summary_chunks, 3);
    let resolved = done.resolved.as_ref().unwrap();
    assert_eq!(resolved.primary_language, Some(Language::Rust));
    assert!(resolved.default_branch.is_none());

    let repo_key = source(&h).repo_key();
    let current = h.store.current_generation(&repo_key).await.unwrap().unwrap();
    assert_eq!(Some(current.id.clone()), done.generation_id);
    assert_eq!(current.summary_chunks, 3);

    let result = h
        .jobs
        .pipeline()
        .query(&source(&h), None, "entry point")
        .await
        .unwrap()
        .unwrap();
    assert!(!result.is_empty());
    assert_eq!(result.items[0].tier, Tier::Summary);
}

#[tokio::test]
async fn rate_limited_api_falls_back_to_clone_and_completes() {
    let h = harness(
        Some(Box::new(RateLimitedApi)),
        Arc::new(HashEmbedder::new(64)),
        Arc::new(EchoGenerator),
        5,
    );
    h.jobs.spawn_workers(1);

    let job = h.jobs.submit(session("s"), source(&h), vec![]).await.unwrap();
    let done = h.jobs.wait(&job.id).await.unwrap();
    assert_eq!(done.state, JobState::Completed, "error: {:?}", done.error);
    assert_eq!(done.artifacts.len(), 3);
    assert_eq!(done.progress.files_selected, 3);
}

#[tokio::test]
async fn inconsistent_dimensions_fail_without_promotion() {
    let h = harness(
        None,
        Arc::new(InconsistentEmbedder),
        Arc::new(EchoGenerator),
        5,
    );
    h.jobs.spawn_workers(1);

    let job = h
        .jobs
        .submit(session("s"), source(&h), vec![InstructionKind::Documentation])
        .await
        .unwrap();
    let done = h.jobs.wait(&job.id).await.unwrap();
    assert_eq!(done.state, JobState::Failed);
    assert_eq!(
        done.error.as_ref().unwrap().kind,
        ErrorKind::EmbeddingDimensionMismatch
    );
    assert!(done.generation_id.is_none());

    let repo_key = source(&h).repo_key();
    assert!(h.store.current_generation(&repo_key).await.unwrap().is_none());
    assert!(h.store.list_generations(&repo_key).await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_retrieval_generates_with_no_context() {
    let generator = Arc::new(RecordingGenerator::default());
    let h = harness(
        None,
        Arc::new(HashEmbedder::new(64)),
        generator.clone(),
        5,
    );
    // Nothing eligible survives, so the generation has no chunks.
    fs::remove_dir_all(h.repo.join("src")).unwrap();
    fs::remove_file(h.repo.join("README.md")).unwrap();

    h.jobs.spawn_workers(1);
    let job = h
        .jobs
        .submit(session("s"), source(&h), vec![InstructionKind::Documentation])
        .await
        .unwrap();
    let done = h.jobs.wait(&job.id).await.unwrap();

    assert_eq!(done.state, JobState::Completed, "error: {:?}", done.error);
    assert!(done
        .history
        .iter()
        .any(|change| change.state == JobState::Generating));
    assert_eq!(*generator.grounded.lock().unwrap(), vec![false]);
    assert!(!done.artifacts[0].grounded);
}

#[tokio::test]
async fn second_request_while_queued_is_rejected() {
    let h = harness(
        None,
        Arc::new(HashEmbedder::new(64)),
        Arc::new(EchoGenerator),
        5,
    );
    // No workers: the first job stays queued.
    let first = h.jobs.submit(session("s"), source(&h), vec![]).await.unwrap();
    match h.jobs.submit(session("s"), source(&h), vec![]).await {
        Err(AdmissionError::AlreadyInProgress { job_id }) => assert_eq!(job_id, first.id),
        other => panic!("expected already_in_progress, got {:?}", other.map(|j| j.id)),
    }
    // A different session is independent.
    assert!(h.jobs.submit(session("other"), source(&h), vec![]).await.is_ok());
}

#[tokio::test]
async fn anonymous_quota_applies_after_completion() {
    let h = harness(
        None,
        Arc::new(HashEmbedder::new(64)),
        Arc::new(EchoGenerator),
        1,
    );
    h.jobs.spawn_workers(1);

    let job = h
        .jobs
        .submit(session("s"), source(&h), vec![InstructionKind::Documentation])
        .await
        .unwrap();
    let done = h.jobs.wait(&job.id).await.unwrap();
    assert_eq!(done.state, JobState::Completed);

    let err = h
        .jobs
        .submit(session("s"), source(&h), vec![InstructionKind::Documentation])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

    let account = Actor::Account { id: "7".into() };
    let job = h
        .jobs
        .submit(account, source(&h), vec![InstructionKind::Documentation])
        .await
        .unwrap();
    let again = h.jobs.wait(&job.id).await.unwrap();
    assert_eq!(again.state, JobState::Completed);
    assert!(again.progress.reused_generation);
}

#[tokio::test]
async fn terminal_snapshots_cannot_be_overwritten() {
    let h = harness(
        None,
        Arc::new(HashEmbedder::new(64)),
        Arc::new(EchoGenerator),
        5,
    );
    h.jobs.spawn_workers(1);
    let job = h
        .jobs
        .submit(session("s"), source(&h), vec![InstructionKind::Documentation])
        .await
        .unwrap();
    let done = h.jobs.wait(&job.id).await.unwrap();
    assert_eq!(done.state, JobState::Completed);

    let mut stale = done.clone();
    stale.state = JobState::Retrieving;
    assert!(h.status.write(&stale).await.is_err());
    assert_eq!(
        h.status.read(&job.id).await.unwrap().unwrap().state,
        JobState::Completed
    );
}

#[tokio::test]
async fn collection_keeps_generations_used_by_another_process() {
    let h = harness(
        None,
        Arc::new(HashEmbedder::new(64)),
        Arc::new(EchoGenerator),
        5,
    );
    h.jobs.spawn_workers(1);
    let repo_key = source(&h).repo_key();

    let first = h
        .jobs
        .submit(session("a"), source(&h), vec![InstructionKind::Documentation])
        .await
        .unwrap();
    let first = h.jobs.wait(&first.id).await.unwrap();
    assert_eq!(first.state, JobState::Completed, "error: {:?}", first.error);
    let g1 = first.generation_id.unwrap();

    // A job elsewhere is still retrieving from g1.
    let mut reader = AnalysisJob::new(
        session("reader"),
        source(&h),
        vec![InstructionKind::Documentation],
    );
    reader.transition(JobState::Ingesting).unwrap();
    reader.transition(JobState::Indexing).unwrap();
    reader.generation_id = Some(g1.clone());
    reader.transition(JobState::Retrieving).unwrap();
    h.status.write(&reader).await.unwrap();

    // A second pipeline over the same stores indexes new content.
    fs::write(
        h.repo.join("src/main.rs"),
        "fn main() {\n    println!(\"changed\");\n}\n",
    )
    .unwrap();
    let other = JobController::new(
        Pipeline::new(
            &h.cfg,
            ingestor(&h.cfg, None),
            h.store.clone(),
            h.status.clone(),
            Arc::new(HashEmbedder::new(64)),
            Arc::new(EchoGenerator),
        ),
        &h.cfg,
    )
    .unwrap();
    other.spawn_workers(1);
    let second = other
        .submit(session("b"), source(&h), vec![InstructionKind::Documentation])
        .await
        .unwrap();
    let second = other.wait(&second.id).await.unwrap();
    assert_eq!(second.state, JobState::Completed, "error: {:?}", second.error);
    assert_ne!(second.generation_id.as_deref(), Some(g1.as_str()));

    let deleted = other.pipeline().collect_garbage(&repo_key).await.unwrap();
    assert!(deleted.is_empty());
    assert!(h.store.generation(&g1).await.unwrap().is_some());

    reader
        .fail(JobError {
            kind: ErrorKind::Internal,
            message: "stopped".into(),
        })
        .unwrap();
    h.status.write(&reader).await.unwrap();
    let deleted = other.pipeline().collect_garbage(&repo_key).await.unwrap();
    assert_eq!(deleted, vec![g1.clone()]);
    assert!(h.store.generation(&g1).await.unwrap().is_none());
}
