//! Chunk & Embed engine.
//!
//! Turns a [`Selection`] into a promoted [`IndexGeneration`]:
//!
//! 1. Chunk every file into one summary draft and its structural drafts.
//! 2. Embed the drafts on a bounded worker pool (`embedding.concurrency`
//!    permits). Transient failures are retried with exponential backoff;
//!    a chunk that exhausts its retries, or that the provider rejects, is
//!    dropped. Dropping a summary drops the rest of that file too.
//! 3. Fail with `EmbeddingCallFailed` when the drop rate exceeds
//!    `embedding.max_drop_rate`, or with `EmbeddingDimensionMismatch` as
//!    soon as any vector has the wrong length.
//! 4. Write the generation staged, then promote it with a compare-and-swap
//!    on the repository's current pointer, retrying once on conflict.
//!
//! If the repository's current generation already has the same
//! fingerprint and embedding model, it is reused instead of rebuilt.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use repo_lens_core::chunk::{chunk_file, ChunkParams, ParserRegistry};
use repo_lens_core::embedding::{EmbedError, Embedder};
use repo_lens_core::error::PipelineError;
use repo_lens_core::models::{Chunk, ChunkDraft, IndexGeneration, ResolvedSource, Tier};
use repo_lens_core::store::{GenerationLeases, IndexStore, Lease, Promotion};

use crate::config::EmbeddingConfig;
use crate::select::Selection;

/// Worker pool and failure thresholds.
#[derive(Debug, Clone)]
pub struct EmbedSettings {
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_drop_rate: f64,
    /// Required vector length. `None` means the first vector decides.
    pub expected_dims: Option<usize>,
}

impl EmbedSettings {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_drop_rate: config.max_drop_rate,
            expected_dims: config.dims,
        }
    }

    /// `retry_backoff × 2^(attempt-1)`, exponent capped at 5.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(5);
        self.retry_backoff * (1u32 << exp)
    }
}

/// A generation ready for retrieval, leased for the caller's lifetime.
#[derive(Debug)]
pub struct BuiltIndex {
    pub generation: IndexGeneration,
    pub lease: Lease,
    /// `true` when the current generation was reused without embedding.
    pub reused: bool,
    pub dropped: usize,
}

/// Outcome of embedding a batch of drafts.
#[derive(Debug)]
pub struct EmbeddedChunks {
    pub dims: usize,
    /// `(draft, vector)` in draft order.
    pub embedded: Vec<(ChunkDraft, Vec<f32>)>,
    /// Drafts that exhausted retries or were rejected.
    pub failed: usize,
    /// Structural drafts removed because their file's summary failed.
    pub orphaned: usize,
}

pub struct IndexBuilder {
    store: Arc<dyn IndexStore>,
    embedder: Arc<dyn Embedder>,
    registry: Arc<ParserRegistry>,
    params: ChunkParams,
    settings: EmbedSettings,
    leases: GenerationLeases,
}

impl IndexBuilder {
    pub fn new(
        store: Arc<dyn IndexStore>,
        embedder: Arc<dyn Embedder>,
        params: ChunkParams,
        settings: EmbedSettings,
        leases: GenerationLeases,
    ) -> Self {
        Self {
            store,
            embedder,
            registry: Arc::new(ParserRegistry::builtin()),
            params,
            settings,
            leases,
        }
    }

    pub fn with_registry(mut self, registry: ParserRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// The current generation, if it was built from the same content with
    /// the same embedding model.
    pub async fn reusable(
        &self,
        resolved: &ResolvedSource,
    ) -> Result<Option<IndexGeneration>, PipelineError> {
        let current = self.store.current_generation(&resolved.repo_key()).await?;
        Ok(current.filter(|g| {
            g.fingerprint == resolved.fingerprint
                && g.model == self.embedder.model_name()
                && g.dims == self.embedder.dims()
        }))
    }

    /// Build, store and promote a generation for `selection`, or reuse the
    /// current one when nothing changed.
    pub async fn build(&self, selection: &Selection) -> Result<BuiltIndex, PipelineError> {
        let resolved = &selection.resolved;
        let repo_key = resolved.repo_key();

        if let Some(generation) = self.reusable(resolved).await? {
            tracing::info!(
                generation = %generation.id,
                fingerprint = %generation.fingerprint,
                "reusing current generation"
            );
            let lease = self.leases.acquire(&generation.id);
            return Ok(BuiltIndex {
                generation,
                lease,
                reused: true,
                dropped: 0,
            });
        }

        let drafts: Vec<ChunkDraft> = selection
            .files
            .iter()
            .flat_map(|file| chunk_file(&resolved.fingerprint, file, &self.registry, &self.params))
            .collect();
        let total = drafts.len();
        tracing::info!(files = selection.files.len(), chunks = total, "chunked selection");

        let outcome = embed_drafts(Arc::clone(&self.embedder), drafts, &self.settings).await?;
        let dropped = outcome.failed + outcome.orphaned;

        let mut generation = IndexGeneration::new(
            &repo_key,
            &resolved.fingerprint,
            self.embedder.model_name(),
            outcome.dims,
        );
        let lease = self.leases.acquire(&generation.id);

        let chunks: Vec<Chunk> = outcome
            .embedded
            .into_iter()
            .map(|(draft, vector)| draft.into_chunk(&generation.id, vector))
            .collect();
        generation.summary_chunks = chunks.iter().filter(|c| c.tier == Tier::Summary).count();
        generation.structural_chunks = chunks.len() - generation.summary_chunks;

        self.store.upsert_generation(&generation, &chunks).await?;
        tracing::info!(
            generation = %generation.id,
            summary = generation.summary_chunks,
            structural = generation.structural_chunks,
            dropped,
            "staged generation"
        );

        let previous = promote(self.store.as_ref(), &repo_key, &generation.id).await?;
        tracing::info!(
            generation = %generation.id,
            previous = previous.as_deref().unwrap_or("-"),
            "promoted generation"
        );
        generation.state = repo_lens_core::models::GenerationState::Current;

        Ok(BuiltIndex {
            generation,
            lease,
            reused: false,
            dropped,
        })
    }
}

/// Promote `generation_id` over whatever is current now. On a conflict the
/// promotion is retried once against the freshly observed pointer.
pub async fn promote(
    store: &dyn IndexStore,
    repo_key: &str,
    generation_id: &str,
) -> Result<Option<String>, PipelineError> {
    let mut expected = store.current_generation(repo_key).await?.map(|g| g.id);
    let mut retried = false;
    loop {
        match store
            .mark_current(repo_key, generation_id, expected.as_deref())
            .await?
        {
            Promotion::Promoted { previous } => return Ok(previous),
            Promotion::Conflict { actual } => {
                tracing::warn!(
                    generation = generation_id,
                    expected = expected.as_deref().unwrap_or("-"),
                    actual = actual.as_deref().unwrap_or("-"),
                    retried,
                    "promotion conflict"
                );
                if retried {
                    return Err(PipelineError::IndexPromotionConflict {
                        generation_id: generation_id.to_string(),
                        actual,
                    });
                }
                retried = true;
                expected = actual;
            }
        }
    }
}

/// Embed one text, retrying transient failures. Returns the final result
/// and the number of attempts made.
async fn embed_with_retry(
    embedder: &dyn Embedder,
    text: &str,
    settings: &EmbedSettings,
) -> (Result<Vec<f32>, EmbedError>, u32) {
    let mut attempt = 0;
    loop {
        if attempt > 0 {
            tokio::time::sleep(settings.backoff(attempt)).await;
        }
        match embedder.embed(text).await {
            Ok(vector) => return (Ok(vector), attempt + 1),
            Err(EmbedError::Transient(msg)) if attempt < settings.max_retries => {
                tracing::debug!(attempt, error = %msg, "retrying embedding");
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt + 1),
        }
    }
}

/// An [`Embedder`] that retries transient failures with the indexing
/// backoff. Query embeddings go through it.
pub struct RetryingEmbedder {
    inner: Arc<dyn Embedder>,
    settings: EmbedSettings,
}

impl RetryingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, settings: EmbedSettings) -> Self {
        Self { inner, settings }
    }
}

#[async_trait]
impl Embedder for RetryingEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let (result, attempts) = embed_with_retry(self.inner.as_ref(), text, &self.settings).await;
        if let Err(e) = &result {
            tracing::debug!(attempts, error = %e, "embedding gave up");
        }
        result
    }
}

/// Embed drafts on a bounded pool and apply the drop and dimension rules.
pub async fn embed_drafts(
    embedder: Arc<dyn Embedder>,
    drafts: Vec<ChunkDraft>,
    settings: &EmbedSettings,
) -> Result<EmbeddedChunks, PipelineError> {
    let total = drafts.len();
    let semaphore = Arc::new(Semaphore::new(settings.concurrency));
    let mut tasks = JoinSet::new();

    for (idx, draft) in drafts.iter().enumerate() {
        let embedder = Arc::clone(&embedder);
        let semaphore = Arc::clone(&semaphore);
        let text = draft.text.clone();
        let settings = settings.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let (result, attempts) = embed_with_retry(embedder.as_ref(), &text, &settings).await;
            (idx, result, attempts)
        });
    }

    let mut expected = settings.expected_dims;
    let mut vectors: Vec<Option<Vec<f32>>> = vec![None; total];
    let mut failed = 0;

    while let Some(joined) = tasks.join_next().await {
        let (idx, result, attempts) = joined.map_err(|e| PipelineError::Internal(e.into()))?;
        match result {
            Ok(vector) => {
                let want = *expected.get_or_insert(vector.len());
                if vector.len() != want {
                    tasks.abort_all();
                    return Err(PipelineError::EmbeddingDimensionMismatch {
                        expected: want,
                        actual: vector.len(),
                        context: format!("chunk {} of {}", drafts[idx].id, drafts[idx].path),
                    });
                }
                vectors[idx] = Some(vector);
            }
            Err(e) => {
                tracing::warn!(
                    chunk = %drafts[idx].id,
                    path = %drafts[idx].path,
                    attempts,
                    error = %e,
                    "dropping chunk"
                );
                failed += 1;
            }
        }
    }

    if total > 0 {
        let rate = failed as f64 / total as f64;
        if rate > settings.max_drop_rate {
            return Err(PipelineError::EmbeddingCallFailed {
                dropped: failed,
                total,
                max_rate: settings.max_drop_rate,
            });
        }
    }

    let summarized: HashSet<String> = drafts
        .iter()
        .zip(&vectors)
        .filter(|(d, v)| d.tier == Tier::Summary && v.is_some())
        .map(|(d, _)| d.path.clone())
        .collect();

    let mut orphaned = 0;
    let mut embedded = Vec::with_capacity(total - failed);
    for (draft, vector) in drafts.into_iter().zip(vectors) {
        let Some(vector) = vector else { continue };
        if draft.tier == Tier::Structural && !summarized.contains(&draft.path) {
            orphaned += 1;
            continue;
        }
        embedded.push((draft, vector));
    }
    if orphaned > 0 {
        tracing::warn!(orphaned, "removed structural chunks of files without a summary");
    }

    Ok(EmbeddedChunks {
        dims: expected.unwrap_or_else(|| embedder.dims()),
        embedded,
        failed,
        orphaned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use repo_lens_core::embedding::HashEmbedder;
    use repo_lens_core::error::ErrorKind;
    use repo_lens_core::models::{GenerationState, Language, RepositorySource};
    use repo_lens_core::store::memory::InMemoryIndexStore;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::select::SelectionStats;

    fn settings() -> EmbedSettings {
        EmbedSettings {
            concurrency: 4,
            max_retries: 2,
            retry_backoff: Duration::from_millis(1),
            max_drop_rate: 0.5,
            expected_dims: None,
        }
    }

    fn draft(id: &str, tier: Tier, path: &str, text: &str) -> ChunkDraft {
        ChunkDraft {
            id: id.into(),
            tier,
            path: path.into(),
            language: Language::Rust,
            symbol: None,
            start_line: 1,
            end_line: 1,
            text: text.into(),
            hash: String::new(),
        }
    }

    /// Fails texts containing "flaky" a fixed number of times, rejects
    /// texts containing "reject", and returns 3 dims for "wide".
    struct Scripted {
        inner: HashEmbedder,
        flaky_failures: u32,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl Scripted {
        fn new(flaky_failures: u32) -> Self {
            Self {
                inner: HashEmbedder::new(8),
                flaky_failures,
                calls: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl Embedder for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(text.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            if text.contains("reject") {
                return Err(EmbedError::Rejected("bad input".into()));
            }
            if text.contains("flaky") && n <= self.flaky_failures {
                return Err(EmbedError::Transient("429".into()));
            }
            if text.contains("wide") {
                return Ok(vec![1.0, 0.0, 0.0]);
            }
            Ok(self.inner.embed_text(text))
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let s = EmbedSettings {
            retry_backoff: Duration::from_millis(100),
            ..settings()
        };
        assert_eq!(s.backoff(1), Duration::from_millis(100));
        assert_eq!(s.backoff(2), Duration::from_millis(200));
        assert_eq!(s.backoff(4), Duration::from_millis(800));
        assert_eq!(s.backoff(20), Duration::from_millis(3200));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let embedder = Arc::new(Scripted::new(2));
        let drafts = vec![draft("a", Tier::Summary, "a.rs", "flaky summary")];
        let out = embed_drafts(embedder.clone(), drafts, &settings()).await.unwrap();
        assert_eq!(out.embedded.len(), 1);
        assert_eq!(out.failed, 0);
        assert_eq!(embedder.calls.lock().unwrap()["flaky summary"], 3);
    }

    #[tokio::test]
    async fn retrying_embedder_recovers_and_gives_up() {
        let scripted = Arc::new(Scripted::new(2));
        let embedder = RetryingEmbedder::new(scripted.clone(), settings());
        assert_eq!(embedder.model_name(), "scripted");
        assert_eq!(embedder.embed("flaky query").await.unwrap().len(), 8);
        assert_eq!(scripted.calls.lock().unwrap()["flaky query"], 3);

        let stubborn = Arc::new(Scripted::new(5));
        let embedder = RetryingEmbedder::new(stubborn.clone(), settings());
        assert!(matches!(
            embedder.embed("flaky again").await,
            Err(EmbedError::Transient(_))
        ));
        assert_eq!(stubborn.calls.lock().unwrap()["flaky again"], 3);

        assert!(matches!(
            embedder.embed("reject this").await,
            Err(EmbedError::Rejected(_))
        ));
        assert_eq!(stubborn.calls.lock().unwrap()["reject this"], 1);
    }

    #[tokio::test]
    async fn rejected_chunks_are_not_retried() {
        let embedder = Arc::new(Scripted::new(0));
        let drafts = vec![
            draft("a", Tier::Summary, "a.rs", "fine"),
            draft("b", Tier::Summary, "b.rs", "reject me"),
        ];
        let out = embed_drafts(embedder.clone(), drafts, &settings()).await.unwrap();
        assert_eq!(out.failed, 1);
        assert_eq!(embedder.calls.lock().unwrap()["reject me"], 1);
    }

    #[tokio::test]
    async fn dropped_summary_removes_its_structural_chunks() {
        let drafts = vec![
            draft("s1", Tier::Summary, "a.rs", "reject summary"),
            draft("c1", Tier::Structural, "a.rs", "fn a() {}"),
            draft("s2", Tier::Summary, "b.rs", "summary b"),
            draft("c2", Tier::Structural, "b.rs", "fn b() {}"),
        ];
        let out = embed_drafts(Arc::new(Scripted::new(0)), drafts, &settings())
            .await
            .unwrap();
        let ids: Vec<_> = out.embedded.iter().map(|(d, _)| d.id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "c2"]);
        assert_eq!(out.failed, 1);
        assert_eq!(out.orphaned, 1);
    }

    #[tokio::test]
    async fn drop_rate_over_threshold_fails() {
        let drafts = vec![
            draft("a", Tier::Summary, "a.rs", "reject a"),
            draft("b", Tier::Summary, "b.rs", "reject b"),
            draft("c", Tier::Summary, "c.rs", "ok c"),
        ];
        let err = embed_drafts(Arc::new(Scripted::new(0)), drafts, &settings())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingCallFailed);
    }

    #[tokio::test]
    async fn wrong_dimension_aborts() {
        let drafts = vec![draft("a", Tier::Summary, "a.rs", "wide vector")];
        let s = EmbedSettings {
            expected_dims: Some(8),
            ..settings()
        };
        let err = embed_drafts(Arc::new(Scripted::new(0)), drafts, &s)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingDimensionMismatch);
    }

    fn selection(fingerprint: &str) -> Selection {
        let source = RepositorySource::parse("https://github.com/acme/widgets", None);
        let file = |path: &str, content: &str| repo_lens_core::models::CandidateFile {
            path: path.into(),
            size: content.len() as u64,
            language: Language::from_path(path),
            score: 1.0,
            content: content.into(),
        };
        Selection {
            resolved: ResolvedSource::new(source, "main".into(), fingerprint.into()),
            files: vec![
                file("src/lib.rs", "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n"),
                file("README.md", "# Widgets\n\nAdds numbers.\n"),
            ],
            stats: SelectionStats::default(),
        }
    }

    fn builder(store: Arc<InMemoryIndexStore>, leases: GenerationLeases) -> IndexBuilder {
        IndexBuilder::new(
            store,
            Arc::new(HashEmbedder::new(16)),
            ChunkParams::default(),
            settings(),
            leases,
        )
    }

    #[tokio::test]
    async fn build_promotes_and_reuses() {
        let store = Arc::new(InMemoryIndexStore::new());
        let leases = GenerationLeases::new();
        let builder = builder(store.clone(), leases.clone());

        let first = builder.build(&selection("sha-1")).await.unwrap();
        assert!(!first.reused);
        assert_eq!(first.generation.summary_chunks, 2);
        assert!(first.generation.structural_chunks >= 1);
        assert!(leases.is_leased(&first.generation.id));

        let current = store.current_generation(&first.generation.repo_key).await.unwrap().unwrap();
        assert_eq!(current.id, first.generation.id);
        assert_eq!(current.state, GenerationState::Current);

        let again = builder.build(&selection("sha-1")).await.unwrap();
        assert!(again.reused);
        assert_eq!(again.generation.id, first.generation.id);

        let next = builder.build(&selection("sha-2")).await.unwrap();
        assert!(!next.reused);
        let old = store.generation(&first.generation.id).await.unwrap().unwrap();
        assert_eq!(old.state, GenerationState::Superseded);

        drop(first);
        assert!(leases.is_leased(&again.generation.id));
        drop(again);
        assert!(!leases.is_leased(&old.id));
    }

    #[tokio::test]
    async fn promote_supersedes_previous() {
        let store = InMemoryIndexStore::new();
        let gen = |fp: &str| IndexGeneration::new("repo", fp, "m", 2);
        let a = gen("a");
        let b = gen("b");
        store.upsert_generation(&a, &[]).await.unwrap();
        store.upsert_generation(&b, &[]).await.unwrap();
        assert_eq!(promote(&store, "repo", &a.id).await.unwrap(), None);
        assert_eq!(promote(&store, "repo", &b.id).await.unwrap(), Some(a.id.clone()));
    }

    /// Reports a fixed number of conflicts before delegating.
    struct Contended {
        inner: InMemoryIndexStore,
        conflicts: Mutex<u32>,
    }

    #[async_trait]
    impl IndexStore for Contended {
        async fn upsert_generation(&self, g: &IndexGeneration, c: &[Chunk]) -> anyhow::Result<()> {
            self.inner.upsert_generation(g, c).await
        }
        async fn query(
            &self,
            q: repo_lens_core::store::IndexQuery<'_>,
        ) -> anyhow::Result<Vec<repo_lens_core::store::ScoredChunk>> {
            self.inner.query(q).await
        }
        async fn mark_current(
            &self,
            repo_key: &str,
            generation_id: &str,
            expected: Option<&str>,
        ) -> anyhow::Result<Promotion> {
            {
                let mut left = self.conflicts.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Ok(Promotion::Conflict {
                        actual: Some("elsewhere".into()),
                    });
                }
            }
            self.inner.mark_current(repo_key, generation_id, expected.filter(|e| *e != "elsewhere")).await
        }
        async fn delete_generation(&self, id: &str) -> anyhow::Result<bool> {
            self.inner.delete_generation(id).await
        }
        async fn current_generation(&self, repo_key: &str) -> anyhow::Result<Option<IndexGeneration>> {
            self.inner.current_generation(repo_key).await
        }
        async fn generation(&self, id: &str) -> anyhow::Result<Option<IndexGeneration>> {
            self.inner.generation(id).await
        }
        async fn list_generations(&self, repo_key: &str) -> anyhow::Result<Vec<IndexGeneration>> {
            self.inner.list_generations(repo_key).await
        }
    }

    #[tokio::test]
    async fn single_conflict_is_retried() {
        let store = Contended {
            inner: InMemoryIndexStore::new(),
            conflicts: Mutex::new(1),
        };
        let g = IndexGeneration::new("repo", "a", "m", 2);
        store.upsert_generation(&g, &[]).await.unwrap();
        assert_eq!(promote(&store, "repo", &g.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn second_conflict_fails() {
        let store = Contended {
            inner: InMemoryIndexStore::new(),
            conflicts: Mutex::new(2),
        };
        let g = IndexGeneration::new("repo", "a", "m", 2);
        store.upsert_generation(&g, &[]).await.unwrap();
        let err = promote(&store, "repo", &g.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IndexPromotionConflict);
        assert!(store.inner.current_generation("repo").await.unwrap().is_none());
    }
}
