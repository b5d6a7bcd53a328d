//! Vector index storage abstraction.
//!
//! The [`IndexStore`] trait persists [`IndexGeneration`]s with their
//! two-tier chunks and serves cosine-similarity queries against an explicit
//! generation id. Exactly one generation per repository is `current`;
//! promotion is a compare-and-swap on that pointer so a concurrent
//! promotion is detected rather than silently overwritten.
//!
//! Generations are written `staged` and only become visible to callers
//! that resolve "current" after [`mark_current`](IndexStore::mark_current).
//! Superseded generations stay queryable by id until garbage-collected,
//! and [`GenerationLeases`] keeps them alive while a job still uses them.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{Chunk, GenerationState, IndexGeneration, Tier};

/// A similarity query against one generation and tier.
#[derive(Debug, Clone)]
pub struct IndexQuery<'a> {
    pub generation_id: &'a str,
    pub tier: Tier,
    pub vector: &'a [f32],
    pub top_k: usize,
    /// `Some(paths)` restricts results to those files. An empty set
    /// matches nothing.
    pub file_scope: Option<&'a BTreeSet<String>>,
}

/// A chunk with its similarity to the query vector.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Result of a compare-and-swap promotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promotion {
    /// The generation is now current; `previous` was superseded.
    Promoted { previous: Option<String> },
    /// The current pointer was not what the caller expected.
    Conflict { actual: Option<String> },
}

/// Abstract storage backend for index generations.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_generation`](IndexStore::upsert_generation) | Write a staged generation atomically |
/// | [`query`](IndexStore::query) | Ranked cosine search in one generation and tier |
/// | [`mark_current`](IndexStore::mark_current) | CAS promotion of a staged generation |
/// | [`delete_generation`](IndexStore::delete_generation) | Remove a non-current generation |
/// | [`current_generation`](IndexStore::current_generation) | Resolve a repository's current generation |
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Write a generation and all its chunks in one atomic step. The
    /// generation is stored `staged` regardless of its incoming state.
    async fn upsert_generation(&self, generation: &IndexGeneration, chunks: &[Chunk])
        -> Result<()>;

    /// Rank chunks by cosine similarity, ties broken by chunk id.
    async fn query(&self, query: IndexQuery<'_>) -> Result<Vec<ScoredChunk>>;

    /// Promote `generation_id` to current if the repository's current
    /// generation is still `expected_current`.
    async fn mark_current(
        &self,
        repo_key: &str,
        generation_id: &str,
        expected_current: Option<&str>,
    ) -> Result<Promotion>;

    /// Delete a generation and its chunks. Fails for the current
    /// generation. Returns `false` when the id is unknown.
    async fn delete_generation(&self, generation_id: &str) -> Result<bool>;

    async fn current_generation(&self, repo_key: &str) -> Result<Option<IndexGeneration>>;

    async fn generation(&self, generation_id: &str) -> Result<Option<IndexGeneration>>;

    /// All generations for a repository, newest first.
    async fn list_generations(&self, repo_key: &str) -> Result<Vec<IndexGeneration>>;
}

/// Check a generation's chunks before they are written: every chunk
/// belongs to the generation, every vector has the generation's dimension,
/// chunk ids are unique and every structural path has a summary chunk.
pub fn validate_generation(generation: &IndexGeneration, chunks: &[Chunk]) -> Result<()> {
    let mut ids = HashSet::new();
    let mut summarized = HashSet::new();
    for chunk in chunks {
        if chunk.generation_id != generation.id {
            bail!(
                "chunk {} belongs to generation {}, not {}",
                chunk.id,
                chunk.generation_id,
                generation.id
            );
        }
        if chunk.embedding.len() != generation.dims {
            bail!(
                "chunk {} has {} dims, generation {} expects {}",
                chunk.id,
                chunk.embedding.len(),
                generation.id,
                generation.dims
            );
        }
        if !ids.insert(chunk.id.as_str()) {
            bail!("duplicate chunk id {}", chunk.id);
        }
        if chunk.tier == Tier::Summary {
            summarized.insert(chunk.path.as_str());
        }
    }
    if let Some(orphan) = chunks
        .iter()
        .find(|c| c.tier == Tier::Structural && !summarized.contains(c.path.as_str()))
    {
        bail!("structural chunk {} has no summary for {}", orphan.id, orphan.path);
    }
    Ok(())
}

/// Sort by score descending, then chunk id ascending, and keep `top_k`.
pub fn rank(mut scored: Vec<ScoredChunk>, top_k: usize) -> Vec<ScoredChunk> {
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    scored.truncate(top_k);
    scored
}

/// Reference counts of in-flight jobs per generation.
///
/// Cloning shares the same counts. A [`Lease`] releases its count when
/// dropped.
#[derive(Debug, Clone, Default)]
pub struct GenerationLeases {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl GenerationLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, generation_id: &str) -> Lease {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        *counts.entry(generation_id.to_string()).or_insert(0) += 1;
        Lease {
            generation_id: generation_id.to_string(),
            counts: Arc::clone(&self.counts),
        }
    }

    pub fn is_leased(&self, generation_id: &str) -> bool {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(generation_id).copied().unwrap_or(0) > 0
    }
}

/// A held reference to a generation.
#[derive(Debug)]
pub struct Lease {
    generation_id: String,
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl Lease {
    pub fn generation_id(&self) -> &str {
        &self.generation_id
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(n) = counts.get_mut(&self.generation_id) {
            *n -= 1;
            if *n == 0 {
                counts.remove(&self.generation_id);
            }
        }
    }
}

/// Delete every superseded generation of `repo_key` that no job holds a
/// lease on. `in_use` names generations referenced from outside this
/// process's leases (unfinished jobs recorded by any process sharing the
/// store); they are kept too. Returns the deleted ids.
pub async fn collect_superseded(
    store: &dyn IndexStore,
    leases: &GenerationLeases,
    in_use: &HashSet<String>,
    repo_key: &str,
) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for generation in store.list_generations(repo_key).await? {
        if generation.state != GenerationState::Superseded
            || leases.is_leased(&generation.id)
            || in_use.contains(&generation.id)
        {
            continue;
        }
        if store.delete_generation(&generation.id).await? {
            tracing::debug!(generation = %generation.id, repo = repo_key, "collected generation");
            deleted.push(generation.id);
        }
    }
    Ok(deleted)
}
