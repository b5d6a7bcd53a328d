//! In-memory [`IndexStore`] implementation for tests and embedded use.
//!
//! All state sits behind one `std::sync::RwLock`, so an upsert or a
//! promotion is a single lock scope and readers never see it half-done.
//! Queries are brute-force cosine similarity over the generation's chunks.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, GenerationState, IndexGeneration};

use super::{rank, validate_generation, IndexQuery, IndexStore, Promotion, ScoredChunk};

#[derive(Default)]
struct Inner {
    generations: HashMap<String, IndexGeneration>,
    chunks: HashMap<String, Vec<Chunk>>,
    current: HashMap<String, String>,
}

/// In-memory index store.
#[derive(Default)]
pub struct InMemoryIndexStore {
    inner: RwLock<Inner>,
}

impl InMemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| anyhow!("index store lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| anyhow!("index store lock poisoned"))
    }
}

#[async_trait]
impl IndexStore for InMemoryIndexStore {
    async fn upsert_generation(
        &self,
        generation: &IndexGeneration,
        chunks: &[Chunk],
    ) -> Result<()> {
        validate_generation(generation, chunks)?;
        let mut inner = self.write()?;
        if inner
            .generations
            .get(&generation.id)
            .is_some_and(|g| g.state != GenerationState::Staged)
        {
            bail!("generation {} is already promoted", generation.id);
        }
        let mut stored = generation.clone();
        stored.state = GenerationState::Staged;
        inner.generations.insert(stored.id.clone(), stored);
        inner.chunks.insert(generation.id.clone(), chunks.to_vec());
        Ok(())
    }

    async fn query(&self, query: IndexQuery<'_>) -> Result<Vec<ScoredChunk>> {
        if query.file_scope.is_some_and(|s| s.is_empty()) || query.top_k == 0 {
            return Ok(Vec::new());
        }
        let inner = self.read()?;
        let chunks = inner
            .chunks
            .get(query.generation_id)
            .ok_or_else(|| anyhow!("unknown generation {}", query.generation_id))?;
        let scored = chunks
            .iter()
            .filter(|c| c.tier == query.tier)
            .filter(|c| query.file_scope.map_or(true, |s| s.contains(&c.path)))
            .map(|c| ScoredChunk {
                score: cosine_similarity(query.vector, &c.embedding),
                chunk: c.clone(),
            })
            .collect();
        Ok(rank(scored, query.top_k))
    }

    async fn mark_current(
        &self,
        repo_key: &str,
        generation_id: &str,
        expected_current: Option<&str>,
    ) -> Result<Promotion> {
        let mut inner = self.write()?;
        let actual = inner.current.get(repo_key).cloned();
        if actual.as_deref() != expected_current {
            return Ok(Promotion::Conflict { actual });
        }
        match inner.generations.get(generation_id) {
            Some(g) if g.repo_key == repo_key => {}
            Some(g) => bail!(
                "generation {} belongs to {}, not {}",
                generation_id,
                g.repo_key,
                repo_key
            ),
            None => bail!("unknown generation {}", generation_id),
        }

        let previous = actual.filter(|p| p != generation_id);
        if let Some(prev) = &previous {
            if let Some(g) = inner.generations.get_mut(prev) {
                g.state = GenerationState::Superseded;
            }
        }
        if let Some(g) = inner.generations.get_mut(generation_id) {
            g.state = GenerationState::Current;
        }
        inner
            .current
            .insert(repo_key.to_string(), generation_id.to_string());
        Ok(Promotion::Promoted { previous })
    }

    async fn delete_generation(&self, generation_id: &str) -> Result<bool> {
        let mut inner = self.write()?;
        if inner.current.values().any(|id| id == generation_id) {
            bail!("refusing to delete current generation {}", generation_id);
        }
        inner.chunks.remove(generation_id);
        Ok(inner.generations.remove(generation_id).is_some())
    }

    async fn current_generation(&self, repo_key: &str) -> Result<Option<IndexGeneration>> {
        let inner = self.read()?;
        Ok(inner
            .current
            .get(repo_key)
            .and_then(|id| inner.generations.get(id))
            .cloned())
    }

    async fn generation(&self, generation_id: &str) -> Result<Option<IndexGeneration>> {
        Ok(self.read()?.generations.get(generation_id).cloned())
    }

    async fn list_generations(&self, repo_key: &str) -> Result<Vec<IndexGeneration>> {
        let inner = self.read()?;
        let mut list: Vec<IndexGeneration> = inner
            .generations
            .values()
            .filter(|g| g.repo_key == repo_key)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }
}
