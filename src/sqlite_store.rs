//! SQLite-backed [`IndexStore`] implementation.
//!
//! Generations live in `generations`, their chunks (with little-endian f32
//! embedding BLOBs) in `chunks`, and the per-repository current pointer in
//! `current_generations`. Upserts run in one transaction. Promotion starts
//! with the conditional write on the pointer row, so the transaction holds
//! the write lock before anything else is read and two promotions cannot
//! both succeed. Queries are brute-force cosine over one generation's tier.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use repo_lens_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use repo_lens_core::models::{Chunk, GenerationState, IndexGeneration, Language, Tier};
use repo_lens_core::store::{
    rank, validate_generation, IndexQuery, IndexStore, Promotion, ScoredChunk,
};

/// SQLite implementation of the [`IndexStore`] trait.
pub struct SqliteIndexStore {
    pool: SqlitePool,
}

impl SqliteIndexStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const GENERATION_COLUMNS: &str = "id, repo_key, fingerprint, model, dims, summary_chunks, structural_chunks, state, created_at";

fn row_to_generation(row: &SqliteRow) -> Result<IndexGeneration> {
    let state: String = row.try_get("state")?;
    let created_ms: i64 = row.try_get("created_at")?;
    Ok(IndexGeneration {
        id: row.try_get("id")?,
        repo_key: row.try_get("repo_key")?,
        fingerprint: row.try_get("fingerprint")?,
        model: row.try_get("model")?,
        dims: row.try_get::<i64, _>("dims")? as usize,
        summary_chunks: row.try_get::<i64, _>("summary_chunks")? as usize,
        structural_chunks: row.try_get::<i64, _>("structural_chunks")? as usize,
        state: GenerationState::parse(&state)
            .ok_or_else(|| anyhow!("unknown generation state '{}'", state))?,
        created_at: DateTime::<Utc>::from_timestamp_millis(created_ms)
            .ok_or_else(|| anyhow!("invalid timestamp {}", created_ms))?,
    })
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let tier: String = row.try_get("tier")?;
    let language: String = row.try_get("language")?;
    let blob: Vec<u8> = row.try_get("embedding")?;
    Ok(Chunk {
        id: row.try_get("id")?,
        generation_id: row.try_get("generation_id")?,
        tier: Tier::parse(&tier).ok_or_else(|| anyhow!("unknown tier '{}'", tier))?,
        path: row.try_get("path")?,
        language: Language::from_name(&language),
        symbol: row.try_get("symbol")?,
        start_line: row.try_get::<i64, _>("start_line")? as usize,
        end_line: row.try_get::<i64, _>("end_line")? as usize,
        text: row.try_get("text")?,
        hash: row.try_get("hash")?,
        embedding: blob_to_vec(&blob),
    })
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn upsert_generation(
        &self,
        generation: &IndexGeneration,
        chunks: &[Chunk],
    ) -> Result<()> {
        validate_generation(generation, chunks)?;
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT state FROM generations WHERE id = ?")
                .bind(&generation.id)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some_and(|s| s != GenerationState::Staged.as_str()) {
            bail!("generation {} is already promoted", generation.id);
        }

        sqlx::query("DELETE FROM chunks WHERE generation_id = ?")
            .bind(&generation.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO generations (id, repo_key, fingerprint, model, dims,
                                     summary_chunks, structural_chunks, state, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                summary_chunks = excluded.summary_chunks,
                structural_chunks = excluded.structural_chunks
            "#,
        )
        .bind(&generation.id)
        .bind(&generation.repo_key)
        .bind(&generation.fingerprint)
        .bind(&generation.model)
        .bind(generation.dims as i64)
        .bind(generation.summary_chunks as i64)
        .bind(generation.structural_chunks as i64)
        .bind(GenerationState::Staged.as_str())
        .bind(generation.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (generation_id, id, tier, path, language, symbol,
                                    start_line, end_line, text, hash, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.generation_id)
            .bind(&chunk.id)
            .bind(chunk.tier.as_str())
            .bind(&chunk.path)
            .bind(chunk.language.as_str())
            .bind(&chunk.symbol)
            .bind(chunk.start_line as i64)
            .bind(chunk.end_line as i64)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(vec_to_blob(&chunk.embedding))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, query: IndexQuery<'_>) -> Result<Vec<ScoredChunk>> {
        if query.file_scope.is_some_and(|s| s.is_empty()) || query.top_k == 0 {
            return Ok(Vec::new());
        }
        if self.generation(query.generation_id).await?.is_none() {
            bail!("unknown generation {}", query.generation_id);
        }

        let rows = sqlx::query(
            r#"
            SELECT generation_id, id, tier, path, language, symbol,
                   start_line, end_line, text, hash, embedding
            FROM chunks
            WHERE generation_id = ? AND tier = ?
            "#,
        )
        .bind(query.generation_id)
        .bind(query.tier.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = row_to_chunk(row)?;
            if query.file_scope.is_some_and(|s| !s.contains(&chunk.path)) {
                continue;
            }
            scored.push(ScoredChunk {
                score: cosine_similarity(query.vector, &chunk.embedding),
                chunk,
            });
        }
        Ok(rank(scored, query.top_k))
    }

    async fn mark_current(
        &self,
        repo_key: &str,
        generation_id: &str,
        expected_current: Option<&str>,
    ) -> Result<Promotion> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().timestamp_millis();

        let swapped = match expected_current {
            Some(expected) => sqlx::query(
                "UPDATE current_generations SET generation_id = ?, promoted_at = ? WHERE repo_key = ? AND generation_id = ?",
            )
            .bind(generation_id)
            .bind(now)
            .bind(repo_key)
            .bind(expected)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
            None => sqlx::query(
                "INSERT INTO current_generations (repo_key, generation_id, promoted_at) VALUES (?, ?, ?) ON CONFLICT(repo_key) DO NOTHING",
            )
            .bind(repo_key)
            .bind(generation_id)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
        };

        if swapped == 0 {
            let actual: Option<String> = sqlx::query_scalar(
                "SELECT generation_id FROM current_generations WHERE repo_key = ?",
            )
            .bind(repo_key)
            .fetch_optional(&mut *tx)
            .await?;
            return Ok(Promotion::Conflict { actual });
        }

        let owner: Option<String> =
            sqlx::query_scalar("SELECT repo_key FROM generations WHERE id = ?")
                .bind(generation_id)
                .fetch_optional(&mut *tx)
                .await?;
        match owner {
            Some(owner) if owner == repo_key => {}
            Some(owner) => bail!(
                "generation {} belongs to {}, not {}",
                generation_id,
                owner,
                repo_key
            ),
            None => bail!("unknown generation {}", generation_id),
        }

        let previous = expected_current
            .filter(|p| *p != generation_id)
            .map(str::to_string);
        if let Some(prev) = &previous {
            sqlx::query("UPDATE generations SET state = ? WHERE id = ?")
                .bind(GenerationState::Superseded.as_str())
                .bind(prev)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("UPDATE generations SET state = ? WHERE id = ?")
            .bind(GenerationState::Current.as_str())
            .bind(generation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Promotion::Promoted { previous })
    }

    async fn delete_generation(&self, generation_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let is_current: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM current_generations WHERE generation_id = ?",
        )
        .bind(generation_id)
        .fetch_one(&mut *tx)
        .await?;
        if is_current {
            bail!("refusing to delete current generation {}", generation_id);
        }

        sqlx::query("DELETE FROM chunks WHERE generation_id = ?")
            .bind(generation_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM generations WHERE id = ?")
            .bind(generation_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn current_generation(&self, repo_key: &str) -> Result<Option<IndexGeneration>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM generations WHERE id = (SELECT generation_id FROM current_generations WHERE repo_key = ?)",
            GENERATION_COLUMNS
        ))
        .bind(repo_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_generation).transpose()
    }

    async fn generation(&self, generation_id: &str) -> Result<Option<IndexGeneration>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM generations WHERE id = ?",
            GENERATION_COLUMNS
        ))
        .bind(generation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_generation).transpose()
    }

    async fn list_generations(&self, repo_key: &str) -> Result<Vec<IndexGeneration>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM generations WHERE repo_key = ? ORDER BY created_at DESC, id ASC",
            GENERATION_COLUMNS
        ))
        .bind(repo_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_generation).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use repo_lens_core::store::{collect_superseded, GenerationLeases};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteIndexStore) {
        let tmp = TempDir::new().unwrap();
        let cfg: crate::config::Config = toml::from_str(&format!(
            "[db]\npath = \"{}\"\n",
            tmp.path().join("lens.sqlite").display()
        ))
        .unwrap();
        let pool = crate::db::connect(&cfg).await.unwrap();
        migrate_pool(&pool).await.unwrap();
        (tmp, SqliteIndexStore::new(pool))
    }

    fn chunk(gen: &str, id: &str, tier: Tier, path: &str, v: Vec<f32>) -> Chunk {
        Chunk {
            id: id.into(),
            generation_id: gen.into(),
            tier,
            path: path.into(),
            language: Language::Python,
            symbol: (tier == Tier::Structural).then(|| format!("sym_{}", id)),
            start_line: 1,
            end_line: 4,
            text: format!("text of {}", id),
            hash: "h".into(),
            embedding: v,
        }
    }

    fn sample(gen: &IndexGeneration) -> Vec<Chunk> {
        vec![
            chunk(&gen.id, "s-a", Tier::Summary, "a.py", vec![1.0, 0.0]),
            chunk(&gen.id, "s-b", Tier::Summary, "b.py", vec![0.0, 1.0]),
            chunk(&gen.id, "c-a", Tier::Structural, "a.py", vec![0.9, 0.1]),
            chunk(&gen.id, "c-b", Tier::Structural, "b.py", vec![1.0, 0.0]),
        ]
    }

    #[tokio::test]
    async fn upsert_query_and_promote() {
        let (_tmp, store) = store().await;
        let mut gen = IndexGeneration::new("repo", "fp", "hash-2", 2);
        gen.summary_chunks = 2;
        gen.structural_chunks = 2;
        store.upsert_generation(&gen, &sample(&gen)).await.unwrap();
        assert!(store.current_generation("repo").await.unwrap().is_none());

        let scope: BTreeSet<String> = ["a.py".to_string()].into_iter().collect();
        let hits = store
            .query(IndexQuery {
                generation_id: &gen.id,
                tier: Tier::Structural,
                vector: &[1.0, 0.0],
                top_k: 5,
                file_scope: Some(&scope),
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.symbol.as_deref(), Some("sym_c-a"));
        assert_eq!(hits[0].chunk.embedding, vec![0.9, 0.1]);

        let p = store.mark_current("repo", &gen.id, None).await.unwrap();
        assert_eq!(p, Promotion::Promoted { previous: None });
        let current = store.current_generation("repo").await.unwrap().unwrap();
        assert_eq!(current.state, GenerationState::Current);
        assert_eq!(current.summary_chunks, 2);
    }

    #[tokio::test]
    async fn stale_expectation_conflicts() {
        let (_tmp, store) = store().await;
        let g1 = IndexGeneration::new("repo", "fp1", "m", 2);
        let g2 = IndexGeneration::new("repo", "fp2", "m", 2);
        store.upsert_generation(&g1, &sample(&g1)).await.unwrap();
        store.upsert_generation(&g2, &sample(&g2)).await.unwrap();

        store.mark_current("repo", &g1.id, None).await.unwrap();
        let p = store.mark_current("repo", &g2.id, None).await.unwrap();
        assert_eq!(p, Promotion::Conflict { actual: Some(g1.id.clone()) });

        let p = store.mark_current("repo", &g2.id, Some(&g1.id)).await.unwrap();
        assert_eq!(p, Promotion::Promoted { previous: Some(g1.id.clone()) });
        let old = store.generation(&g1.id).await.unwrap().unwrap();
        assert_eq!(old.state, GenerationState::Superseded);
    }

    #[tokio::test]
    async fn delete_and_collect() {
        let (_tmp, store) = store().await;
        let leases = GenerationLeases::new();
        let g1 = IndexGeneration::new("repo", "fp1", "m", 2);
        let g2 = IndexGeneration::new("repo", "fp2", "m", 2);
        store.upsert_generation(&g1, &sample(&g1)).await.unwrap();
        store.upsert_generation(&g2, &sample(&g2)).await.unwrap();
        store.mark_current("repo", &g1.id, None).await.unwrap();
        store.mark_current("repo", &g2.id, Some(&g1.id)).await.unwrap();

        assert!(store.delete_generation(&g2.id).await.is_err());
        let deleted = collect_superseded(&store, &leases, &Default::default(), "repo").await.unwrap();
        assert_eq!(deleted, vec![g1.id.clone()]);
        assert_eq!(store.list_generations("repo").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_generation_is_rejected_atomically() {
        let (_tmp, store) = store().await;
        let gen = IndexGeneration::new("repo", "fp", "m", 2);
        let mut chunks = sample(&gen);
        chunks[3].embedding = vec![1.0, 0.0, 0.0];
        assert!(store.upsert_generation(&gen, &chunks).await.is_err());
        assert!(store.generation(&gen.id).await.unwrap().is_none());
    }
}
