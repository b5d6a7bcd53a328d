//! Durable job status.
//!
//! The job controller writes the full [`AnalysisJob`] snapshot on every
//! transition; pollers (CLI, HTTP) read it back by id. The admission guard
//! counts an actor's jobs, and worker start-up lists non-terminal jobs to
//! reclaim the ones a previous process abandoned.
//!
//! Both implementations refuse to overwrite a terminal snapshot.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::job::AnalysisJob;

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Insert or replace a job snapshot.
    async fn write(&self, job: &AnalysisJob) -> Result<()>;

    async fn read(&self, job_id: &str) -> Result<Option<AnalysisJob>>;

    /// Every job submitted by `actor_key`, oldest first.
    async fn jobs_for_actor(&self, actor_key: &str) -> Result<Vec<AnalysisJob>>;

    /// Jobs not yet `completed` or `failed`.
    async fn non_terminal(&self) -> Result<Vec<AnalysisJob>>;
}

// ============ SQLite ============

pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn parse_snapshot(json: &str) -> Result<AnalysisJob> {
    serde_json::from_str(json).map_err(|e| anyhow!("corrupt job snapshot: {}", e))
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn write(&self, job: &AnalysisJob) -> Result<()> {
        let snapshot = serde_json::to_string(job)?;
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, actor_key, state, snapshot_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                snapshot_json = excluded.snapshot_json,
                updated_at = excluded.updated_at
            WHERE jobs.state NOT IN ('completed', 'failed')
            "#,
        )
        .bind(&job.id)
        .bind(job.actor.key())
        .bind(job.state.as_str())
        .bind(&snapshot)
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("job {} is already terminal", job.id);
        }
        Ok(())
    }

    async fn read(&self, job_id: &str) -> Result<Option<AnalysisJob>> {
        let row = sqlx::query("SELECT snapshot_json FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(parse_snapshot(&row.try_get::<String, _>("snapshot_json")?)?)),
            None => Ok(None),
        }
    }

    async fn jobs_for_actor(&self, actor_key: &str) -> Result<Vec<AnalysisJob>> {
        let rows = sqlx::query(
            "SELECT snapshot_json FROM jobs WHERE actor_key = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(actor_key)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| parse_snapshot(&row.try_get::<String, _>("snapshot_json")?))
            .collect()
    }

    async fn non_terminal(&self) -> Result<Vec<AnalysisJob>> {
        let rows = sqlx::query(
            "SELECT snapshot_json FROM jobs WHERE state NOT IN ('completed', 'failed') ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| parse_snapshot(&row.try_get::<String, _>("snapshot_json")?))
            .collect()
    }
}

// ============ In-memory ============

/// Status store for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryStatusStore {
    jobs: RwLock<HashMap<String, AnalysisJob>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn write(&self, job: &AnalysisJob) -> Result<()> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| anyhow!("status store lock poisoned"))?;
        if jobs.get(&job.id).is_some_and(|j| j.is_terminal()) {
            bail!("job {} is already terminal", job.id);
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn read(&self, job_id: &str) -> Result<Option<AnalysisJob>> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| anyhow!("status store lock poisoned"))?;
        Ok(jobs.get(job_id).cloned())
    }

    async fn jobs_for_actor(&self, actor_key: &str) -> Result<Vec<AnalysisJob>> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| anyhow!("status store lock poisoned"))?;
        let mut found: Vec<_> = jobs
            .values()
            .filter(|j| j.actor.key() == actor_key)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn non_terminal(&self) -> Result<Vec<AnalysisJob>> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| anyhow!("status store lock poisoned"))?;
        let mut found: Vec<_> = jobs.values().filter(|j| !j.is_terminal()).cloned().collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::InstructionKind;
    use crate::job::{Actor, JobError, JobState};
    use crate::migrate::migrate_pool;
    use repo_lens_core::error::ErrorKind;
    use repo_lens_core::models::RepositorySource;
    use tempfile::TempDir;

    async fn sqlite() -> (TempDir, SqliteStatusStore) {
        let tmp = TempDir::new().unwrap();
        let cfg: crate::config::Config = toml::from_str(&format!(
            "[db]\npath = \"{}\"\n",
            tmp.path().join("lens.sqlite").display()
        ))
        .unwrap();
        let pool = crate::db::connect(&cfg).await.unwrap();
        migrate_pool(&pool).await.unwrap();
        (tmp, SqliteStatusStore::new(pool))
    }

    fn job(session: &str) -> AnalysisJob {
        AnalysisJob::new(
            Actor::Anonymous {
                session: session.into(),
            },
            RepositorySource::parse("https://github.com/a/b", None),
            vec![InstructionKind::Documentation],
        )
    }

    async fn exercise(store: &dyn StatusStore) {
        let mut a = job("s1");
        let b = job("s1");
        let c = job("s2");
        for j in [&a, &b, &c] {
            store.write(j).await.unwrap();
        }

        a.transition(JobState::Ingesting).unwrap();
        store.write(&a).await.unwrap();
        assert_eq!(store.read(&a.id).await.unwrap().unwrap().state, JobState::Ingesting);
        assert!(store.read("missing").await.unwrap().is_none());

        let mine = store.jobs_for_actor("session:s1").await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(store.non_terminal().await.unwrap().len(), 3);

        a.fail(JobError {
            kind: ErrorKind::StageTimeout,
            message: "slow".into(),
        })
        .unwrap();
        store.write(&a).await.unwrap();
        assert_eq!(store.non_terminal().await.unwrap().len(), 2);

        // A stale non-terminal snapshot must not resurrect a failed job.
        let mut stale = a.clone();
        stale.state = JobState::Generating;
        assert!(store.write(&stale).await.is_err());
        let stored = store.read(&a.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.error.unwrap().kind, ErrorKind::StageTimeout);
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_snapshots() {
        let (_tmp, store) = sqlite().await;
        exercise(&store).await;
    }

    #[tokio::test]
    async fn memory_store_round_trips_snapshots() {
        exercise(&MemoryStatusStore::new()).await;
    }
}
