//! Admission control.
//!
//! Anonymous sessions may hold at most `admission.anonymous_job_limit`
//! completed or in-flight jobs; failed jobs do not count. Accounts are
//! unlimited. Every actor is single-flight: a request is refused while the
//! actor has a non-terminal job, and that check runs before the quota.
//!
//! The checks and the write of the `Queued` snapshot happen under one
//! async mutex, so two concurrent requests from the same actor cannot both
//! be admitted.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use repo_lens_core::error::ErrorKind;
use repo_lens_core::models::RepositorySource;

use crate::config::AdmissionConfig;
use crate::generate::InstructionKind;
use crate::job::{Actor, AnalysisJob, JobState};
use crate::status::StatusStore;

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("quota exceeded: {used} of {limit} analyses used")]
    QuotaExceeded { used: usize, limit: usize },
    #[error("analysis {job_id} is already in progress")]
    AlreadyInProgress { job_id: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AdmissionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdmissionError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            AdmissionError::AlreadyInProgress { .. } => ErrorKind::AlreadyInProgress,
            AdmissionError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// An actor's standing against the admission rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub actor: String,
    /// Completed plus in-flight jobs.
    pub used: usize,
    /// `None` for unlimited actors.
    pub limit: Option<usize>,
    pub in_flight: Option<String>,
    /// Whether a new request would be admitted right now.
    pub allowed: bool,
}

pub struct AdmissionGuard {
    status: Arc<dyn StatusStore>,
    anonymous_limit: usize,
    lock: Mutex<()>,
}

impl AdmissionGuard {
    pub fn new(status: Arc<dyn StatusStore>, config: &AdmissionConfig) -> Self {
        Self {
            status,
            anonymous_limit: config.anonymous_job_limit,
            lock: Mutex::new(()),
        }
    }

    async fn evaluate(&self, actor: &Actor) -> Result<Usage, AdmissionError> {
        let jobs = self.status.jobs_for_actor(&actor.key()).await?;
        let in_flight = jobs.iter().find(|j| !j.is_terminal()).map(|j| j.id.clone());
        let used = jobs.iter().filter(|j| j.state != JobState::Failed).count();
        let limit = actor.is_anonymous().then_some(self.anonymous_limit);
        let allowed = in_flight.is_none() && limit.map_or(true, |l| used < l);
        Ok(Usage {
            actor: actor.key(),
            used,
            limit,
            in_flight,
            allowed,
        })
    }

    /// Check single-flight and quota, then persist a `Queued` job.
    pub async fn admit(
        &self,
        actor: Actor,
        source: RepositorySource,
        instructions: Vec<InstructionKind>,
    ) -> Result<AnalysisJob, AdmissionError> {
        let _held = self.lock.lock().await;
        let usage = self.evaluate(&actor).await?;

        if let Some(job_id) = usage.in_flight {
            tracing::info!(actor = %actor, job = %job_id, "rejected: already in progress");
            return Err(AdmissionError::AlreadyInProgress { job_id });
        }
        if let Some(limit) = usage.limit {
            if usage.used >= limit {
                tracing::info!(actor = %actor, used = usage.used, limit, "rejected: quota exceeded");
                return Err(AdmissionError::QuotaExceeded {
                    used: usage.used,
                    limit,
                });
            }
        }

        let job = AnalysisJob::new(actor, source, instructions);
        self.status.write(&job).await?;
        tracing::info!(job = %job.id, actor = %job.actor, source = %job.source.location, "admitted job");
        Ok(job)
    }

    pub async fn usage(&self, actor: &Actor) -> Result<Usage, AdmissionError> {
        self.evaluate(actor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobError;
    use crate::status::MemoryStatusStore;

    fn guard(limit: usize) -> (Arc<MemoryStatusStore>, Arc<AdmissionGuard>) {
        let status = Arc::new(MemoryStatusStore::new());
        let guard = AdmissionGuard::new(
            status.clone(),
            &AdmissionConfig {
                anonymous_job_limit: limit,
            },
        );
        (status, Arc::new(guard))
    }

    fn anon() -> Actor {
        Actor::Anonymous {
            session: "s".into(),
        }
    }

    fn source() -> RepositorySource {
        RepositorySource::parse("https://github.com/a/b", None)
    }

    async fn finish(status: &MemoryStatusStore, mut job: AnalysisJob, ok: bool) {
        if ok {
            for s in [
                JobState::Ingesting,
                JobState::Indexing,
                JobState::Retrieving,
                JobState::Generating,
                JobState::Completed,
            ] {
                job.transition(s).unwrap();
            }
        } else {
            job.fail(JobError {
                kind: ErrorKind::IngestionUnavailable,
                message: "x".into(),
            })
            .unwrap();
        }
        status.write(&job).await.unwrap();
    }

    #[tokio::test]
    async fn single_flight_blocks_second_request() {
        let (status, guard) = guard(5);
        let first = guard.admit(anon(), source(), vec![]).await.unwrap();
        match guard.admit(anon(), source(), vec![]).await.unwrap_err() {
            AdmissionError::AlreadyInProgress { job_id } => assert_eq!(job_id, first.id),
            other => panic!("unexpected: {other}"),
        }
        finish(&status, first, true).await;
        assert!(guard.admit(anon(), source(), vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_requests_admit_exactly_one() {
        let (_status, guard) = guard(5);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = Arc::clone(&guard);
            handles.push(tokio::spawn(async move {
                guard.admit(anon(), source(), vec![]).await
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(e) => assert_eq!(e.kind(), ErrorKind::AlreadyInProgress),
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn anonymous_quota_counts_completed_not_failed() {
        let (status, guard) = guard(2);
        let a = guard.admit(anon(), source(), vec![]).await.unwrap();
        finish(&status, a, true).await;
        let b = guard.admit(anon(), source(), vec![]).await.unwrap();
        finish(&status, b, false).await;
        let c = guard.admit(anon(), source(), vec![]).await.unwrap();
        finish(&status, c, true).await;

        let err = guard.admit(anon(), source(), vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

        let usage = guard.usage(&anon()).await.unwrap();
        assert_eq!(usage.used, 2);
        assert_eq!(usage.limit, Some(2));
        assert!(!usage.allowed);
    }

    #[tokio::test]
    async fn accounts_are_unlimited() {
        let (status, guard) = guard(1);
        let account = Actor::Account { id: "42".into() };
        for _ in 0..3 {
            let job = guard.admit(account.clone(), source(), vec![]).await.unwrap();
            finish(&status, job, true).await;
        }
        let usage = guard.usage(&account).await.unwrap();
        assert_eq!(usage.used, 3);
        assert_eq!(usage.limit, None);
        assert!(usage.allowed);
    }
}
