//! Ingestion strategy selection.
//!
//! An [`Ingestor`] holds an optional primary strategy (the remote host API)
//! and a required fallback (scoped clone or local walk). Any primary error
//! falls back with a warning; a fallback error ends ingestion with
//! [`PipelineError::IngestionUnavailable`]. The caller never sees which
//! strategy produced the selection except through logs.

use async_trait::async_trait;
use thiserror::Error;

use repo_lens_core::error::PipelineError;
use repo_lens_core::models::RepositorySource;

use crate::config::Config;
use crate::connector_git::CloneStrategy;
use crate::connector_remote::{RemoteApiStrategy, RemoteError};
use crate::select::{Selection, SelectionPolicy};

/// Failure of a single ingestion strategy.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One way of turning a [`RepositorySource`] into a [`Selection`].
#[async_trait]
pub trait IngestionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this strategy can handle the source at all.
    fn supports(&self, source: &RepositorySource) -> bool;

    async fn select(
        &self,
        source: &RepositorySource,
        policy: &SelectionPolicy,
    ) -> Result<Selection, IngestError>;
}

pub struct Ingestor {
    primary: Option<Box<dyn IngestionStrategy>>,
    fallback: Box<dyn IngestionStrategy>,
    policy: SelectionPolicy,
}

impl Ingestor {
    pub fn new(
        primary: Option<Box<dyn IngestionStrategy>>,
        fallback: Box<dyn IngestionStrategy>,
        policy: SelectionPolicy,
    ) -> Self {
        Self {
            primary,
            fallback,
            policy,
        }
    }

    /// Remote API first (when enabled), clone/walk second.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let primary: Option<Box<dyn IngestionStrategy>> = if config.remote.enabled {
            Some(Box::new(RemoteApiStrategy::new(&config.remote)?))
        } else {
            None
        };
        Ok(Self::new(
            primary,
            Box::new(CloneStrategy::new(&config.clone)),
            SelectionPolicy::from_config(&config.selection)?,
        ))
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    pub async fn select(&self, source: &RepositorySource) -> Result<Selection, PipelineError> {
        if let Some(primary) = self.primary.as_ref().filter(|s| s.supports(source)) {
            match primary.select(source, &self.policy).await {
                Ok(selection) => {
                    tracing::info!(
                        strategy = primary.name(),
                        files = selection.files.len(),
                        fingerprint = %selection.resolved.fingerprint,
                        "repository selected"
                    );
                    return self.finish(selection);
                }
                Err(e) => {
                    tracing::warn!(
                        strategy = primary.name(),
                        fallback = self.fallback.name(),
                        error = %e,
                        "ingestion strategy failed, falling back"
                    );
                }
            }
        }

        if !self.fallback.supports(source) {
            return Err(PipelineError::IngestionUnavailable(format!(
                "no ingestion strategy supports {}",
                source.location
            )));
        }
        let selection = self
            .fallback
            .select(source, &self.policy)
            .await
            .map_err(|e| {
                PipelineError::IngestionUnavailable(format!("{}: {}", self.fallback.name(), e))
            })?;
        tracing::info!(
            strategy = self.fallback.name(),
            files = selection.files.len(),
            fingerprint = %selection.resolved.fingerprint,
            "repository selected"
        );
        self.finish(selection)
    }

    fn finish(&self, mut selection: Selection) -> Result<Selection, PipelineError> {
        if selection.all_too_large() {
            return Err(PipelineError::ContentTooLarge {
                rejected: selection.stats.rejected_size,
                max_bytes: self.policy.max_file_bytes(),
            });
        }
        if selection.stats.unreadable > 0 {
            tracing::debug!(
                unreadable = selection.stats.unreadable,
                "skipped files with non-text content"
            );
        }
        selection.resolved.primary_language = selection.primary_language();
        Ok(selection)
    }
}
