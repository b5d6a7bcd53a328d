//! Remote host API ingestion (GitHub REST).
//!
//! Reads a repository without cloning it:
//!
//! 1. `GET /repos/{owner}/{repo}` reads the default branch (the ref when
//!    none was requested) and the description.
//! 2. `GET /repos/{owner}/{repo}/commits/{ref}` resolves the head commit
//!    (the fingerprint) and its tree.
//! 3. `GET /repos/{owner}/{repo}/git/trees/{tree}?recursive=1` lists every
//!    blob with its size, which is enough to run the selection policy.
//! 4. `GET /repos/{owner}/{repo}/git/blobs/{sha}` fetches only the chosen
//!    files, base64-encoded, with bounded concurrency.
//!
//! A token is read from the environment variable named by
//! `remote.token_env` when present. Host rate limiting (HTTP 429, or 403
//! with `x-ratelimit-remaining: 0`) is reported as
//! [`RemoteError::RateLimited`] so the caller can fall back to cloning.

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use repo_lens_core::models::{RepositorySource, ResolvedSource, SourceLocation};

use crate::config::RemoteConfig;
use crate::ingest::{IngestError, IngestionStrategy};
use crate::select::{decode_text, FileEntry, Selection, SelectionPolicy};

/// Failure talking to the remote host.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("rate limited by remote host")]
    RateLimited,
    #[error("remote host rejected credentials ({0})")]
    Auth(StatusCode),
    #[error("repository or ref not found: {0}")]
    NotFound(String),
    #[error("unsupported repository location: {0}")]
    UnsupportedHost(String),
    #[error("remote host returned {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// `owner/repo` parsed from a GitHub URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubRepo {
    pub owner: String,
    pub name: String,
}

impl GithubRepo {
    /// Parse `https://github.com/o/r[.git][/...]` or `git@github.com:o/r.git`.
    pub fn parse(url: &str) -> Option<Self> {
        let url = url.trim();
        let rest = url
            .strip_prefix("https://github.com/")
            .or_else(|| url.strip_prefix("http://github.com/"))
            .or_else(|| url.strip_prefix("https://www.github.com/"))
            .or_else(|| url.strip_prefix("git@github.com:"))
            .or_else(|| url.strip_prefix("ssh://git@github.com/"))?;
        let mut parts = rest.split('/').filter(|p| !p.is_empty());
        let owner = parts.next()?.to_string();
        let name = parts.next()?.trim_end_matches(".git").to_string();
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self { owner, name })
    }
}

#[derive(Deserialize)]
struct RepoInfo {
    default_branch: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct CommitInfo {
    sha: String,
    commit: CommitDetail,
}

#[derive(Deserialize)]
struct CommitDetail {
    tree: ShaRef,
}

#[derive(Deserialize)]
struct ShaRef {
    sha: String,
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: Option<u64>,
    sha: String,
}

#[derive(Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

/// Strategy A: read through the GitHub REST API.
pub struct RemoteApiStrategy {
    client: reqwest::Client,
    api_base: String,
    token: Option<String>,
    fetch_concurrency: usize,
}

impl RemoteApiStrategy {
    pub fn new(config: &RemoteConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("repo-lens/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token,
            fetch_concurrency: config.fetch_concurrency.max(1),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        get_json(&self.client, &self.api_base, self.token.as_deref(), path).await
    }
}

async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    api_base: &str,
    token: Option<&str>,
    path: &str,
) -> Result<T, RemoteError> {
    let mut req = client
        .get(format!("{}{}", api_base, path))
        .header("Accept", "application/vnd.github+json");
    if let Some(token) = token {
        req = req.header("Authorization", format!("Bearer {}", token));
    }
    let response = req.send().await?;
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()));
    }

    let remaining_zero = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false);
    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(RemoteError::RateLimited),
        StatusCode::FORBIDDEN if remaining_zero => Err(RemoteError::RateLimited),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RemoteError::Auth(status)),
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound(path.to_string())),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::Http { status, body })
        }
    }
}

fn decode_blob(blob: BlobResponse) -> Result<Vec<u8>, RemoteError> {
    if blob.encoding != "base64" {
        return Err(RemoteError::Malformed(format!(
            "unexpected blob encoding '{}'",
            blob.encoding
        )));
    }
    let compact: String = blob.content.split_whitespace().collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| RemoteError::Malformed(format!("invalid base64 blob: {}", e)))
}

#[async_trait]
impl IngestionStrategy for RemoteApiStrategy {
    fn name(&self) -> &'static str {
        "remote-api"
    }

    fn supports(&self, source: &RepositorySource) -> bool {
        match &source.location {
            SourceLocation::Remote { url } => GithubRepo::parse(url).is_some(),
            SourceLocation::Local { .. } => false,
        }
    }

    async fn select(
        &self,
        source: &RepositorySource,
        policy: &SelectionPolicy,
    ) -> Result<Selection, IngestError> {
        let repo = match &source.location {
            SourceLocation::Remote { url } => GithubRepo::parse(url)
                .ok_or_else(|| RemoteError::UnsupportedHost(url.clone()))?,
            SourceLocation::Local { path } => {
                return Err(RemoteError::UnsupportedHost(path.clone()).into())
            }
        };
        let base = format!("/repos/{}/{}", repo.owner, repo.name);

        let info: RepoInfo = self.get_json(&base).await?;
        let reference = source
            .reference
            .clone()
            .unwrap_or_else(|| info.default_branch.clone());
        let commit: CommitInfo = self
            .get_json(&format!("{}/commits/{}", base, reference))
            .await?;
        let tree: TreeResponse = self
            .get_json(&format!(
                "{}/git/trees/{}?recursive=1",
                base, commit.commit.tree.sha
            ))
            .await?;
        if tree.truncated {
            tracing::warn!(repo = %format!("{}/{}", repo.owner, repo.name), "tree listing truncated by host");
        }

        let mut blob_shas = std::collections::HashMap::new();
        let entries: Vec<FileEntry> = tree
            .tree
            .into_iter()
            .filter(|e| e.kind == "blob")
            .map(|e| {
                blob_shas.insert(e.path.clone(), e.sha);
                FileEntry {
                    path: e.path,
                    size: e.size.unwrap_or(0),
                }
            })
            .collect();

        let plan = policy.plan(entries);
        let mut stats = plan.stats;
        tracing::debug!(
            seen = stats.seen,
            chosen = plan.files.len(),
            "remote tree planned"
        );

        let semaphore = Arc::new(Semaphore::new(self.fetch_concurrency));
        let mut tasks = JoinSet::new();
        for (idx, file) in plan.files.iter().enumerate() {
            let sha = blob_shas.get(&file.path).cloned().unwrap_or_default();
            let path = format!("{}/git/blobs/{}", base, sha);
            let client = self.client.clone();
            let api_base = self.api_base.clone();
            let token = self.token.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let blob: Result<BlobResponse, RemoteError> =
                    get_json(&client, &api_base, token.as_deref(), &path).await;
                (idx, blob.and_then(decode_blob))
            });
        }

        let mut contents: Vec<Option<String>> = vec![None; plan.files.len()];
        while let Some(joined) = tasks.join_next().await {
            let (idx, bytes) = joined.map_err(|e| IngestError::Other(e.into()))?;
            match bytes {
                Ok(bytes) => contents[idx] = decode_text(bytes),
                Err(e) => {
                    tasks.abort_all();
                    return Err(e.into());
                }
            }
        }

        let mut files = Vec::with_capacity(plan.files.len());
        for (planned, content) in plan.files.into_iter().zip(contents) {
            match content {
                Some(text) => files.push(planned.with_content(text)),
                None => {
                    tracing::debug!(path = %planned.path, "skipping non-text blob");
                    stats.unreadable += 1;
                }
            }
        }

        Ok(Selection {
            resolved: ResolvedSource {
                default_branch: Some(info.default_branch),
                description: info.description.filter(|d| !d.trim().is_empty()),
                ..ResolvedSource::new(source.clone(), reference, commit.sha)
            },
            files,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_github_urls() {
        let expected = GithubRepo {
            owner: "acme".into(),
            name: "widgets".into(),
        };
        assert_eq!(GithubRepo::parse("https://github.com/acme/widgets"), Some(expected.clone()));
        assert_eq!(GithubRepo::parse("https://github.com/acme/widgets.git"), Some(expected.clone()));
        assert_eq!(
            GithubRepo::parse("https://github.com/acme/widgets/tree/main/src"),
            Some(expected.clone())
        );
        assert_eq!(GithubRepo::parse("git@github.com:acme/widgets.git"), Some(expected));
        assert_eq!(GithubRepo::parse("https://gitlab.com/acme/widgets"), None);
        assert_eq!(GithubRepo::parse("https://github.com/acme"), None);
    }

    #[test]
    fn repo_info_tolerates_missing_description() {
        let info: RepoInfo =
            serde_json::from_str(r#"{"default_branch":"trunk","description":null}"#).unwrap();
        assert_eq!(info.default_branch, "trunk");
        assert!(info.description.is_none());

        let info: RepoInfo = serde_json::from_str(
            r#"{"default_branch":"main","description":"A widget factory","stargazers_count":3}"#,
        )
        .unwrap();
        assert_eq!(info.description.as_deref(), Some("A widget factory"));
    }

    #[test]
    fn decodes_wrapped_base64_blobs() {
        let blob = BlobResponse {
            content: "Zm4gbWFp\nbigpIHt9\n".into(),
            encoding: "base64".into(),
        };
        assert_eq!(decode_blob(blob).unwrap(), b"fn main() {}".to_vec());

        let bad = BlobResponse {
            content: "x".into(),
            encoding: "utf-8".into(),
        };
        assert!(matches!(decode_blob(bad), Err(RemoteError::Malformed(_))));
    }

    #[test]
    fn supports_only_github_remotes() {
        let strategy = RemoteApiStrategy::new(&RemoteConfig::default()).unwrap();
        assert!(strategy.supports(&RepositorySource::parse("https://github.com/a/b", None)));
        assert!(!strategy.supports(&RepositorySource::parse("https://gitlab.com/a/b", None)));
        assert!(!strategy.supports(&RepositorySource::parse("/tmp/repo", None)));
    }
}
