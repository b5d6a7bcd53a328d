//! Scoped clone / local walk ingestion.
//!
//! Remote repositories are shallow-cloned (`--depth 1 --single-branch`)
//! into `clone.cache_dir/<repo_key>`. An existing clone is refreshed with a
//! shallow fetch and a hard reset instead of a new clone. Jobs on the same
//! repository share that checkout, so each holds a per-repository lock from
//! checkout until its files are read. Local paths are walked in place.
//!
//! The walk prunes excluded and hidden directories before descending, so
//! large trees such as `node_modules` or `.git` are never listed. The
//! remaining `(path, size)` listing goes through the same
//! [`SelectionPolicy::plan`] as the remote API strategy, and only the
//! chosen files are read.
//!
//! A fresh clone is fingerprinted by its head commit. A local tree may carry
//! uncommitted edits, so its fingerprint hashes the listing and the content
//! of every file read.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use walkdir::WalkDir;

use repo_lens_core::models::{CandidateFile, RepositorySource, ResolvedSource, SourceLocation};

use crate::config::CloneConfig;
use crate::ingest::{IngestError, IngestionStrategy};
use crate::select::{decode_text, FileEntry, Selection, SelectionPolicy};

/// Ref reported for local directories that are not git work trees.
const WORKING_TREE_REF: &str = "working-tree";

/// Strategy B: clone remote repositories, walk local ones.
pub struct CloneStrategy {
    cache_dir: PathBuf,
    checkouts: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CloneStrategy {
    pub fn new(config: &CloneConfig) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
            checkouts: Mutex::new(HashMap::new()),
        }
    }

    fn checkout_handle(&self, repo_key: &str) -> Arc<AsyncMutex<()>> {
        let mut checkouts = self.checkouts.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(checkouts.entry(repo_key.to_string()).or_default())
    }

    /// Exclusive use of a repository's cached checkout.
    async fn lock_checkout(&self, repo_key: &str) -> OwnedMutexGuard<()> {
        self.checkout_handle(repo_key).lock_owned().await
    }

    async fn checkout(&self, source: &RepositorySource, url: &str) -> Result<PathBuf> {
        let dest = self.cache_dir.join(source.repo_key());
        if dest.join(".git").exists() {
            let target = source.reference.as_deref().unwrap_or("HEAD");
            git(&dest, &["fetch", "--depth", "1", "origin", target]).await?;
            git(&dest, &["reset", "--hard", "FETCH_HEAD"]).await?;
            tracing::debug!(dest = %dest.display(), "refreshed cached clone");
            return Ok(dest);
        }

        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .with_context(|| {
                format!("Failed to create clone cache: {}", self.cache_dir.display())
            })?;

        let mut cmd = Command::new("git");
        cmd.args(["clone", "--depth", "1", "--single-branch"]);
        if let Some(reference) = &source.reference {
            cmd.args(["--branch", reference]);
        }
        cmd.arg(url).arg(&dest).env("GIT_TERMINAL_PROMPT", "0");

        let output = cmd
            .output()
            .await
            .with_context(|| "Failed to execute 'git clone'. Is git installed?")?;
        if !output.status.success() {
            if let Err(e) = tokio::fs::remove_dir_all(&dest).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dest = %dest.display(), error = %e, "failed to remove partial clone");
                }
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git clone failed: {}", stderr.trim());
        }
        tracing::debug!(dest = %dest.display(), "cloned repository");
        Ok(dest)
    }
}

async fn git(repo_dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .with_context(|| format!("Failed to execute 'git {}'", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {} failed: {}", args[0], stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn head_sha(repo_dir: &Path) -> Result<String> {
    git(repo_dir, &["rev-parse", "HEAD"]).await
}

async fn current_branch(repo_dir: &Path) -> Option<String> {
    git(repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
        .await
        .ok()
        .filter(|b| !b.is_empty() && b != "HEAD")
}

/// Walk `root`, pruning excluded directories, and return a sorted listing.
fn walk_listing(root: &Path, policy: &SelectionPolicy) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter();
    for entry in walker.filter_entry(|e| {
        e.depth() == 0
            || !e.file_type().is_dir()
            || !policy.is_excluded_dir(&e.file_name().to_string_lossy())
    }) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        entries.push(FileEntry { path, size });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// Content identity of a walked tree: the head commit when there is one,
/// the sorted `(path, size)` listing, and the content of every read file.
fn tree_fingerprint(head: Option<&str>, listing: &[FileEntry], files: &[CandidateFile]) -> String {
    let mut hasher = Sha256::new();
    if let Some(head) = head {
        hasher.update(head.as_bytes());
        hasher.update(b"\n");
    }
    for entry in listing {
        hasher.update(entry.path.as_bytes());
        hasher.update(b"\t");
        hasher.update(entry.size.to_string().as_bytes());
        hasher.update(b"\n");
    }
    let mut files: Vec<&CandidateFile> = files.iter().collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    for file in files {
        hasher.update(file.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(file.content.as_bytes());
        hasher.update([0u8]);
    }
    let hex = format!("{:x}", hasher.finalize());
    hex[..40].to_string()
}

struct WalkedTree {
    fingerprint: String,
    files: Vec<CandidateFile>,
    stats: crate::select::SelectionStats,
}

/// Walk, plan and read the chosen files. Blocking.
fn walk_and_read(root: &Path, policy: &SelectionPolicy, head: Option<&str>) -> Result<WalkedTree> {
    let listing = walk_listing(root, policy)?;
    let plan = policy.plan(listing.clone());
    let mut stats = plan.stats;

    let mut files = Vec::with_capacity(plan.files.len());
    for planned in plan.files {
        let full = root.join(&planned.path);
        match std::fs::read(&full).ok().and_then(decode_text) {
            Some(text) => files.push(planned.with_content(text)),
            None => {
                tracing::debug!(path = %planned.path, "skipping unreadable file");
                stats.unreadable += 1;
            }
        }
    }

    Ok(WalkedTree {
        fingerprint: tree_fingerprint(head, &listing, &files),
        files,
        stats,
    })
}

#[async_trait]
impl IngestionStrategy for CloneStrategy {
    fn name(&self) -> &'static str {
        "clone"
    }

    fn supports(&self, _source: &RepositorySource) -> bool {
        true
    }

    async fn select(
        &self,
        source: &RepositorySource,
        policy: &SelectionPolicy,
    ) -> Result<Selection, IngestError> {
        let mut _checkout = None;
        let (root, cloned) = match &source.location {
            SourceLocation::Remote { url } => {
                _checkout = Some(self.lock_checkout(&source.repo_key()).await);
                (self.checkout(source, url).await?, true)
            }
            SourceLocation::Local { path } => {
                let root = PathBuf::from(path);
                if !root.is_dir() {
                    return Err(anyhow::anyhow!(
                        "local repository path does not exist: {}",
                        root.display()
                    )
                    .into());
                }
                (root, false)
            }
        };

        let head = if cloned || root.join(".git").exists() {
            Some(head_sha(&root).await?)
        } else {
            None
        };
        let branch = match head {
            Some(_) => current_branch(&root).await,
            None => None,
        };
        let resolved_ref = match (&source.reference, head.is_some()) {
            (Some(r), _) => r.clone(),
            (None, true) => branch.clone().unwrap_or_else(|| "HEAD".to_string()),
            (None, false) => WORKING_TREE_REF.to_string(),
        };

        let walk_root = root.clone();
        let walk_policy = policy.clone();
        let walk_head = head.clone();
        let walked = tokio::task::spawn_blocking(move || {
            walk_and_read(&walk_root, &walk_policy, walk_head.as_deref())
        })
        .await
        .map_err(anyhow::Error::from)??;

        let fingerprint = match head {
            Some(sha) if cloned => sha,
            _ => walked.fingerprint,
        };

        let mut resolved = ResolvedSource::new(source.clone(), resolved_ref, fingerprint);
        // A clone without --branch checks out the default branch.
        if cloned && source.reference.is_none() {
            resolved.default_branch = branch;
        }

        Ok(Selection {
            resolved,
            files: walked.files,
            stats: walked.stats,
        })
    }
}
