//! File selection policy.
//!
//! Both ingestion strategies list repository files as `(path, size)`
//! entries and hand them to [`SelectionPolicy::plan`], which applies, in
//! order:
//!
//! 1. Path exclusions: configured directory names, hidden components
//!    (`.git`, `.github`, dotfiles) and `selection.exclude_globs`.
//! 2. The extension allow-list, plus extension-less names like `Dockerfile`.
//! 3. The per-file size ceiling.
//! 4. Relevance scoring, a stable sort (score descending, then path) and
//!    truncation to the file-count ceiling.
//!
//! The plan depends only on the listing and the configuration, so the same
//! fingerprint always selects the same files in the same order with the
//! same scores.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use repo_lens_core::models::{CandidateFile, Language, ResolvedSource};

use crate::config::{ScoreWeights, SelectionConfig};

/// One file in a repository listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// POSIX, repository-relative.
    pub path: String,
    pub size: u64,
}

/// A listing entry that passed every filter.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFile {
    pub path: String,
    pub size: u64,
    pub language: Language,
    pub score: f64,
}

impl PlannedFile {
    pub fn with_content(self, content: String) -> CandidateFile {
        CandidateFile {
            path: self.path,
            size: self.size,
            language: self.language,
            score: self.score,
            content,
        }
    }
}

/// Counters describing what selection did with a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelectionStats {
    pub seen: usize,
    pub excluded: usize,
    pub rejected_extension: usize,
    pub rejected_size: usize,
    pub truncated: usize,
    /// Chosen files whose content could not be read as text.
    pub unreadable: usize,
}

/// Ordered files chosen from a listing, before content is fetched.
#[derive(Debug, Clone)]
pub struct SelectionPlan {
    pub files: Vec<PlannedFile>,
    pub stats: SelectionStats,
}

/// Output of an ingestion strategy.
#[derive(Debug, Clone)]
pub struct Selection {
    pub resolved: ResolvedSource,
    pub files: Vec<CandidateFile>,
    pub stats: SelectionStats,
}

impl Selection {
    /// `true` when nothing survived because every eligible file was over
    /// the size ceiling.
    pub fn all_too_large(&self) -> bool {
        self.files.is_empty() && self.stats.rejected_size > 0
    }

    /// The programming language with the most selected bytes. Ties go to
    /// the language listed first in [`Language`].
    pub fn primary_language(&self) -> Option<Language> {
        let mut bytes: BTreeMap<Language, u64> = BTreeMap::new();
        for file in self.files.iter().filter(|f| f.language.is_code()) {
            *bytes.entry(file.language).or_default() += file.content.len() as u64;
        }
        bytes
            .into_iter()
            .fold(None, |best: Option<(Language, u64)>, (lang, n)| match best {
                Some((_, top)) if top >= n => best,
                _ => Some((lang, n)),
            })
            .map(|(lang, _)| lang)
    }
}

/// Compiled selection configuration.
#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    max_file_bytes: u64,
    max_files: usize,
    extensions: HashSet<String>,
    filenames: HashSet<String>,
    exclude_dirs: HashSet<String>,
    exclude_globs: GlobSet,
    filename_keywords: Vec<String>,
    dir_keywords: HashSet<String>,
    weights: ScoreWeights,
}

impl SelectionPolicy {
    pub fn from_config(cfg: &SelectionConfig) -> Result<Self> {
        Ok(Self {
            max_file_bytes: cfg.max_file_bytes,
            max_files: cfg.max_files,
            extensions: cfg
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            filenames: cfg.filenames.iter().cloned().collect(),
            exclude_dirs: cfg.exclude_dirs.iter().cloned().collect(),
            exclude_globs: build_globset(&cfg.exclude_globs)?,
            filename_keywords: cfg.filename_keywords.iter().map(|k| k.to_lowercase()).collect(),
            dir_keywords: cfg.dir_keywords.iter().map(|k| k.to_lowercase()).collect(),
            weights: cfg.weights,
        })
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    /// Whether a directory should be skipped entirely while walking.
    pub fn is_excluded_dir(&self, name: &str) -> bool {
        name.starts_with('.') || self.exclude_dirs.contains(name)
    }

    /// Whether any component of `path` is excluded, or a glob matches.
    pub fn is_excluded(&self, path: &str) -> bool {
        let mut components = path.split('/').peekable();
        while let Some(component) = components.next() {
            let is_dir = components.peek().is_some();
            if component.starts_with('.') || (is_dir && self.exclude_dirs.contains(component)) {
                return true;
            }
        }
        self.exclude_globs.is_match(path)
    }

    /// Whether the file name passes the extension allow-list.
    pub fn is_eligible_name(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        if self.filenames.contains(name) {
            return true;
        }
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => self.extensions.contains(&ext.to_lowercase()),
            _ => false,
        }
    }

    /// Weighted relevance of a file from its path and size.
    pub fn score(&self, path: &str, size: u64) -> f64 {
        let components: Vec<&str> = path.split('/').collect();
        let depth = components.len().saturating_sub(1);
        let depth_score = 1.0 / (1.0 + depth as f64);

        let name = components.last().copied().unwrap_or(path).to_lowercase();
        let stem = name.split('.').next().unwrap_or(&name);
        let filename_match = self.filename_keywords.iter().any(|kw| {
            stem == kw
                || stem
                    .split(|c: char| !c.is_ascii_alphanumeric())
                    .any(|word| word == kw)
        });

        let dir_match = components[..components.len().saturating_sub(1)]
            .iter()
            .any(|dir| self.dir_keywords.contains(&dir.to_lowercase()));

        let size_score = 1.0 / (1.0 + size as f64 / 1024.0);

        self.weights.depth * depth_score
            + self.weights.filename * if filename_match { 1.0 } else { 0.0 }
            + self.weights.directory * if dir_match { 1.0 } else { 0.0 }
            + self.weights.size * size_score
    }

    /// Filter, score, sort and truncate a listing.
    pub fn plan(&self, entries: Vec<FileEntry>) -> SelectionPlan {
        let mut stats = SelectionStats::default();
        let mut files = Vec::new();

        for entry in entries {
            stats.seen += 1;
            if self.is_excluded(&entry.path) {
                stats.excluded += 1;
                continue;
            }
            if !self.is_eligible_name(&entry.path) {
                stats.rejected_extension += 1;
                continue;
            }
            if entry.size > self.max_file_bytes {
                stats.rejected_size += 1;
                continue;
            }
            files.push(PlannedFile {
                score: self.score(&entry.path, entry.size),
                language: Language::from_path(&entry.path),
                path: entry.path,
                size: entry.size,
            });
        }

        files.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
        if files.len() > self.max_files {
            stats.truncated = files.len() - self.max_files;
            files.truncate(self.max_files);
        }

        SelectionPlan { files, stats }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Decode fetched bytes as text. Binary content (invalid UTF-8 or NUL
/// bytes) yields `None`.
pub fn decode_text(bytes: Vec<u8>) -> Option<String> {
    if bytes.contains(&0) {
        return None;
    }
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SelectionPolicy {
        SelectionPolicy::from_config(&SelectionConfig::default()).unwrap()
    }

    fn entry(path: &str, size: u64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size,
        }
    }

    #[test]
    fn exclusions_cover_dirs_hidden_and_globs() {
        let mut cfg = SelectionConfig::default();
        cfg.exclude_globs = vec!["**/*.min.js".to_string()];
        let p = SelectionPolicy::from_config(&cfg).unwrap();
        assert!(p.is_excluded("node_modules/react/index.js"));
        assert!(p.is_excluded("web/node_modules/x.js"));
        assert!(p.is_excluded(".github/workflows/ci.yml"));
        assert!(p.is_excluded("src/.env"));
        assert!(p.is_excluded("static/app.min.js"));
        assert!(!p.is_excluded("src/build.rs"));
        assert!(!p.is_excluded("src/main.rs"));
    }

    #[test]
    fn extension_allow_list_and_known_names() {
        let p = policy();
        assert!(p.is_eligible_name("src/main.rs"));
        assert!(p.is_eligible_name("README.md"));
        assert!(p.is_eligible_name("deploy/Dockerfile"));
        assert!(p.is_eligible_name("web/App.TSX"));
        assert!(!p.is_eligible_name("assets/logo.png"));
        assert!(!p.is_eligible_name("LICENSE"));
    }

    #[test]
    fn score_prefers_shallow_keyword_small_files() {
        let p = policy();
        let main = p.score("src/main.rs", 500);
        let deep = p.score("a/b/c/d/util.rs", 500);
        let big = p.score("src/main.rs", 100_000);
        assert!(main > deep);
        assert!(main > big);
        assert!(p.score("user_service.py", 100) > p.score("user_things.py", 100));
    }

    #[test]
    fn plan_is_sorted_truncated_and_counted() {
        let mut cfg = SelectionConfig::default();
        cfg.max_files = 2;
        cfg.max_file_bytes = 1000;
        let p = SelectionPolicy::from_config(&cfg).unwrap();
        let plan = p.plan(vec![
            entry("z/deep/file.rs", 10),
            entry("main.rs", 10),
            entry("huge.rs", 5000),
            entry("image.png", 10),
            entry("target/debug/out.rs", 10),
            entry("app.py", 10),
        ]);
        let paths: Vec<_> = plan.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["app.py", "main.rs"]);
        assert_eq!(plan.stats.seen, 6);
        assert_eq!(plan.stats.excluded, 1);
        assert_eq!(plan.stats.rejected_extension, 1);
        assert_eq!(plan.stats.rejected_size, 1);
        assert_eq!(plan.stats.truncated, 1);
        assert_eq!(plan.files[0].language, Language::Python);
    }

    #[test]
    fn plan_is_deterministic_regardless_of_listing_order() {
        let p = policy();
        let listing = vec![
            entry("src/lib.rs", 300),
            entry("src/api/routes.rs", 900),
            entry("docs/guide.md", 2000),
            entry("README.md", 1200),
        ];
        let mut reversed = listing.clone();
        reversed.reverse();
        let a = p.plan(listing);
        let b = p.plan(reversed);
        assert_eq!(a.files, b.files);
    }

    #[test]
    fn binary_content_is_rejected() {
        assert_eq!(decode_text(b"fn main() {}".to_vec()).as_deref(), Some("fn main() {}"));
        assert!(decode_text(vec![0x89, 0x50, 0x4e, 0x47, 0x00]).is_none());
        assert!(decode_text(vec![0xff, 0xfe]).is_none());
    }

    #[test]
    fn primary_language_weighs_code_bytes() {
        let file = |path: &str, content: &str| {
            policy()
                .plan(vec![entry(path, content.len() as u64)])
                .files
                .remove(0)
                .with_content(content.to_string())
        };
        let mut selection = Selection {
            resolved: ResolvedSource::new(
                repo_lens_core::models::RepositorySource::parse("/repo", None),
                "main".into(),
                "fp".into(),
            ),
            files: vec![
                file("README.md", &"docs ".repeat(100)),
                file("src/main.rs", "fn main() {}\n"),
                file("tools/build.py", "import os\nprint(os.name)\n"),
            ],
            stats: SelectionStats::default(),
        };
        assert_eq!(selection.primary_language(), Some(Language::Python));

        selection.files.retain(|f| f.path == "README.md");
        assert_eq!(selection.primary_language(), None);
    }
}
