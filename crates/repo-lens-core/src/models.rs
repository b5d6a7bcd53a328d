//! Core data models shared by the ingestion, indexing and retrieval stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Where a repository lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceLocation {
    Remote { url: String },
    Local { path: String },
}

impl SourceLocation {
    /// Normalised form used for keying: lower-cased URL without a trailing
    /// slash or `.git` suffix, or the local path as given.
    pub fn normalized(&self) -> String {
        match self {
            SourceLocation::Remote { url } => {
                let lowered = url.trim().to_lowercase();
                let trimmed = lowered.trim_end_matches('/');
                trimmed.strip_suffix(".git").unwrap_or(trimmed).to_string()
            }
            SourceLocation::Local { path } => path.trim_end_matches('/').to_string(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, SourceLocation::Remote { .. })
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Remote { url } => f.write_str(url),
            SourceLocation::Local { path } => f.write_str(path),
        }
    }
}

/// A repository as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySource {
    pub location: SourceLocation,
    /// Requested branch or tag. `None` means the default branch.
    #[serde(default)]
    pub reference: Option<String>,
}

impl RepositorySource {
    /// Classify free-form input: `http(s)://`, `git@` and `ssh://` inputs
    /// are remote, anything else is treated as a local path.
    pub fn parse(input: &str, reference: Option<String>) -> Self {
        let trimmed = input.trim();
        let is_remote = trimmed.starts_with("http://")
            || trimmed.starts_with("https://")
            || trimmed.starts_with("git@")
            || trimmed.starts_with("ssh://");
        let location = if is_remote {
            SourceLocation::Remote {
                url: trimmed.to_string(),
            }
        } else {
            SourceLocation::Local {
                path: trimmed.to_string(),
            }
        };
        Self {
            location,
            reference,
        }
    }

    /// Stable per-repository key: 16 hex chars of SHA-256 over the
    /// normalised location.
    pub fn repo_key(&self) -> String {
        short_hash(&self.location.normalized(), 16)
    }
}

/// A repository after ingestion resolved its ref and content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub source: RepositorySource,
    /// Branch or ref that was actually read.
    pub resolved_ref: String,
    /// Content identity, usually the head commit hash.
    pub fingerprint: String,
    /// The repository's default branch, when the host or checkout reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Dominant programming language among the selected files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_language: Option<Language>,
}

impl ResolvedSource {
    pub fn new(source: RepositorySource, resolved_ref: String, fingerprint: String) -> Self {
        Self {
            source,
            resolved_ref,
            fingerprint,
            default_branch: None,
            description: None,
            primary_language: None,
        }
    }

    pub fn repo_key(&self) -> String {
        self.source.repo_key()
    }
}

/// Detected language of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    C,
    Cpp,
    CSharp,
    Ruby,
    Php,
    Kotlin,
    Swift,
    Scala,
    Shell,
    Sql,
    Html,
    Css,
    Markdown,
    Yaml,
    Toml,
    Json,
    Text,
    Other,
}

impl Language {
    /// Detect from a repository-relative path.
    pub fn from_path(path: &str) -> Self {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let lower = file_name.to_lowercase();
        match lower.as_str() {
            "dockerfile" | "makefile" | "cmakelists.txt" => return Language::Other,
            "readme" | "license" => return Language::Text,
            _ => {}
        }
        let ext = match lower.rsplit_once('.') {
            Some((_, ext)) => ext,
            None => return Language::Other,
        };
        match ext {
            "rs" => Language::Rust,
            "py" | "pyi" => Language::Python,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" | "mts" => Language::TypeScript,
            "go" => Language::Go,
            "java" => Language::Java,
            "c" | "h" => Language::C,
            "cc" | "cpp" | "cxx" | "hpp" | "hh" => Language::Cpp,
            "cs" => Language::CSharp,
            "rb" => Language::Ruby,
            "php" => Language::Php,
            "kt" | "kts" => Language::Kotlin,
            "swift" => Language::Swift,
            "scala" | "sc" => Language::Scala,
            "sh" | "bash" | "zsh" | "ps1" => Language::Shell,
            "sql" => Language::Sql,
            "html" | "htm" | "vue" => Language::Html,
            "css" | "scss" | "sass" | "less" => Language::Css,
            "md" | "markdown" | "rst" => Language::Markdown,
            "yaml" | "yml" => Language::Yaml,
            "toml" | "ini" | "cfg" => Language::Toml,
            "json" => Language::Json,
            "txt" => Language::Text,
            _ => Language::Other,
        }
    }

    /// Whether this is a programming language rather than markup, data or
    /// prose.
    pub fn is_code(&self) -> bool {
        !matches!(
            self,
            Language::Html
                | Language::Css
                | Language::Markdown
                | Language::Yaml
                | Language::Toml
                | Language::Json
                | Language::Text
                | Language::Other
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Go => "go",
            Language::Java => "java",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::CSharp => "csharp",
            Language::Ruby => "ruby",
            Language::Php => "php",
            Language::Kotlin => "kotlin",
            Language::Swift => "swift",
            Language::Scala => "scala",
            Language::Shell => "shell",
            Language::Sql => "sql",
            Language::Html => "html",
            Language::Css => "css",
            Language::Markdown => "markdown",
            Language::Yaml => "yaml",
            Language::Toml => "toml",
            Language::Json => "json",
            Language::Text => "text",
            Language::Other => "other",
        }
    }

    /// Inverse of [`Language::as_str`]; unknown names map to `Other`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "rust" => Language::Rust,
            "python" => Language::Python,
            "javascript" => Language::JavaScript,
            "typescript" => Language::TypeScript,
            "go" => Language::Go,
            "java" => Language::Java,
            "c" => Language::C,
            "cpp" => Language::Cpp,
            "csharp" => Language::CSharp,
            "ruby" => Language::Ruby,
            "php" => Language::Php,
            "kotlin" => Language::Kotlin,
            "swift" => Language::Swift,
            "scala" => Language::Scala,
            "shell" => Language::Shell,
            "sql" => Language::Sql,
            "html" => Language::Html,
            "css" => Language::Css,
            "markdown" => Language::Markdown,
            "yaml" => Language::Yaml,
            "toml" => Language::Toml,
            "json" => Language::Json,
            "text" => Language::Text,
            _ => Language::Other,
        }
    }
}

/// A file chosen for indexing, with its relevance score and content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFile {
    /// POSIX, repository-relative path.
    pub path: String,
    pub size: u64,
    pub language: Language,
    pub score: f64,
    #[serde(skip)]
    pub content: String,
}

/// Indexing granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Summary,
    Structural,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Summary => "summary",
            Tier::Structural => "structural",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "summary" => Some(Tier::Summary),
            "structural" => Some(Tier::Structural),
            _ => None,
        }
    }
}

/// A chunk before embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDraft {
    pub id: String,
    pub tier: Tier,
    pub path: String,
    pub language: Language,
    pub symbol: Option<String>,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

impl ChunkDraft {
    pub fn into_chunk(self, generation_id: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: self.id,
            generation_id: generation_id.to_string(),
            tier: self.tier,
            path: self.path,
            language: self.language,
            symbol: self.symbol,
            start_line: self.start_line,
            end_line: self.end_line,
            text: self.text,
            hash: self.hash,
            embedding,
        }
    }
}

/// An indexed chunk with its embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub generation_id: String,
    pub tier: Tier,
    pub path: String,
    pub language: Language,
    pub symbol: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub hash: String,
    pub embedding: Vec<f32>,
}

/// Lifecycle of an index generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Staged,
    Current,
    Superseded,
}

impl GenerationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationState::Staged => "staged",
            GenerationState::Current => "current",
            GenerationState::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "staged" => Some(GenerationState::Staged),
            "current" => Some(GenerationState::Current),
            "superseded" => Some(GenerationState::Superseded),
            _ => None,
        }
    }
}

/// One versioned, atomically-promotable snapshot of a repository's chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexGeneration {
    pub id: String,
    pub repo_key: String,
    pub fingerprint: String,
    /// Embedding model that produced every vector in this generation.
    pub model: String,
    pub dims: usize,
    pub summary_chunks: usize,
    pub structural_chunks: usize,
    pub state: GenerationState,
    pub created_at: DateTime<Utc>,
}

impl IndexGeneration {
    pub fn new(repo_key: &str, fingerprint: &str, model: &str, dims: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            repo_key: repo_key.to_string(),
            fingerprint: fingerprint.to_string(),
            model: model.to_string(),
            dims,
            summary_chunks: 0,
            structural_chunks: 0,
            state: GenerationState::Staged,
            created_at: Utc::now(),
        }
    }
}

/// One entry of a [`RetrievalResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub tier: Tier,
    pub path: String,
    pub language: Language,
    pub symbol: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub score: f32,
}

/// Ordered retrieval output: summary chunks first, then scoped structural
/// chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub generation_id: String,
    pub query: String,
    pub items: Vec<RetrievedChunk>,
}

impl RetrievalResult {
    pub fn empty(generation_id: &str, query: &str) -> Self {
        Self {
            generation_id: generation_id.to_string(),
            query: query.to_string(),
            items: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn summaries(&self) -> impl Iterator<Item = &RetrievedChunk> {
        self.items.iter().filter(|c| c.tier == Tier::Summary)
    }

    pub fn structural(&self) -> impl Iterator<Item = &RetrievedChunk> {
        self.items.iter().filter(|c| c.tier == Tier::Structural)
    }

    /// Render every item as a citation-annotated block for a generation
    /// prompt.
    pub fn render_context(&self) -> String {
        let mut out = String::new();
        for item in &self.items {
            let symbol = item
                .symbol
                .as_deref()
                .map(|s| format!(" `{}`", s))
                .unwrap_or_default();
            out.push_str(&format!(
                "--- [{}] {}{} (lines {}-{}, score {:.3}) ---\n{}\n\n",
                item.tier.as_str(),
                item.path,
                symbol,
                item.start_line,
                item.end_line,
                item.score,
                item.text
            ));
        }
        out
    }
}

/// Hex SHA-256 of `text`.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The first `len` hex characters of SHA-256 over `input`.
pub fn short_hash(input: &str, len: usize) -> String {
    let full = sha256_hex(input);
    full[..len.min(full.len())].to_string()
}
