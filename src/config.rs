//! Configuration loading and validation.
//!
//! repo-lens reads a single TOML file (default `./config/lens.toml`). Only
//! `[db]` is required; every other section and field has a default.
//!
//! ```toml
//! [db]
//! path = "./data/lens.sqlite"
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [admission]
//! anonymous_job_limit = 5
//! ```

use anyhow::{bail, Context, Result};
use repo_lens_core::chunk::ChunkParams;
use repo_lens_core::retrieve::RetrievalParams;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub clone: CloneConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

// ── selection ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct SelectionConfig {
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    /// Allowed extensions, without the dot.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Extension-less file names that are always eligible.
    #[serde(default = "default_filenames")]
    pub filenames: Vec<String>,
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_filename_keywords")]
    pub filename_keywords: Vec<String>,
    #[serde(default = "default_dir_keywords")]
    pub dir_keywords: Vec<String>,
    #[serde(default)]
    pub weights: ScoreWeights,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    #[serde(default = "default_weight_depth")]
    pub depth: f64,
    #[serde(default = "default_weight_filename")]
    pub filename: f64,
    #[serde(default = "default_weight_directory")]
    pub directory: f64,
    #[serde(default = "default_weight_size")]
    pub size: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            depth: default_weight_depth(),
            filename: default_weight_filename(),
            directory: default_weight_directory(),
            size: default_weight_size(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            max_files: default_max_files(),
            extensions: default_extensions(),
            filenames: default_filenames(),
            exclude_dirs: default_exclude_dirs(),
            exclude_globs: Vec::new(),
            filename_keywords: default_filename_keywords(),
            dir_keywords: default_dir_keywords(),
            weights: ScoreWeights::default(),
        }
    }
}

fn default_max_file_bytes() -> u64 {
    200_000
}
fn default_max_files() -> usize {
    200
}
fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
fn default_extensions() -> Vec<String> {
    strings(&[
        "py", "js", "jsx", "ts", "tsx", "java", "cpp", "cc", "c", "h", "hpp", "cs", "go", "rb",
        "php", "swift", "kt", "rs", "scala", "sh", "sql", "html", "css", "scss", "vue", "md",
        "rst", "txt", "yaml", "yml", "toml", "json",
    ])
}
fn default_filenames() -> Vec<String> {
    strings(&["Dockerfile", "Makefile", "Procfile", "Gemfile", "Rakefile"])
}
fn default_exclude_dirs() -> Vec<String> {
    strings(&[
        ".git",
        "node_modules",
        "target",
        "build",
        "dist",
        "vendor",
        "__pycache__",
        "venv",
        ".venv",
        "bin",
        "obj",
        ".idea",
        ".vscode",
    ])
}
fn default_filename_keywords() -> Vec<String> {
    strings(&[
        "readme", "main", "index", "app", "server", "api", "config", "settings", "routes",
        "router", "model", "schema", "service", "handler", "controller", "lib", "mod", "core",
        "cli", "setup",
    ])
}
fn default_dir_keywords() -> Vec<String> {
    strings(&[
        "src", "lib", "app", "api", "core", "cmd", "server", "services", "models", "routes",
        "handlers", "controllers", "docs",
    ])
}
fn default_weight_depth() -> f64 {
    1.0
}
fn default_weight_filename() -> f64 {
    1.0
}
fn default_weight_directory() -> f64 {
    0.5
}
fn default_weight_size() -> f64 {
    0.5
}

// ── ingestion strategies ────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Environment variable holding an optional API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_remote_fetch_concurrency")]
    pub fetch_concurrency: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base: default_api_base(),
            token_env: default_token_env(),
            timeout_secs: default_remote_timeout_secs(),
            fetch_concurrency: default_remote_fetch_concurrency(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_api_base() -> String {
    "https://api.github.com".to_string()
}
fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}
fn default_remote_timeout_secs() -> u64 {
    30
}
fn default_remote_fetch_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct CloneConfig {
    /// Clones are cached here, one directory per repository key.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/repos")
}

// ── chunking & embedding ────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
    #[serde(default = "default_window_chars")]
    pub window_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_max_block_chars")]
    pub max_block_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            summary_max_chars: default_summary_max_chars(),
            window_chars: default_window_chars(),
            overlap_chars: default_overlap_chars(),
            max_block_chars: default_max_block_chars(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            summary_max_chars: self.summary_max_chars,
            window_chars: self.window_chars,
            overlap_chars: self.overlap_chars,
            max_block_chars: self.max_block_chars,
        }
    }
}

fn default_summary_max_chars() -> usize {
    2000
}
fn default_window_chars() -> usize {
    800
}
fn default_overlap_chars() -> usize {
    120
}
fn default_max_block_chars() -> usize {
    2400
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash`, `openai`, or `ollama`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Expected dimension. When unset the first returned vector decides.
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for `ollama` (default `http://localhost:11434`) or an
    /// OpenAI-compatible endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embed_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_embed_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
    /// Fraction of chunks that may be dropped before the job fails.
    #[serde(default = "default_max_drop_rate")]
    pub max_drop_rate: f64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            concurrency: default_embed_concurrency(),
            max_retries: default_embed_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_embed_timeout_secs(),
            max_drop_rate: default_max_drop_rate(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_embed_concurrency() -> usize {
    4
}
fn default_embed_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_embed_timeout_secs() -> u64 {
    30
}
fn default_max_drop_rate() -> f64 {
    0.1
}

/// Dimension used by the `hash` provider when `dims` is unset.
pub const DEFAULT_HASH_DIMS: usize = 256;

// ── index, retrieval, generation ────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Delete unleased superseded generations after every job.
    #[serde(default = "default_true")]
    pub gc_on_complete: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            gc_on_complete: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_summary_top_n")]
    pub summary_top_n: usize,
    #[serde(default = "default_structural_top_m")]
    pub structural_top_m: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            summary_top_n: default_summary_top_n(),
            structural_top_m: default_structural_top_m(),
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> RetrievalParams {
        RetrievalParams {
            summary_top_n: self.summary_top_n,
            structural_top_m: self.structural_top_m,
        }
    }
}

fn default_summary_top_n() -> usize {
    8
}
fn default_structural_top_m() -> usize {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `echo`, `openai`, or `ollama`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_generation_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            url: None,
            timeout_secs: default_generation_timeout_secs(),
            max_retries: default_generation_max_retries(),
            retry_backoff_ms: default_generation_backoff_ms(),
        }
    }
}

fn default_generation_provider() -> String {
    "echo".to_string()
}
fn default_generation_timeout_secs() -> u64 {
    120
}
fn default_generation_max_retries() -> u32 {
    2
}
fn default_generation_backoff_ms() -> u64 {
    1000
}

// ── jobs, admission, server ─────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_ingest_timeout_secs")]
    pub ingest_timeout_secs: u64,
    #[serde(default = "default_index_timeout_secs")]
    pub index_timeout_secs: u64,
    #[serde(default = "default_retrieve_timeout_secs")]
    pub retrieve_timeout_secs: u64,
    #[serde(default = "default_generate_timeout_secs")]
    pub generate_timeout_secs: u64,
    /// Instruction kinds used when a request names none.
    #[serde(default = "default_instructions")]
    pub default_instructions: Vec<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            ingest_timeout_secs: default_ingest_timeout_secs(),
            index_timeout_secs: default_index_timeout_secs(),
            retrieve_timeout_secs: default_retrieve_timeout_secs(),
            generate_timeout_secs: default_generate_timeout_secs(),
            default_instructions: default_instructions(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl JobsConfig {
    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest_timeout_secs)
    }
    pub fn index_timeout(&self) -> Duration {
        Duration::from_secs(self.index_timeout_secs)
    }
    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieve_timeout_secs)
    }
    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs(self.generate_timeout_secs)
    }
}

fn default_workers() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    64
}
fn default_ingest_timeout_secs() -> u64 {
    300
}
fn default_index_timeout_secs() -> u64 {
    900
}
fn default_retrieve_timeout_secs() -> u64 {
    60
}
fn default_generate_timeout_secs() -> u64 {
    600
}
fn default_instructions() -> Vec<String> {
    strings(&["documentation", "high_level_design", "low_level_design"])
}
fn default_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionConfig {
    /// Completed or in-flight jobs allowed per anonymous session.
    #[serde(default = "default_anonymous_job_limit")]
    pub anonymous_job_limit: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            anonymous_job_limit: default_anonymous_job_limit(),
        }
    }
}

fn default_anonymous_job_limit() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

// ── loading ─────────────────────────────────────────────────────────

impl Config {
    /// Check ranges and provider names.
    pub fn validate(&self) -> Result<()> {
        let sel = &self.selection;
        if sel.max_files == 0 {
            bail!("selection.max_files must be > 0");
        }
        if sel.max_file_bytes == 0 {
            bail!("selection.max_file_bytes must be > 0");
        }
        let w = sel.weights;
        if [w.depth, w.filename, w.directory, w.size]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            bail!("selection.weights must be finite and >= 0");
        }

        let ch = &self.chunking;
        if ch.summary_max_chars < 256 {
            bail!("chunking.summary_max_chars must be >= 256");
        }
        if ch.window_chars == 0 {
            bail!("chunking.window_chars must be > 0");
        }
        if ch.overlap_chars >= ch.window_chars {
            bail!("chunking.overlap_chars must be < chunking.window_chars");
        }
        if ch.max_block_chars < ch.window_chars {
            bail!("chunking.max_block_chars must be >= chunking.window_chars");
        }

        let emb = &self.embedding;
        match emb.provider.as_str() {
            "hash" => {}
            "openai" | "ollama" => {
                if emb.model.is_none() {
                    bail!(
                        "embedding.model must be specified when provider is '{}'",
                        emb.provider
                    );
                }
            }
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
                other
            ),
        }
        if emb.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }
        if emb.concurrency == 0 {
            bail!("embedding.concurrency must be > 0");
        }
        if !(0.0..=1.0).contains(&emb.max_drop_rate) {
            bail!("embedding.max_drop_rate must be in [0.0, 1.0]");
        }

        if self.retrieval.summary_top_n == 0 {
            bail!("retrieval.summary_top_n must be >= 1");
        }

        let gen = &self.generation;
        match gen.provider.as_str() {
            "echo" => {}
            "openai" | "ollama" => {
                if gen.model.is_none() {
                    bail!(
                        "generation.model must be specified when provider is '{}'",
                        gen.provider
                    );
                }
            }
            other => bail!(
                "Unknown generation provider: '{}'. Must be echo, openai, or ollama.",
                other
            ),
        }

        let jobs = &self.jobs;
        if jobs.workers == 0 || jobs.queue_capacity == 0 {
            bail!("jobs.workers and jobs.queue_capacity must be > 0");
        }
        if [
            jobs.ingest_timeout_secs,
            jobs.index_timeout_secs,
            jobs.retrieve_timeout_secs,
            jobs.generate_timeout_secs,
        ]
        .contains(&0)
        {
            bail!("jobs stage timeouts must be > 0");
        }
        for name in &jobs.default_instructions {
            crate::generate::InstructionKind::parse(name, None)
                .with_context(|| format!("jobs.default_instructions: '{}'", name))?;
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
