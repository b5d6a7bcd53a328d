//! # repo-lens CLI (`lens`)
//!
//! ## Usage
//!
//! ```bash
//! lens --config ./config/lens.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lens init` | Create the SQLite database and run schema migrations |
//! | `lens analyze <repo>` | Run one analysis job in-process and print its artifacts |
//! | `lens status <job>` | Show a job's state, history and error |
//! | `lens query <repo> "<text>"` | Retrieve context from the current index |
//! | `lens generations <repo>` | List a repository's index generations |
//! | `lens gc <repo>` | Delete superseded generations |
//! | `lens serve` | Start the HTTP server and job workers |
//!
//! ## Examples
//!
//! ```bash
//! lens init
//! lens analyze https://github.com/tokio-rs/mini-redis --instruction docs
//! lens analyze ./my-repo --instruction chat --question "Where are requests parsed?"
//! lens query ./my-repo "connection handling"
//! lens serve
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use repo_lens::config::{self, Config};
use repo_lens::generate::InstructionKind;
use repo_lens::job::{Actor, AnalysisJob, JobState};
use repo_lens::jobs::JobController;
use repo_lens::{db, migrate, server};
use repo_lens_core::models::RepositorySource;

/// repo-lens: scoped repository ingestion, a two-tier code index, and
/// retrieval-grounded documentation and design generation.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lens.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lens",
    about = "repo-lens: retrieval-grounded repository analysis",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lens.toml")]
    config: PathBuf,

    /// Debug-level logging (`RUST_LOG` takes precedence).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Analyze a repository and wait for the result.
    ///
    /// `<repo>` is a GitHub URL or a local path. Instructions default to
    /// `jobs.default_instructions`.
    Analyze {
        repo: String,

        /// Branch or tag to read instead of the default branch.
        #[arg(long = "ref")]
        reference: Option<String>,

        /// Run as an anonymous session (subject to the quota).
        #[arg(long, conflicts_with = "account")]
        session: Option<String>,

        /// Run as an account.
        #[arg(long)]
        account: Option<String>,

        /// documentation, high_level_design, low_level_design or chat
        /// (aliases: docs, hld, lld). Repeatable.
        #[arg(long = "instruction")]
        instructions: Vec<String>,

        /// Question for the `chat` instruction.
        #[arg(long)]
        question: Option<String>,
    },

    /// Show a job's state.
    Status { job: String },

    /// Retrieve context for a question from a repository's current index.
    Query {
        repo: String,
        text: String,

        /// Query this generation instead of the current one.
        #[arg(long)]
        generation: Option<String>,
    },

    /// List index generations for a repository, newest first.
    Generations { repo: String },

    /// Delete superseded generations of a repository.
    Gc { repo: String },

    /// Start the HTTP server and job workers.
    Serve,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "repo_lens=debug,repo_lens_core=debug"
    } else {
        "repo_lens=info,repo_lens_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn controller(cfg: &Config) -> Result<JobController> {
    let pool = db::connect(cfg).await?;
    migrate::migrate_pool(&pool).await?;
    JobController::from_config(cfg, pool)
}

fn print_job(job: &AnalysisJob) {
    println!("job:        {}", job.id);
    println!("actor:      {}", job.actor);
    println!("repository: {}", job.source.location);
    if let Some(resolved) = &job.resolved {
        println!("ref:        {} @ {}", resolved.resolved_ref, resolved.fingerprint);
        if let Some(language) = resolved.primary_language {
            println!("language:   {}", language.as_str());
        }
        if let Some(description) = &resolved.description {
            println!("about:      {}", description);
        }
    }
    println!("state:      {}", job.state);
    if let Some(generation) = &job.generation_id {
        println!("generation: {}", generation);
    }
    let p = &job.progress;
    println!(
        "progress:   {} files, {} summary + {} structural chunks, {} dropped{}",
        p.files_selected,
        p.summary_chunks,
        p.structural_chunks,
        p.dropped_chunks,
        if p.reused_generation { " (reused index)" } else { "" }
    );
    for change in &job.history {
        println!("  {}  {}", change.at.format("%Y-%m-%d %H:%M:%S%.3f"), change.state);
    }
    if let Some(err) = &job.error {
        println!("error:      {} ({})", err.message, err.kind);
    }
}

async fn run_analyze(
    cfg: &Config,
    source: RepositorySource,
    actor: Actor,
    instructions: Vec<InstructionKind>,
) -> Result<()> {
    let jobs = controller(cfg).await?;
    jobs.spawn_workers(1);

    let job = jobs.submit(actor, source, instructions).await?;
    println!("Queued job {}", job.id);
    let job = jobs.wait(&job.id).await?;
    print_job(&job);

    if job.state != JobState::Completed {
        bail!("analysis failed");
    }
    for artifact in &job.artifacts {
        println!();
        println!("=== {} ===", artifact.instruction);
        println!("{}", artifact.text.trim_end());
        if let Some(err) = &artifact.parse_error {
            println!("(diagram payload did not parse: {})", err);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Analyze {
            repo,
            reference,
            session,
            account,
            instructions,
            question,
        } => {
            let actor = match (session, account) {
                (Some(session), _) => Actor::Anonymous { session },
                (None, Some(id)) => Actor::Account { id },
                (None, None) => Actor::Account { id: "local".into() },
            };
            let instructions = instructions
                .iter()
                .map(|name| InstructionKind::parse(name, question.as_deref()))
                .collect::<Result<Vec<_>>>()?;
            let source = RepositorySource::parse(&repo, reference);
            run_analyze(&cfg, source, actor, instructions).await?;
        }
        Commands::Status { job } => {
            let jobs = controller(&cfg).await?;
            match jobs.job(&job).await? {
                Some(job) => print_job(&job),
                None => bail!("job not found: {}", job),
            }
        }
        Commands::Query {
            repo,
            text,
            generation,
        } => {
            if text.trim().is_empty() {
                bail!("query must not be empty");
            }
            let jobs = controller(&cfg).await?;
            let source = RepositorySource::parse(&repo, None);
            let Some(result) = jobs
                .pipeline()
                .query(&source, generation.as_deref(), &text)
                .await?
            else {
                bail!("no index for {}; run `lens analyze` first", repo);
            };
            if result.is_empty() {
                println!("No results.");
            }
            for (i, item) in result.items.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {} {}:{}-{}{}",
                    i + 1,
                    item.score,
                    item.tier.as_str(),
                    item.path,
                    item.start_line,
                    item.end_line,
                    item.symbol
                        .as_deref()
                        .map(|s| format!(" ({})", s))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Generations { repo } => {
            let jobs = controller(&cfg).await?;
            let source = RepositorySource::parse(&repo, None);
            let generations = jobs
                .pipeline()
                .store
                .list_generations(&source.repo_key())
                .await?;
            if generations.is_empty() {
                println!("No generations for {}.", repo);
            }
            for g in generations {
                println!(
                    "{}  {:<10}  {}  {} {}d  {} summary / {} structural  {}",
                    g.id,
                    g.state.as_str(),
                    g.fingerprint,
                    g.model,
                    g.dims,
                    g.summary_chunks,
                    g.structural_chunks,
                    g.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Gc { repo } => {
            let jobs = controller(&cfg).await?;
            let source = RepositorySource::parse(&repo, None);
            let deleted = jobs.pipeline().collect_garbage(&source.repo_key()).await?;
            println!("Deleted {} superseded generation(s).", deleted.len());
        }
        Commands::Serve => {
            let pool = db::connect(&cfg).await?;
            migrate::migrate_pool(&pool).await?;
            pool.close().await;
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
