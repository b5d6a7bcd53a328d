//! # repo-lens
//!
//! Repository analysis pipeline: scoped ingestion, a two-tier code index,
//! and retrieval-grounded generation of documentation and design artifacts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────┐   ┌────────────┐
//! │  Ingestion   │──▶│ Chunk+Embed  │──▶│  SQLite   │──▶│ Retrieval  │
//! │ GitHub/clone │   │ summary+code │   │ generations│  │ two-stage  │
//! └──────────────┘   └──────────────┘   └───────────┘   └─────┬──────┘
//!                                                             ▼
//!        ┌──────────┐   ┌───────────────┐              ┌────────────┐
//!        │ CLI/HTTP │──▶│ admission+jobs│─────────────▶│ generation │
//!        └──────────┘   └───────────────┘              └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`select`] | File eligibility, exclusion and scoring |
//! | [`connector_remote`] | GitHub REST ingestion |
//! | [`connector_git`] | Shallow clone / local walk ingestion |
//! | [`ingest`] | Strategy fallback |
//! | [`embedding`] | HTTP embedding providers |
//! | [`index`] | Chunking, embedding worker pool, generation promotion |
//! | [`sqlite_store`] | SQLite index store |
//! | [`generate`] | Instructions, prompts and generation providers |
//! | [`job`] | Job model and state machine |
//! | [`status`] | Durable job snapshots |
//! | [`guard`] | Quota and single-flight admission |
//! | [`jobs`] | Queue, workers and stage timeouts |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod connector_git;
pub mod connector_remote;
pub mod db;
pub mod embedding;
pub mod generate;
pub mod guard;
pub mod index;
pub mod ingest;
pub mod job;
pub mod jobs;
pub mod migrate;
pub mod select;
pub mod server;
pub mod sqlite_store;
pub mod status;
