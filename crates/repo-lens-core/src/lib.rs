//! # repo-lens core
//!
//! Runtime-agnostic logic for repo-lens: data models, error kinds,
//! two-tier chunking, the embedding trait, the index store abstraction,
//! and the scoped retrieval algorithm.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Storage backends, network providers and the
//! job controller live in the `repo-lens` app crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod retrieve;
pub mod store;
