//! Two-stage scoped retrieval.
//!
//! 1. Embed the query with the generation's embedding model.
//! 2. Rank the summary tier and keep the top `summary_top_n` files.
//! 3. Rank the structural tier restricted to those files and keep the top
//!    `structural_top_m` chunks.
//! 4. Return the summaries followed by the structural chunks.
//!
//! Structural results never come from files outside step 2's set, and are
//! never padded when the scoped files have fewer chunks. When step 2 finds
//! nothing the result is empty and no structural query is issued.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::embedding::{EmbedError, Embedder};
use crate::error::PipelineError;
use crate::models::{IndexGeneration, RetrievalResult, RetrievedChunk, Tier};
use crate::store::{IndexQuery, IndexStore, ScoredChunk};

/// Fan-out limits for the two retrieval stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub summary_top_n: usize,
    pub structural_top_m: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            summary_top_n: 8,
            structural_top_m: 15,
        }
    }
}

/// Run a scoped two-stage query against one generation.
pub async fn retrieve(
    store: &dyn IndexStore,
    embedder: &dyn Embedder,
    generation: &IndexGeneration,
    query: &str,
    params: &RetrievalParams,
) -> Result<RetrievalResult, PipelineError> {
    if query.trim().is_empty() {
        return Ok(RetrievalResult::empty(&generation.id, query));
    }
    if embedder.model_name() != generation.model || embedder.dims() != generation.dims {
        return Err(PipelineError::EmbeddingDimensionMismatch {
            expected: generation.dims,
            actual: embedder.dims(),
            context: format!(
                "query model {} does not match index model {}",
                embedder.model_name(),
                generation.model
            ),
        });
    }

    let vector = embedder.embed(query).await.map_err(|e: EmbedError| {
        tracing::warn!(error = %e, "query embedding failed");
        PipelineError::QueryEmbeddingFailed(e.to_string())
    })?;
    if vector.len() != generation.dims {
        return Err(PipelineError::EmbeddingDimensionMismatch {
            expected: generation.dims,
            actual: vector.len(),
            context: "query vector".to_string(),
        });
    }

    let summaries = store
        .query(IndexQuery {
            generation_id: &generation.id,
            tier: Tier::Summary,
            vector: &vector,
            top_k: params.summary_top_n,
            file_scope: None,
        })
        .await?;
    if summaries.is_empty() {
        tracing::debug!(generation = %generation.id, "summary tier returned no files");
        return Ok(RetrievalResult::empty(&generation.id, query));
    }

    let scope: BTreeSet<String> = summaries.iter().map(|s| s.chunk.path.clone()).collect();
    let structural = store
        .query(IndexQuery {
            generation_id: &generation.id,
            tier: Tier::Structural,
            vector: &vector,
            top_k: params.structural_top_m,
            file_scope: Some(&scope),
        })
        .await?;

    tracing::debug!(
        generation = %generation.id,
        files = summaries.len(),
        chunks = structural.len(),
        "retrieved context"
    );

    let items = summaries
        .into_iter()
        .chain(structural)
        .map(to_retrieved)
        .collect();
    Ok(RetrievalResult {
        generation_id: generation.id.clone(),
        query: query.to_string(),
        items,
    })
}

fn to_retrieved(scored: ScoredChunk) -> RetrievedChunk {
    let chunk = scored.chunk;
    RetrievedChunk {
        chunk_id: chunk.id,
        tier: chunk.tier,
        path: chunk.path,
        language: chunk.language,
        symbol: chunk.symbol,
        start_line: chunk.start_line,
        end_line: chunk.end_line,
        text: chunk.text,
        score: scored.score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_file, ChunkParams, ParserRegistry};
    use crate::embedding::HashEmbedder;
    use crate::error::ErrorKind;
    use async_trait::async_trait;
    use crate::models::{CandidateFile, Chunk, Language};
    use crate::store::memory::InMemoryIndexStore;

    async fn build(
        store: &InMemoryIndexStore,
        embedder: &HashEmbedder,
        files: &[(&str, &str)],
    ) -> IndexGeneration {
        let mut gen = IndexGeneration::new("repo", "fp", embedder.model_name(), embedder.dims());
        let registry = ParserRegistry::builtin();
        let mut chunks: Vec<Chunk> = Vec::new();
        for (path, content) in files {
            let file = CandidateFile {
                path: path.to_string(),
                size: content.len() as u64,
                language: Language::from_path(path),
                score: 1.0,
                content: content.to_string(),
            };
            for draft in chunk_file("fp", &file, &registry, &ChunkParams::default()) {
                let v = embedder.embed_text(&draft.text);
                chunks.push(draft.into_chunk(&gen.id, v));
            }
        }
        gen.summary_chunks = chunks.iter().filter(|c| c.tier == Tier::Summary).count();
        gen.structural_chunks = chunks.len() - gen.summary_chunks;
        store.upsert_generation(&gen, &chunks).await.unwrap();
        gen
    }

    const FILES: &[(&str, &str)] = &[
        (
            "src/main.rs",
            "fn main() {\n    let config = load_config();\n    start_server(config);\n}\n\nfn start_server(c: Config) {\n    listen(c.port);\n}\n",
        ),
        (
            "src/db.rs",
            "pub fn connect_database(url: &str) -> Pool {\n    Pool::open(url)\n}\n",
        ),
        (
            "src/render.rs",
            "pub fn render_template(name: &str) -> String {\n    html(name)\n}\n",
        ),
    ];

    #[tokio::test]
    async fn summaries_come_first_and_structural_is_scoped() {
        let store = InMemoryIndexStore::new();
        let embedder = HashEmbedder::new(256);
        let gen = build(&store, &embedder, FILES).await;
        let params = RetrievalParams {
            summary_top_n: 1,
            structural_top_m: 10,
        };

        let result = retrieve(&store, &embedder, &gen, "main start server", &params)
            .await
            .unwrap();
        assert_eq!(result.items[0].tier, Tier::Summary);
        assert_eq!(result.items[0].path, "src/main.rs");
        let summary_paths: BTreeSet<_> = result.summaries().map(|c| c.path.clone()).collect();
        assert!(result.structural().all(|c| summary_paths.contains(&c.path)));
        // main.rs has two blocks; nothing pads from other files
        assert_eq!(result.structural().count(), 2);
    }

    #[tokio::test]
    async fn empty_generation_yields_empty_result() {
        let store = InMemoryIndexStore::new();
        let embedder = HashEmbedder::new(64);
        let gen = build(&store, &embedder, &[]).await;
        let result = retrieve(&store, &embedder, &gen, "entry point", &RetrievalParams::default())
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn empty_query_yields_empty_result() {
        let store = InMemoryIndexStore::new();
        let embedder = HashEmbedder::new(64);
        let gen = build(&store, &embedder, FILES).await;
        let result = retrieve(&store, &embedder, &gen, "   ", &RetrievalParams::default())
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn model_mismatch_is_fatal() {
        let store = InMemoryIndexStore::new();
        let gen = build(&store, &HashEmbedder::new(64), FILES).await;
        let err = retrieve(
            &store,
            &HashEmbedder::new(32),
            &gen,
            "entry point",
            &RetrievalParams::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingDimensionMismatch);
    }

    struct Unavailable;

    #[async_trait]
    impl Embedder for Unavailable {
        fn model_name(&self) -> &str {
            "hash-64"
        }
        fn dims(&self) -> usize {
            64
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Err(EmbedError::Transient("503 service unavailable".into()))
        }
    }

    #[tokio::test]
    async fn failed_query_embedding_names_the_cause() {
        let store = InMemoryIndexStore::new();
        let gen = build(&store, &HashEmbedder::new(64), FILES).await;
        let err = retrieve(&store, &Unavailable, &gen, "entry point", &RetrievalParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmbeddingCallFailed);
        assert!(err.to_string().starts_with("query embedding failed"));
        assert!(err.to_string().contains("503"));
    }
}
