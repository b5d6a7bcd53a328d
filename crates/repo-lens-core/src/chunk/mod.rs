//! Two-tier chunking.
//!
//! Every file yields exactly one summary draft followed by zero or more
//! structural drafts. Structural drafts come from the file's
//! [`StructuralParser`] when the [`ParserRegistry`] has one for its
//! language and the parser finds at least one block; otherwise the file is
//! cut into fixed overlapping windows.
//!
//! Chunk ids are deterministic: the first 32 hex chars of SHA-256 over
//! `fingerprint:tier:path:ordinal`, so re-chunking the same content at the
//! same fingerprint yields the same ids.
//!
//! # Example
//!
//! ```rust
//! use repo_lens_core::chunk::{chunk_file, ChunkParams, ParserRegistry};
//! use repo_lens_core::models::{CandidateFile, Language, Tier};
//!
//! let file = CandidateFile {
//!     path: "src/main.rs".into(),
//!     size: 30,
//!     language: Language::Rust,
//!     score: 1.0,
//!     content: "fn main() {\n    run();\n}\n".into(),
//! };
//! let drafts = chunk_file("abc123", &file, &ParserRegistry::builtin(), &ChunkParams::default());
//! assert_eq!(drafts[0].tier, Tier::Summary);
//! assert_eq!(drafts[1].symbol.as_deref(), Some("main"));
//! ```

pub mod structure;
pub mod summary;
pub mod window;

pub use structure::{BraceParser, IndentParser, ParserRegistry, StructuralBlock, StructuralParser};
pub use window::{window_text, Window};

use serde::{Deserialize, Serialize};

use crate::models::{sha256_hex, short_hash, CandidateFile, ChunkDraft, Tier};

/// Size limits for chunking, all in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    pub summary_max_chars: usize,
    pub window_chars: usize,
    pub overlap_chars: usize,
    /// Structural blocks above this size are split into windows.
    pub max_block_chars: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            summary_max_chars: 2000,
            window_chars: 800,
            overlap_chars: 120,
            max_block_chars: 2400,
        }
    }
}

/// Deterministic chunk id.
pub fn chunk_id(fingerprint: &str, tier: Tier, path: &str, ordinal: usize) -> String {
    short_hash(
        &format!("{}:{}:{}:{}", fingerprint, tier.as_str(), path, ordinal),
        32,
    )
}

/// Chunk one file into its summary draft followed by structural drafts.
pub fn chunk_file(
    fingerprint: &str,
    file: &CandidateFile,
    registry: &ParserRegistry,
    params: &ChunkParams,
) -> Vec<ChunkDraft> {
    let text = file.content.as_str();
    let blocks = registry
        .get(file.language)
        .map(|parser| parser.parse_structure(text))
        .unwrap_or_default();

    let signatures: Vec<String> = blocks.iter().map(|b| b.signature.clone()).collect();
    let line_count = text.lines().count().max(1);
    let summary_text = summary::summarize(
        &file.path,
        file.language,
        text,
        &signatures,
        params.summary_max_chars,
    );

    let mut drafts = vec![make_draft(
        fingerprint,
        file,
        Tier::Summary,
        0,
        None,
        1,
        line_count,
        summary_text,
    )];

    let mut ordinal = 0;
    let mut push = |symbol: Option<String>, start: usize, end: usize, body: String| {
        drafts.push(make_draft(
            fingerprint,
            file,
            Tier::Structural,
            ordinal,
            symbol,
            start,
            end,
            body,
        ));
        ordinal += 1;
    };

    if blocks.is_empty() {
        for w in window_text(text, params.window_chars, params.overlap_chars) {
            push(None, w.start_line, w.end_line, w.text);
        }
    } else {
        for block in blocks {
            if block.text.len() <= params.max_block_chars {
                push(
                    Some(block.symbol),
                    block.start_line,
                    block.end_line,
                    block.text,
                );
                continue;
            }
            // Oversized: windows inside the block keep its symbol.
            for w in window_text(&block.text, params.window_chars, params.overlap_chars) {
                push(
                    Some(block.symbol.clone()),
                    block.start_line + w.start_line - 1,
                    block.start_line + w.end_line - 1,
                    w.text,
                );
            }
        }
    }

    drafts
}

#[allow(clippy::too_many_arguments)]
fn make_draft(
    fingerprint: &str,
    file: &CandidateFile,
    tier: Tier,
    ordinal: usize,
    symbol: Option<String>,
    start_line: usize,
    end_line: usize,
    text: String,
) -> ChunkDraft {
    ChunkDraft {
        id: chunk_id(fingerprint, tier, &file.path, ordinal),
        tier,
        path: file.path.clone(),
        language: file.language,
        symbol,
        start_line,
        end_line,
        hash: sha256_hex(&text),
        text,
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
pub(crate) fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
