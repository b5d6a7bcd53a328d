//! Embedding trait and vector utilities.
//!
//! Defines the async [`Embedder`] trait that every embedding backend
//! implements, the [`HashEmbedder`] used for offline runs, and pure helper
//! functions for vector serialization and similarity.
//!
//! Network providers (OpenAI, Ollama) live in the `repo-lens` app crate.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Failure of a single embedding call.
#[derive(Error, Debug)]
pub enum EmbedError {
    /// Network error, timeout, rate limit or server error. Worth retrying.
    #[error("transient embedding failure: {0}")]
    Transient(String),
    /// The provider rejected the request. Retrying will not help.
    #[error("embedding request rejected: {0}")]
    Rejected(String),
}

/// A text embedding backend.
///
/// Every vector returned by one embedder must have [`dims`](Embedder::dims)
/// elements; callers verify this and treat a mismatch as fatal.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Expected vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Deterministic feature-hashing embedder.
///
/// Tokens (lower-cased identifier fragments) are hashed into `dims`
/// buckets with a sign bit, and the result is L2-normalised. Texts sharing
/// vocabulary land close together, which is enough for local runs and
/// tests without a model server.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    model: String,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            model: format!("hash-{}", dims),
            dims: dims.max(1),
        }
    }

    /// Synchronous form of [`Embedder::embed`].
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(idx_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        normalize(&mut v);
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        Ok(self.embed_text(text))
    }
}

/// Split into lower-case identifier fragments; `snake_case` and
/// `camelCase` words contribute their parts as well as the whole.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if word.is_empty() {
            continue;
        }
        let lower = word.to_lowercase();
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut prev_lower = false;
        for ch in word.chars() {
            if ch == '_' || (ch.is_uppercase() && prev_lower) {
                if !current.is_empty() {
                    parts.push(current.to_lowercase());
                    current.clear();
                }
            }
            if ch != '_' {
                current.push(ch);
            }
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
        if !current.is_empty() {
            parts.push(current.to_lowercase());
        }
        if parts.len() > 1 {
            tokens.extend(parts);
        }
        tokens.push(lower);
    }
    tokens
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use repo_lens_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, zero vectors, or vectors of different
/// lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
