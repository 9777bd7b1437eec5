mod store;

pub use store::{SearchHit, SqliteVectorStore, VectorStore};

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::evidence::EvidenceFragment;

/// Vector width shared by generation, storage and search.
pub const EMBEDDING_DIM: usize = 768;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Embedding failed: {0}")]
    Failed(String),
    #[error("Embedding service unavailable: {0}")]
    Unavailable(String),
    #[error("Embedding timed out after {0:?}")]
    Timeout(Duration),
    #[error("Expected {expected} dimensions, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("Vector contains non-finite values")]
    NonFinite,
    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// A vector of exactly [`EMBEDDING_DIM`] finite components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> EmbeddingResult<Self> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbeddingError::Dimension {
                expected: EMBEDDING_DIM,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite);
        }
        Ok(Self(values))
    }

    #[must_use]
    pub fn zero() -> Self {
        Self(vec![0.0; EMBEDDING_DIM])
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    #[must_use]
    pub fn norm(&self) -> f32 {
        self.0.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Cosine similarity; zero when either side is the zero vector.
    #[must_use]
    pub fn cosine(&self, other: &Self) -> f32 {
        let denom = self.norm() * other.norm();
        if denom == 0.0 {
            return 0.0;
        }
        let dot: f32 = self.0.iter().zip(&other.0).map(|(a, b)| a * b).sum();
        dot / denom
    }

    /// Little-endian `f32` encoding used by the vector store.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> EmbeddingResult<Self> {
        if bytes.len() % 4 != 0 {
            return Err(EmbeddingError::Dimension {
                expected: EMBEDDING_DIM,
                actual: bytes.len() / 4,
            });
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(values)
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = EmbeddingError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.0
    }
}

#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> EmbeddingResult<Embedding>;
}

/// Offline embedder: signed feature hashing of character 3-, 4- and
/// 5-grams, L2-normalized. Deterministic, with no model to download.
pub struct HashEmbedder {
    ngram_sizes: Vec<usize>,
}

impl HashEmbedder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ngram_sizes: vec![3, 4, 5],
        }
    }

    #[must_use]
    pub fn embed_text(&self, text: &str) -> Embedding {
        let normalized: Vec<char> = text.trim().to_lowercase().chars().collect();
        let mut values = vec![0.0f32; EMBEDDING_DIM];

        for &size in &self.ngram_sizes {
            for window in normalized.windows(size) {
                let gram: String = window.iter().collect();
                let digest = Sha256::digest(gram.as_bytes());
                let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                    % EMBEDDING_DIM;
                let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
                values[bucket] += sign;
            }
        }

        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        }
        Embedding(values)
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash-ngram"
    }

    async fn embed(&self, text: &str) -> EmbeddingResult<Embedding> {
        Ok(self.embed_text(text))
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Client for a remote service answering `{text}` with `{embedding: [...]}`.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpEmbedder {
    pub fn new(endpoint: &str, timeout: Duration) -> EmbeddingResult<Self> {
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| EmbeddingError::Unavailable(format!("invalid endpoint {endpoint}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("evidentia/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait::async_trait]
impl Embedder for HttpEmbedder {
    fn name(&self) -> &str {
        "remote"
    }

    async fn embed(&self, text: &str) -> EmbeddingResult<Embedding> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&EmbedRequest { text })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EmbeddingError::Unavailable(status.to_string()));
        }
        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        Embedding::new(body.embedding)
    }
}

/// A fragment's vector, or `None` when generation failed.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentVector {
    pub fragment_id: Uuid,
    pub vector: Option<Embedding>,
}

#[derive(Debug, Clone, Default)]
pub struct EmbeddingRun {
    pub vectors: Vec<FragmentVector>,
    pub failed_fragments: Vec<Uuid>,
}

impl EmbeddingRun {
    #[must_use]
    pub fn embedded_count(&self) -> usize {
        self.vectors.iter().filter(|v| v.vector.is_some()).count()
    }

    #[must_use]
    pub fn embedded_ids(&self) -> Vec<Uuid> {
        self.vectors
            .iter()
            .filter(|v| v.vector.is_some())
            .map(|v| v.fragment_id)
            .collect()
    }

    #[must_use]
    pub fn failures(&self) -> usize {
        self.failed_fragments.len()
    }
}

/// Generates one vector per fragment with at most `concurrency` calls in
/// flight. Failures and timeouts leave a `None` vector for that fragment.
pub async fn embed_fragments(
    embedder: Arc<dyn Embedder>,
    fragments: &[EvidenceFragment],
    concurrency: usize,
    timeout: Duration,
) -> EmbeddingRun {
    let jobs: Vec<(u32, Uuid, String)> = fragments
        .iter()
        .map(|f| (f.ordinal, f.id, f.content.clone()))
        .collect();

    let mut outcomes: Vec<(u32, Uuid, EmbeddingResult<Embedding>)> = stream::iter(jobs)
        .map(move |(ordinal, fragment_id, content)| {
            let embedder = Arc::clone(&embedder);
            async move {
                let result = match tokio::time::timeout(timeout, embedder.embed(&content)).await {
                    Ok(result) => result,
                    Err(_) => Err(EmbeddingError::Timeout(timeout)),
                };
                (ordinal, fragment_id, result)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    outcomes.sort_by_key(|(ordinal, _, _)| *ordinal);

    let mut run = EmbeddingRun::default();
    for (_, fragment_id, outcome) in outcomes {
        let vector = match outcome {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!(fragment_id = %fragment_id, "Embedding generation failed: {}", e);
                run.failed_fragments.push(fragment_id);
                None
            }
        };
        run.vectors.push(FragmentVector { fragment_id, vector });
    }
    run
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::FragmentDraft;

    #[test]
    fn test_hash_embedding_shape() {
        let embedder = HashEmbedder::new();
        let a = embedder.embed_text("Approve purchase requisition");
        let b = embedder.embed_text("approve purchase requisition  ");
        let c = embedder.embed_text("Quarterly tax filing");

        assert_eq!(a.as_slice().len(), EMBEDDING_DIM);
        assert!((a.norm() - 1.0).abs() < 1e-4);
        assert_eq!(a, b);
        assert!(a.cosine(&b) > 0.999);
        assert!(a.cosine(&c) < 0.5);
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedding = HashEmbedder::new().embed_text("  ");
        assert_eq!(embedding, Embedding::zero());
        assert!(embedding.cosine(&HashEmbedder::new().embed_text("text")).abs() < f32::EPSILON);
    }

    #[test]
    fn test_dimension_is_enforced() {
        assert!(matches!(
            Embedding::new(vec![0.0; 3]),
            Err(EmbeddingError::Dimension { expected: EMBEDDING_DIM, actual: 3 })
        ));
        assert!(matches!(
            Embedding::new(vec![f32::NAN; EMBEDDING_DIM]),
            Err(EmbeddingError::NonFinite)
        ));
        let bytes = HashEmbedder::new().embed_text("bytes").to_bytes();
        assert_eq!(bytes.len(), EMBEDDING_DIM * 4);
        assert!(Embedding::from_bytes(&bytes[..12]).is_err());
    }

    struct FailOnOrdinalOne;

    #[async_trait::async_trait]
    impl Embedder for FailOnOrdinalOne {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn embed(&self, text: &str) -> EmbeddingResult<Embedding> {
            if text == "second" {
                return Err(EmbeddingError::Unavailable("down".into()));
            }
            Ok(HashEmbedder::new().embed_text(text))
        }
    }

    #[tokio::test]
    async fn test_failed_fragment_gets_null_vector() {
        let evidence_id = Uuid::now_v7();
        let fragments: Vec<EvidenceFragment> = ["first", "second", "third"]
            .iter()
            .enumerate()
            .map(|(i, t)| EvidenceFragment::from_draft(evidence_id, i as u32, FragmentDraft::text(*t)))
            .collect();

        let run = embed_fragments(Arc::new(FailOnOrdinalOne), &fragments, 3, Duration::from_secs(5)).await;

        assert_eq!(run.vectors.len(), 3);
        assert_eq!(run.embedded_count(), 2);
        assert_eq!(run.failed_fragments, vec![fragments[1].id]);
        assert!(run.vectors[1].vector.is_none());
        assert_eq!(run.embedded_ids(), vec![fragments[0].id, fragments[2].id]);
    }
}
