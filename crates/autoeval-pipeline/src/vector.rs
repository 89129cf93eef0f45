//! Vector similarity service contract and an in-process implementation.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use autoeval_types::Result;

/// Namespace holding the comparison text of every indexed eval case.
pub const NS_EVAL_PROMPTS: &str = "eval_prompts";
/// Namespace holding embedded failure summaries.
pub const NS_FAILURES: &str = "failures";

pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorItem {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// One ranked hit. `score` is cosine similarity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Metadata,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn upsert(&self, items: Vec<VectorItem>, namespace: &str) -> Result<()>;

    /// Up to `top_k` matches, best first.
    async fn query(&self, vector: &[f32], namespace: &str, top_k: usize)
        -> Result<Vec<VectorMatch>>;

    async fn query_text(&self, text: &str, namespace: &str, top_k: usize) -> Result<Vec<VectorMatch>> {
        let vector = self.embed(text).await?;
        self.query(&vector, namespace, top_k).await
    }
}

/// FNV-1a. Stable across processes and toolchains, unlike `DefaultHasher`.
pub(crate) fn stable_hash(text: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in text.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

// ---------------------------------------------------------------------------
// InMemoryVectorIndex
// ---------------------------------------------------------------------------

const EMBEDDING_DIMS: usize = 256;

/// Hashed bag-of-words embeddings with exact cosine search.
///
/// Identical texts score 1.0 and texts sharing no words score 0.0, which is
/// enough for dry runs and tests of the duplicate filter.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    namespaces: RwLock<HashMap<String, BTreeMap<String, VectorItem>>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items stored in `namespace`.
    pub async fn count(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map_or(0, |items| items.len())
    }
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
    vector
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    f64::from(dot / (na * nb))
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; EMBEDDING_DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = stable_hash(&word.to_lowercase()) as usize % EMBEDDING_DIMS;
            vector[bucket] += 1.0;
        }
        Ok(normalize(vector))
    }

    async fn upsert(&self, items: Vec<VectorItem>, namespace: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        let entries = namespaces.entry(namespace.to_string()).or_default();
        for item in items {
            entries.insert(item.id.clone(), item);
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        namespace: &str,
        top_k: usize,
    ) -> Result<Vec<VectorMatch>> {
        let namespaces = self.namespaces.read().await;
        let Some(entries) = namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        let mut matches: Vec<VectorMatch> = entries
            .values()
            .map(|item| VectorMatch {
                id: item.id.clone(),
                score: cosine(vector, &item.vector),
                metadata: item.metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(top_k);
        Ok(matches)
    }
}
