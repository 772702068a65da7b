use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::docs::types::{Block, DocId};
use crate::docs::KeyedLocks;

/// Sentence-embedding model.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Block embeddings per document, computed on first use. Concurrent misses
/// for one document embed it once.
#[derive(Default)]
pub struct EmbeddingCache {
    by_doc: RwLock<HashMap<DocId, Arc<Vec<Vec<f32>>>>>,
    in_flight: KeyedLocks,
}

impl EmbeddingCache {
    pub async fn get_or_embed(
        &self,
        doc_id: &str,
        blocks: &[Block],
        embedder: &dyn Embedder,
    ) -> Result<Arc<Vec<Vec<f32>>>> {
        if let Some(vectors) = self.cached(doc_id, blocks.len()).await {
            return Ok(vectors);
        }
        let _guard = self.in_flight.lock(doc_id).await;
        if let Some(vectors) = self.cached(doc_id, blocks.len()).await {
            return Ok(vectors);
        }

        let texts: Vec<String> = blocks.iter().map(|b| b.text.clone()).collect();
        let vectors = Arc::new(embedder.embed_batch(&texts).await?);
        anyhow::ensure!(
            vectors.len() == blocks.len(),
            "embedder returned {} vectors for {} blocks",
            vectors.len(),
            blocks.len()
        );
        debug!(doc_id, blocks = blocks.len(), "block embeddings computed");

        self.by_doc
            .write()
            .await
            .insert(doc_id.to_string(), vectors.clone());
        Ok(vectors)
    }

    async fn cached(&self, doc_id: &str, len: usize) -> Option<Arc<Vec<Vec<f32>>>> {
        self.by_doc
            .read()
            .await
            .get(doc_id)
            .filter(|v| v.len() == len)
            .cloned()
    }
}
