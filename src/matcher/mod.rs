pub mod embedding;
pub mod keywords;

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::docs::ingest::ExportSink;
use crate::docs::types::{Block, MatchResult};
use embedding::{cosine_similarity, Embedder, EmbeddingCache};
use keywords::KeywordExtractor;

/// How blocks are scored against a question.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoringStrategy {
    /// Sum of keyword substring counts; blocks scoring 0 are rejected.
    Keyword,
    /// Cosine similarity to the question; scores `<= threshold` are rejected.
    Embedding { threshold: f32 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions {
    /// Ranked blocks kept before neighbour expansion.
    pub top_n: Option<usize>,
    pub include_neighbors: bool,
}

/// Selects the blocks relevant to a question.
///
/// Ranking decides *which* blocks are kept; the result is always returned in
/// reading order. A non-empty input never yields an empty result: if nothing
/// scores, every block is selected.
pub struct MatchEngine {
    keywords: Arc<KeywordExtractor>,
    strategy: ScoringStrategy,
    embedder: Option<Arc<dyn Embedder>>,
    embeddings: EmbeddingCache,
    export: Option<Arc<dyn ExportSink>>,
    /// Export tasks not yet joined.
    exports: Mutex<JoinSet<()>>,
}

impl MatchEngine {
    pub fn new(keywords: Arc<KeywordExtractor>) -> Self {
        Self {
            keywords,
            strategy: ScoringStrategy::Keyword,
            embedder: None,
            embeddings: EmbeddingCache::default(),
            export: None,
            exports: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>, threshold: f32) -> Self {
        self.embedder = Some(embedder);
        self.strategy = ScoringStrategy::Embedding { threshold };
        self
    }

    pub fn with_export(mut self, sink: Arc<dyn ExportSink>) -> Self {
        self.export = Some(sink);
        self
    }

    pub fn strategy(&self) -> ScoringStrategy {
        self.strategy
    }

    /// Match `query` against one document's blocks (which must be in
    /// ascending `order_index`). The selected set is handed to the export
    /// sink under `export_id` without waiting for it.
    pub async fn match_blocks(
        &self,
        doc_id: &str,
        blocks: &[Block],
        query: &str,
        options: &MatchOptions,
        export_id: Option<&str>,
    ) -> MatchResult {
        let export_id = export_id
            .map(str::to_string)
            .unwrap_or_else(|| derive_export_id(doc_id, query));

        if blocks.is_empty() {
            return MatchResult {
                blocks: Vec::new(),
                export_id,
            };
        }

        let (scores, cutoff) = self.score(doc_id, blocks, query).await;
        let positions = select_positions(blocks, &scores, cutoff, options);
        let mut selected: Vec<Block> = positions.into_iter().map(|i| blocks[i].clone()).collect();
        selected.sort_by_key(|b| b.order_index);

        debug!(
            doc_id,
            export_id = %export_id,
            total = blocks.len(),
            selected = selected.len(),
            "blocks matched"
        );

        self.spawn_export(&export_id, &selected);
        MatchResult {
            blocks: selected,
            export_id,
        }
    }

    /// Per-block scores plus the cutoff a score must exceed to be kept.
    async fn score(&self, doc_id: &str, blocks: &[Block], query: &str) -> (Vec<f32>, f32) {
        if let (ScoringStrategy::Embedding { threshold }, Some(embedder)) =
            (self.strategy, self.embedder.as_ref())
        {
            match self.embedding_scores(doc_id, blocks, query, embedder.as_ref()).await {
                Ok(scores) => return (scores, threshold),
                Err(e) => {
                    warn!(doc_id, error = %e, "Embedding failed, falling back to keyword scores");
                }
            }
        }

        let keywords = self.keywords.extract(query);
        debug!(?keywords, "Extracted keywords");
        (keyword_scores(blocks, &keywords), 0.0)
    }

    async fn embedding_scores(
        &self,
        doc_id: &str,
        blocks: &[Block],
        query: &str,
        embedder: &dyn Embedder,
    ) -> anyhow::Result<Vec<f32>> {
        let vectors = self.embeddings.get_or_embed(doc_id, blocks, embedder).await?;
        let query_vec = embedder
            .embed_batch(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no query vector"))?;
        Ok(vectors
            .iter()
            .map(|v| cosine_similarity(&query_vec, v))
            .collect())
    }

    fn spawn_export(&self, export_id: &str, blocks: &[Block]) {
        let Some(sink) = self.export.clone() else {
            return;
        };
        let export_id = export_id.to_string();
        let blocks = blocks.to_vec();
        let mut exports = self.exports.lock().unwrap_or_else(PoisonError::into_inner);
        while exports.try_join_next().is_some() {}
        exports.spawn(async move {
            if let Err(e) = sink.export(&export_id, &blocks).await {
                warn!(export_id = %export_id, error = %e, "Match export failed");
            }
        });
    }

    /// Wait for every export spawned so far.
    pub async fn flush_exports(&self) {
        let mut pending = std::mem::take(
            &mut *self.exports.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let count = pending.len();
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Export task failed");
            }
        }
        if count > 0 {
            debug!(count, "Exports flushed");
        }
    }
}

fn derive_export_id(doc_id: &str, query: &str) -> String {
    let hash = blake3::hash(query.as_bytes()).to_hex();
    format!("{}/{}", doc_id, &hash[..12])
}

/// Sum over keywords of non-overlapping occurrences in the lowercased text.
pub fn keyword_scores(blocks: &[Block], keywords: &BTreeSet<String>) -> Vec<f32> {
    blocks
        .iter()
        .map(|block| {
            let text = block.text.to_lowercase();
            keywords
                .iter()
                .map(|k| text.matches(k.as_str()).count())
                .sum::<usize>() as f32
        })
        .collect()
}

/// Rank, truncate and expand. Returns ascending positions into `blocks`.
fn select_positions(
    blocks: &[Block],
    scores: &[f32],
    cutoff: f32,
    options: &MatchOptions,
) -> Vec<usize> {
    let mut ranked: Vec<(f32, usize)> = scores
        .iter()
        .enumerate()
        .filter(|(_, score)| **score > cutoff)
        .map(|(i, score)| (*score, i))
        .collect();

    if ranked.is_empty() {
        debug!(blocks = blocks.len(), "No block scored, using all blocks as fallback");
        ranked = (0..blocks.len()).map(|i| (0.0, i)).collect();
    }

    ranked.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| blocks[a.1].order_index.cmp(&blocks[b.1].order_index))
    });

    if let Some(n) = options.top_n {
        ranked.truncate(n.max(1));
    }

    let mut selected: BTreeSet<usize> = ranked.iter().map(|(_, i)| *i).collect();
    if options.include_neighbors {
        for &(_, i) in &ranked {
            if i > 0 {
                selected.insert(i - 1);
            }
            if i + 1 < blocks.len() {
                selected.insert(i + 1);
            }
        }
    }
    selected.into_iter().collect()
}
