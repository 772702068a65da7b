use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::answer::{Answer, AnswerAssembler};
use crate::docs::ingest::BlockSource;
use crate::docs::types::{doc_id, Block, ProcessedDocumentRecord};
use crate::docs::DocumentStore;
use crate::error::{GenerationError, QaError};
use crate::matcher::{MatchEngine, MatchOptions};

/// Runs a batch of questions against one document: load (or reuse) the
/// block sequence, then match and answer every question concurrently.
pub struct QuestionOrchestrator {
    store: Arc<DocumentStore>,
    source: Arc<dyn BlockSource>,
    matcher: Arc<MatchEngine>,
    assembler: Arc<AnswerAssembler>,
    options: MatchOptions,
}

impl QuestionOrchestrator {
    pub fn new(
        store: Arc<DocumentStore>,
        source: Arc<dyn BlockSource>,
        matcher: Arc<MatchEngine>,
        assembler: Arc<AnswerAssembler>,
        options: MatchOptions,
    ) -> Self {
        Self {
            store,
            source,
            matcher,
            assembler,
            options,
        }
    }

    /// Block sequence for `key`, ingesting it at most once per key at a time.
    pub async fn load_document(&self, key: &str) -> Result<Arc<Vec<Block>>, QaError> {
        if let Some(blocks) = self.store.loaded(key).await {
            return Ok(blocks);
        }

        let _guard = self.store.ingest_guard(key).await;
        if let Some(blocks) = self.store.loaded(key).await {
            debug!(doc_key = %key, "Document ingested by a concurrent batch");
            return Ok(blocks);
        }

        if let Some(record) = self.store.get(key).await {
            match self.store.load_blocks(&record.blocks_handle).await {
                Ok(blocks) => {
                    info!(doc_key = %key, blocks = blocks.len(), "Using cached document");
                    let blocks = Arc::new(blocks);
                    self.store.remember(key, blocks.clone()).await;
                    return Ok(blocks);
                }
                Err(e) => {
                    warn!(doc_key = %key, error = %e, "Cached block set unreadable, re-ingesting");
                }
            }
        }

        let started = Instant::now();
        let blocks = self
            .source
            .load(key)
            .await
            .map_err(|e| QaError::Ingest {
                document: key.to_string(),
                reason: format!("{:#}", e),
            })?;
        info!(
            doc_key = %key,
            blocks = blocks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Document ingested"
        );

        match self.store.store_blocks(&blocks).await {
            Ok(handle) => {
                let record = ProcessedDocumentRecord {
                    source: key.to_string(),
                    blocks_handle: handle,
                    block_count: blocks.len(),
                    ingested_at: chrono::Utc::now().timestamp(),
                };
                self.store.put(key, &record).await;
            }
            Err(e) => warn!(doc_key = %key, error = %e, "Cache save error"),
        }

        let blocks = Arc::new(blocks);
        self.store.remember(key, blocks.clone()).await;
        Ok(blocks)
    }

    /// Answer `questions` against the document at `key`. The result has one
    /// entry per question, in input order.
    ///
    /// Transient failures stay on their own entry. An authorization failure
    /// fails the batch once every question task has finished.
    pub async fn answer_batch(&self, key: &str, questions: &[String]) -> Result<Vec<Answer>, QaError> {
        let started = Instant::now();
        let blocks = self.load_document(key).await?;
        let doc_id = doc_id(key);

        let tasks = questions.iter().enumerate().map(|(idx, question)| {
            let blocks = blocks.clone();
            let matcher = self.matcher.clone();
            let assembler = self.assembler.clone();
            let options = self.options;
            let question = question.clone();
            let export_id = format!("{}/q{}", doc_id, idx + 1);
            let doc_id = doc_id.clone();

            tokio::spawn(async move {
                let started = Instant::now();
                let matched = matcher
                    .match_blocks(&doc_id, &blocks, &question, &options, Some(&export_id))
                    .await;
                let answer = assembler.answer(&question, &matched, &blocks).await;
                info!(
                    question_idx = idx + 1,
                    matched = matched.len(),
                    escalated = answer.as_ref().map(|a| a.escalated).unwrap_or(false),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Question answered"
                );
                answer
            })
        });
        let results = join_all(tasks).await;

        let mut fatal = None;
        let mut answers = Vec::with_capacity(questions.len());
        for (question, result) in questions.iter().zip(results) {
            match result {
                Ok(Ok(answer)) => answers.push(answer),
                Ok(Err(GenerationError::Unauthorized { status, model })) => {
                    error!(status, model = %model, "Generator rejected credentials");
                    if fatal.is_none() {
                        fatal = Some(QaError::Unauthorized { status, model });
                    }
                    answers.push(Answer::failed(question, "generator rejected credentials"));
                }
                Ok(Err(e)) => answers.push(Answer::failed(question, e.to_string())),
                Err(e) => {
                    error!(error = %e, question = %question, "Question task failed");
                    answers.push(Answer::failed(question, format!("question task failed: {}", e)));
                }
            }
        }

        info!(
            doc_key = %key,
            questions = questions.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch finished"
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(answers),
        }
    }

    /// Wait for match exports still being written in the background.
    pub async fn shutdown(&self) {
        self.matcher.flush_exports().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::matcher::keywords::KeywordExtractor;
    use crate::test_support::{block, ScriptedGenerator};

    struct CountingSource {
        blocks: Vec<Block>,
        loads: AtomicUsize,
        delay: Duration,
    }

    impl CountingSource {
        fn new(blocks: Vec<Block>) -> Self {
            Self {
                blocks,
                loads: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl BlockSource for CountingSource {
        async fn load(&self, _source: &str) -> anyhow::Result<Vec<Block>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.blocks.clone())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl BlockSource for BrokenSource {
        async fn load(&self, _source: &str) -> anyhow::Result<Vec<Block>> {
            anyhow::bail!("document fetch returned HTTP 404")
        }
    }

    fn policy() -> Vec<Block> {
        vec![
            block(1, 0, Some("1 Intro"), "Grace period is 30 days"),
            block(2, 1, Some("2 Maternity"), "Maternity is covered after 24 months"),
            block(3, 2, Some("3 Claims"), "Claims must be filed within 15 days"),
        ]
    }

    async fn orchestrator(
        source: Arc<dyn BlockSource>,
        generator: Arc<ScriptedGenerator>,
    ) -> (tempfile::TempDir, Arc<DocumentStore>, QuestionOrchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(dir.path()).await.unwrap());
        let orch = QuestionOrchestrator::new(
            store.clone(),
            source,
            Arc::new(MatchEngine::new(Arc::new(KeywordExtractor::default()))),
            Arc::new(AnswerAssembler::new(generator, 3)),
            MatchOptions {
                top_n: Some(8),
                include_neighbors: true,
            },
        );
        (dir, store, orch)
    }

    fn questions(qs: &[&str]) -> Vec<String> {
        qs.iter().map(|q| q.to_string()).collect()
    }

    /// Replies "<question> 1" after a delay chosen per question.
    fn delayed(delays: &'static [(&'static str, u64)]) -> ScriptedGenerator {
        ScriptedGenerator::replying(move |prompt| {
            for (q, ms) in delays {
                if prompt.contains(&format!("Question: {}", q)) {
                    return (Duration::from_millis(*ms), Ok(format!("{} 1", q)));
                }
            }
            (Duration::ZERO, Ok("unknown 0".to_string()))
        })
    }

    #[tokio::test]
    async fn test_answers_keep_question_order() {
        let gen = Arc::new(delayed(&[
            ("grace period?", 80),
            ("maternity?", 40),
            ("claims?", 0),
        ]));
        let source = Arc::new(CountingSource::new(policy()));
        let (_dir, _store, orch) = orchestrator(source, gen.clone()).await;

        let qs = questions(&["grace period?", "maternity?", "claims?"]);
        let answers = orch.answer_batch("policy.json", &qs).await.unwrap();

        let got: Vec<&str> = answers.iter().map(|a| a.question.as_str()).collect();
        assert_eq!(got, vec!["grace period?", "maternity?", "claims?"]);
        assert_eq!(answers[0].answer, "grace period? 1");
        assert_eq!(answers[2].answer, "claims? 1");
        assert!(answers.iter().all(|a| a.error.is_none() && !a.escalated));
        assert_eq!(gen.calls(), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_stays_on_its_entry() {
        let gen = Arc::new(ScriptedGenerator::replying(|prompt| {
            if prompt.contains("maternity?") {
                (
                    Duration::ZERO,
                    Err(GenerationError::Transient("Error: generator returned status 503".into())),
                )
            } else {
                (Duration::ZERO, Ok("30 days".to_string()))
            }
        }));
        let source = Arc::new(CountingSource::new(policy()));
        let (_dir, _store, orch) = orchestrator(source, gen).await;

        let qs = questions(&["grace period?", "maternity?", "claims?"]);
        let answers = orch.answer_batch("policy.json", &qs).await.unwrap();

        assert_eq!(answers.len(), 3);
        assert_eq!(answers[0].answer, "30 days");
        assert_eq!(
            answers[1].error.as_deref(),
            Some("Error: generator returned status 503")
        );
        assert!(answers[1].escalated);
        assert_eq!(answers[2].answer, "30 days");
    }

    #[tokio::test]
    async fn test_unauthorized_fails_batch_after_siblings_finish() {
        let gen = Arc::new(ScriptedGenerator::replying(|prompt| {
            if prompt.contains("Question: grace period?") {
                (
                    Duration::ZERO,
                    Err(GenerationError::Unauthorized {
                        status: 401,
                        model: "m".to_string(),
                    }),
                )
            } else {
                (Duration::from_millis(30), Ok("24 months".to_string()))
            }
        }));
        let source = Arc::new(CountingSource::new(policy()));
        let (_dir, _store, orch) = orchestrator(source, gen.clone()).await;

        let qs = questions(&["grace period?", "maternity?", "claims?"]);
        let err = orch.answer_batch("policy.json", &qs).await.unwrap_err();

        assert!(matches!(err, QaError::Unauthorized { status: 401, .. }));
        assert!(err.to_string().contains("LLM_API_KEY"));
        assert_eq!(gen.calls(), 3);
    }

    #[tokio::test]
    async fn test_document_is_ingested_once_across_batches() {
        let source = Arc::new(CountingSource::new(policy()));
        let gen = Arc::new(ScriptedGenerator::replying(|_| {
            (Duration::ZERO, Ok("30 days".to_string()))
        }));
        let (_dir, store, orch) = orchestrator(source.clone(), gen).await;

        orch.answer_batch("policy.json", &questions(&["a?"])).await.unwrap();
        orch.answer_batch("policy.json", &questions(&["b?", "c?"])).await.unwrap();

        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        let record = store.get("policy.json").await.unwrap();
        assert_eq!(record.block_count, 3);
        assert_eq!(store.load_blocks(&record.blocks_handle).await.unwrap(), policy());
    }

    #[tokio::test]
    async fn test_concurrent_first_loads_are_single_flight() {
        let mut slow = CountingSource::new(policy());
        slow.delay = Duration::from_millis(50);
        let source = Arc::new(slow);
        let gen = Arc::new(ScriptedGenerator::new(vec![]));
        let (_dir, _store, orch) = orchestrator(source.clone(), gen).await;

        let (a, b) = tokio::join!(
            orch.load_document("policy.json"),
            orch.load_document("policy.json")
        );

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persisted_record_skips_ingestion() {
        let gen = Arc::new(ScriptedGenerator::new(vec![]));
        let (_dir, store, orch) = orchestrator(Arc::new(BrokenSource), gen).await;

        let handle = store.store_blocks(&policy()).await.unwrap();
        store
            .put(
                "policy.json",
                &ProcessedDocumentRecord {
                    source: "policy.json".to_string(),
                    blocks_handle: handle,
                    block_count: 3,
                    ingested_at: 0,
                },
            )
            .await;

        let blocks = orch.load_document("policy.json").await.unwrap();
        assert_eq!(blocks.len(), 3);
    }

    #[tokio::test]
    async fn test_dangling_record_triggers_reingest() {
        let source = Arc::new(CountingSource::new(policy()));
        let gen = Arc::new(ScriptedGenerator::new(vec![]));
        let (_dir, store, orch) = orchestrator(source.clone(), gen).await;

        store
            .put(
                "policy.json",
                &ProcessedDocumentRecord {
                    source: "policy.json".to_string(),
                    blocks_handle: "0000missing".to_string(),
                    block_count: 3,
                    ingested_at: 0,
                },
            )
            .await;

        let blocks = orch.load_document("policy.json").await.unwrap();
        assert_eq!(blocks.as_slice(), policy().as_slice());
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        // The record now points at a readable block set.
        let record = store.get("policy.json").await.unwrap();
        assert_ne!(record.blocks_handle, "0000missing");
        assert!(store.load_blocks(&record.blocks_handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_panicked_question_is_reported_on_its_entry() {
        let gen = Arc::new(ScriptedGenerator::replying(|prompt| {
            if prompt.contains("Question: maternity?") {
                panic!("generator crashed");
            }
            (Duration::ZERO, Ok("30 days".to_string()))
        }));
        let source = Arc::new(CountingSource::new(policy()));
        let (_dir, _store, orch) = orchestrator(source, gen).await;

        let qs = questions(&["grace period?", "maternity?", "claims?"]);
        let answers = orch.answer_batch("policy.json", &qs).await.unwrap();

        assert_eq!(answers.len(), 3);
        assert_eq!(answers[1].question, "maternity?");
        assert!(answers[1]
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("question task failed")));
        for idx in [0, 2] {
            assert_eq!(answers[idx].answer, "30 days");
            assert!(answers[idx].error.is_none());
        }
    }

    #[tokio::test]
    async fn test_ingest_failure_fails_batch() {
        let gen = Arc::new(ScriptedGenerator::new(vec![]));
        let (_dir, _store, orch) = orchestrator(Arc::new(BrokenSource), gen.clone()).await;

        let err = orch
            .answer_batch("https://example.com/missing.pdf", &questions(&["q?"]))
            .await
            .unwrap_err();

        match err {
            QaError::Ingest { document, reason } => {
                assert_eq!(document, "https://example.com/missing.pdf");
                assert!(reason.contains("404"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(gen.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_document_answers_not_found() {
        let source = Arc::new(CountingSource::new(Vec::new()));
        let gen = Arc::new(ScriptedGenerator::new(vec![]));
        let (_dir, _store, orch) = orchestrator(source, gen.clone()).await;

        let answers = orch
            .answer_batch("empty.json", &questions(&["anything?"]))
            .await
            .unwrap();

        assert_eq!(answers[0].answer, crate::answer::prompts::NOT_FOUND_SENTINEL);
        assert_eq!(gen.calls(), 0);
    }
}
