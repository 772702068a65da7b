pub mod citations;
pub mod prompts;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::docs::types::{Block, MatchResult};
use crate::error::GenerationError;
use crate::llm::Generator;
use prompts::{format_context, full_document_prompt, strict_prompt, NOT_FOUND_SENTINEL};

/// One matched block as shown to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reference {
    pub page: u32,
    pub section: String,
    pub text: String,
}

impl From<&Block> for Reference {
    fn from(block: &Block) -> Self {
        let raw = if block.text.trim().is_empty() {
            block.flagged_text.as_deref().unwrap_or_default()
        } else {
            block.text.as_str()
        };
        // Unlike `Block::label`, the section label wins over the header here.
        let section = [block.section.as_deref(), block.header.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
            .unwrap_or("Miscellaneous");
        Self {
            page: block.page,
            section: section.to_string(),
            text: unescape_newlines(raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub question: String,
    pub answer: String,
    pub references: Vec<Reference>,
    /// `Page <p> : Section <n> : <header>` lines.
    pub citations: Vec<String>,
    pub escalated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Answer {
    /// Entry for a question whose pipeline failed before producing a response.
    pub fn failed(question: &str, error: impl Into<String>) -> Self {
        Self {
            question: question.to_string(),
            answer: String::new(),
            references: Vec::new(),
            citations: Vec::new(),
            escalated: false,
            error: Some(error.into()),
        }
    }
}

/// Decides whether a first-pass response is acceptable or needs the
/// full-document retry.
pub trait GroundingCheck: Send + Sync {
    fn is_grounded(&self, response: &str) -> bool;
}

/// Heuristic: the response must not be the not-found sentinel and must cite
/// at least one figure (contain a digit). Not a correctness guarantee.
pub struct DigitHeuristic;

impl GroundingCheck for DigitHeuristic {
    fn is_grounded(&self, response: &str) -> bool {
        let response = response.trim();
        response != NOT_FOUND_SENTINEL && response.chars().any(|c| c.is_ascii_digit())
    }
}

#[derive(Debug)]
enum Stage {
    Initial,
    Escalated,
    Done(Result<String, String>),
}

/// Prompts the generator over the matched blocks and escalates once to the
/// whole document when the first response is not grounded.
pub struct AnswerAssembler {
    generator: Arc<dyn Generator>,
    grounding: Arc<dyn GroundingCheck>,
    max_reference_blocks: usize,
}

impl AnswerAssembler {
    pub fn new(generator: Arc<dyn Generator>, max_reference_blocks: usize) -> Self {
        Self {
            generator,
            grounding: Arc::new(DigitHeuristic),
            max_reference_blocks,
        }
    }

    pub fn with_grounding(mut self, grounding: Arc<dyn GroundingCheck>) -> Self {
        self.grounding = grounding;
        self
    }

    /// Answer `question` from `matched`, falling back to `document` once.
    /// Only an authorization failure is returned as `Err`; transient generator
    /// failures land in `Answer::error`.
    pub async fn answer(
        &self,
        question: &str,
        matched: &MatchResult,
        document: &[Block],
    ) -> Result<Answer, GenerationError> {
        if document.is_empty() {
            debug!(question, "Empty document, skipping generation");
            return Ok(Answer {
                question: question.to_string(),
                answer: NOT_FOUND_SENTINEL.to_string(),
                references: Vec::new(),
                citations: Vec::new(),
                escalated: false,
                error: None,
            });
        }

        let mut escalated = false;
        let mut stage = Stage::Initial;
        let outcome = loop {
            stage = match stage {
                Stage::Initial => {
                    let prompt = strict_prompt(&format_context(&matched.blocks), question);
                    match self.generate(&prompt).await? {
                        Ok(text) if self.grounding.is_grounded(&text) => Stage::Done(Ok(text)),
                        Ok(text) => {
                            info!(response_len = text.len(), "Ungrounded answer, escalating to full document");
                            Stage::Escalated
                        }
                        Err(e) => {
                            warn!(error = %e, "Generation failed, escalating to full document");
                            Stage::Escalated
                        }
                    }
                }
                Stage::Escalated => {
                    escalated = true;
                    let prompt = full_document_prompt(&format_context(document), question);
                    Stage::Done(self.generate(&prompt).await?)
                }
                Stage::Done(outcome) => break outcome,
            };
        };

        let (answer, error) = match outcome {
            Ok(text) => (unescape_newlines(&text), None),
            Err(e) => (String::new(), Some(e)),
        };

        let cited =
            citations::format_references(&matched.blocks, self.max_reference_blocks, question);
        debug!(
            escalated,
            references = %citations::render_references(&cited),
            "Answer assembled"
        );

        Ok(Answer {
            question: question.to_string(),
            answer,
            references: matched.blocks.iter().map(Reference::from).collect(),
            citations: cited,
            escalated,
            error,
        })
    }

    /// Outer `Err` is fatal; inner `Err` carries a transient failure message.
    async fn generate(&self, prompt: &str) -> Result<Result<String, String>, GenerationError> {
        match self.generator.complete(prompt).await {
            Ok(text) => Ok(Ok(text)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Ok(Err(e.to_string())),
        }
    }
}

/// Turn literal `\n` sequences into newlines and trim.
fn unescape_newlines(text: &str) -> String {
    text.replace("\\n", "\n").trim().to_string()
}
