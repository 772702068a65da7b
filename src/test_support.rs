use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::docs::types::Block;
use crate::error::GenerationError;
use crate::llm::Generator;

pub fn block(page: u32, order_index: usize, header: Option<&str>, text: &str) -> Block {
    Block {
        page,
        segment: 0,
        order_index,
        header: header.map(str::to_string),
        section: None,
        text: text.to_string(),
        flagged_text: None,
        coverage_flags: Default::default(),
    }
}

pub fn flagged(mut b: Block, flags: &[&str]) -> Block {
    b.coverage_flags = flags.iter().map(|f| f.to_string()).collect();
    b
}

/// Blocks whose `order_index` matches their position.
pub fn doc(texts: &[&str]) -> Vec<Block> {
    texts
        .iter()
        .enumerate()
        .map(|(i, t)| block(1, i, None, t))
        .collect()
}

/// Replays queued responses in call order and records every prompt.
/// When the queue runs dry, answers from `reply_for` keyed on the prompt.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<String, GenerationError>>>,
    prompts: Mutex<Vec<String>>,
    reply_for: Option<Box<dyn Fn(&str) -> (Duration, Result<String, GenerationError>) + Send + Sync>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Result<String, GenerationError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            prompts: Mutex::new(Vec::new()),
            reply_for: None,
        }
    }

    pub fn replying<F>(f: F) -> Self
    where
        F: Fn(&str) -> (Duration, Result<String, GenerationError>) + Send + Sync + 'static,
    {
        Self {
            script: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            reply_for: Some(Box::new(f)),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn complete(&self, prompt: &str) -> Result<String, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let next = self.script.lock().unwrap().pop_front();
        if let Some(result) = next {
            return result;
        }
        match &self.reply_for {
            Some(f) => {
                let (delay, result) = f(prompt);
                tokio::time::sleep(delay).await;
                result
            }
            None => Err(GenerationError::Transient("script exhausted".to_string())),
        }
    }
}
