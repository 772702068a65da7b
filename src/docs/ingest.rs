use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::types::Block;

/// Produces the ordered block sequence for a document source.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn load(&self, source: &str) -> Result<Vec<Block>>;
}

/// Reads an extractor-produced JSON array of blocks from a URL or local path.
pub struct JsonBlockSource {
    client: reqwest::Client,
}

impl JsonBlockSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlockSource for JsonBlockSource {
    async fn load(&self, source: &str) -> Result<Vec<Block>> {
        let body = if source.starts_with("http://") || source.starts_with("https://") {
            let resp = self
                .client
                .get(source)
                .send()
                .await
                .context("Failed to fetch document blocks")?;
            let status = resp.status();
            if !status.is_success() {
                anyhow::bail!("document fetch returned HTTP {}", status.as_u16());
            }
            resp.bytes()
                .await
                .context("Failed to read response body")?
                .to_vec()
        } else {
            tokio::fs::read(source)
                .await
                .with_context(|| format!("Failed to read {}", source))?
        };

        let blocks: Vec<Block> =
            serde_json::from_slice(&body).context("Failed to parse block JSON")?;
        info!(source, blocks = blocks.len(), "document blocks loaded");
        Ok(prepare_blocks(blocks))
    }
}

/// Clean and order freshly extracted blocks. This is the only place
/// `order_index` is assigned.
pub fn prepare_blocks(mut blocks: Vec<Block>) -> Vec<Block> {
    // Stable: blocks without segment info keep their file order within a page.
    blocks.sort_by_key(|b| (b.page, b.segment));
    for (idx, block) in blocks.iter_mut().enumerate() {
        block.order_index = idx;
        block.text = normalize_text(&block.text);
        block.flagged_text = block.flagged_text.as_deref().map(normalize_text);
        block.header = block.header.as_deref().map(sanitize_text);
        block.section = block.section.as_deref().map(sanitize_text);
    }
    blocks
}

const LIGATURES: &[(&str, &str)] = &[
    ("\u{FB01}", "fi"),
    ("\u{FB02}", "fl"),
    ("\u{FB00}", "ff"),
    ("\u{FB03}", "ffi"),
    ("\u{FB04}", "ffl"),
    ("\u{FB05}", "ft"),
    ("\u{FB06}", "st"),
];

fn normalize_text(text: &str) -> String {
    let mut out = sanitize_text(text);
    for (lig, replacement) in LIGATURES {
        if out.contains(lig) {
            out = out.replace(lig, replacement);
        }
    }
    out
}

/// Drop C0 control characters other than tab, newline and carriage return.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|&c| (c as u32) >= 32 || matches!(c, '\t' | '\n' | '\r'))
        .collect()
}

/// Receives each matched block set. Best effort: callers log failures and
/// carry on.
#[async_trait]
pub trait ExportSink: Send + Sync {
    async fn export(&self, export_id: &str, blocks: &[Block]) -> Result<()>;
}

/// Writes matched block sets as pretty JSON under a directory.
pub struct FsExportSink {
    root: PathBuf,
}

impl FsExportSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, export_id: &str) -> PathBuf {
        // Ids look like "<doc-id>/q3"; keep them inside the root.
        let rel: PathBuf = export_id
            .split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .collect();
        if rel.as_os_str().is_empty() {
            let hash = blake3::hash(export_id.as_bytes()).to_hex();
            return self.root.join(format!("export-{}.json", &hash[..16]));
        }
        self.root.join(rel).with_extension("json")
    }
}

#[async_trait]
impl ExportSink for FsExportSink {
    async fn export(&self, export_id: &str, blocks: &[Block]) -> Result<()> {
        let path = self.path_for(export_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let sanitized: Vec<Block> = blocks
            .iter()
            .cloned()
            .map(|mut b| {
                b.text = sanitize_text(&b.text);
                b.flagged_text = b.flagged_text.as_deref().map(sanitize_text);
                b
            })
            .collect();
        let json = serde_json::to_vec_pretty(&sanitized).context("serialize export")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        debug!(export_id, path = %path.display(), blocks = blocks.len(), "match set exported");
        Ok(())
    }
}
