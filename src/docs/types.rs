use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};

/// Short content-derived document id (blake3 hex prefix of the document key).
pub type DocId = String;

pub fn doc_id(key: &str) -> DocId {
    blake3::hash(key.as_bytes()).to_hex()[..16].to_string()
}

/// One unit of extracted document text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub page: u32,
    /// Paragraph position within the page, as produced by the extractor.
    #[serde(default)]
    pub segment: u32,
    /// Position in reading order. Written once by `ingest::prepare_blocks`.
    #[serde(default)]
    pub order_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flagged_text: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_flags",
        skip_serializing_if = "BTreeSet::is_empty"
    )]
    pub coverage_flags: BTreeSet<String>,
}

impl Block {
    /// Heading label: `header`, falling back to `section`. Blank labels count as absent.
    pub fn label(&self) -> Option<&str> {
        [self.header.as_deref(), self.section.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }

    /// Text used for prompt context: the annotated variant when present.
    pub fn context_text(&self) -> &str {
        self.flagged_text
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.text)
            .trim()
    }

    pub fn has_any_flag(&self, flags: &[&str]) -> bool {
        flags.iter().any(|f| self.coverage_flags.contains(*f))
    }
}

/// Extractors emit flags either as bare strings or as `{"type": "..."}` objects.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawFlag {
    Tagged {
        #[serde(rename = "type")]
        kind: String,
    },
    Bare(String),
}

fn deserialize_flags<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<RawFlag>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|f| match f {
            RawFlag::Tagged { kind } => kind,
            RawFlag::Bare(kind) => kind,
        })
        .map(|kind| kind.trim().to_uppercase())
        .filter(|kind| !kind.is_empty())
        .collect())
}

/// Blocks selected for one question, in ascending `order_index`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchResult {
    pub blocks: Vec<Block>,
    /// Identifier the block set was exported under.
    pub export_id: String,
}

impl MatchResult {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }
}

/// Cache entry for a previously ingested document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedDocumentRecord {
    /// Document source key, e.g. the URL it was fetched from.
    pub source: String,
    /// Content address of the stored block sequence.
    pub blocks_handle: String,
    pub block_count: usize,
    pub ingested_at: i64,
}
