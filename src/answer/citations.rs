use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::docs::types::Block;

/// Question phrases that bias citation choice toward blocks carrying the
/// associated coverage flags. First match wins.
const FLAG_TRIGGERS: &[(&str, &[&str])] = &[
    ("grace period", &["CONDITION", "HIGH PRIORITY"]),
    ("maternity", &["MATERNITY", "COVERS", "EXCLUDES", "CONDITION"]),
    ("moratorium", &["PRE-EXISTING", "HIGH PRIORITY", "CONDITION"]),
];

const NO_HEADER: &str = "No Header";

static SECTION_NUMBER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\[?(\d+(?:\.\d+)*)").ok());

/// Leading `digits(.digits)*` of a heading, or `"Unknown"`.
pub fn section_number(header: &str) -> String {
    SECTION_NUMBER
        .as_ref()
        .and_then(|re| re.captures(header))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn trigger_flags(question: &str) -> Option<&'static [&'static str]> {
    let question = question.to_lowercase();
    FLAG_TRIGGERS
        .iter()
        .find(|(phrase, _)| question.contains(phrase))
        .map(|(_, flags)| *flags)
}

/// Up to `max_blocks` citation lines, one per distinct heading, in the form
/// `Page <p> : Section <n> : <header>`.
pub fn format_references(blocks: &[Block], max_blocks: usize, question: &str) -> Vec<String> {
    let candidates: Vec<&Block> = match trigger_flags(question) {
        Some(flags) => {
            let preferred: Vec<&Block> = blocks.iter().filter(|b| b.has_any_flag(flags)).collect();
            if preferred.is_empty() {
                blocks.iter().collect()
            } else {
                preferred
            }
        }
        None => blocks.iter().collect(),
    };

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .map(|b| (b, b.label().unwrap_or(NO_HEADER)))
        .filter(|(_, header)| seen.insert(*header))
        .take(max_blocks)
        .map(|(b, header)| {
            format!(
                "Page {} : Section {} : {}",
                b.page,
                section_number(header),
                header
            )
        })
        .collect()
}

pub fn render_references(lines: &[String]) -> String {
    if lines.is_empty() {
        "No relevant sections found".to_string()
    } else {
        lines.join(", ")
    }
}
