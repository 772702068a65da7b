use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use tracing::info;

use crate::error::ConfigError;

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "also", "am", "an", "and", "any",
    "are", "as", "at", "be", "because", "been", "before", "being", "below", "between", "both",
    "but", "by", "can", "cannot", "could", "did", "do", "does", "doing", "done", "down", "during",
    "each", "either", "else", "enough", "etc", "ever", "every", "few", "for", "from", "further",
    "get", "gets", "give", "given", "had", "has", "have", "having", "he", "her", "here", "hers",
    "herself", "him", "himself", "his", "how", "however", "i", "if", "in", "into", "is", "it",
    "its", "itself", "just", "least", "less", "let", "like", "made", "make", "many", "may", "me",
    "might", "more", "most", "much", "must", "my", "myself", "neither", "no", "nor", "not", "now",
    "of", "off", "often", "on", "once", "only", "or", "other", "others", "otherwise", "our",
    "ours", "ourselves", "out", "over", "own", "per", "please", "put", "rather", "really", "same",
    "say", "see", "seem", "seems", "several", "shall", "she", "should", "show", "since", "so",
    "some", "such", "take", "tell", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "therefore", "these", "they", "this", "those", "though",
    "through", "thus", "to", "together", "too", "toward", "towards", "under", "until", "up",
    "upon", "us", "used", "using", "very", "via", "was", "we", "well", "were", "what", "whatever",
    "when", "whenever", "where", "whereas", "whether", "which", "while", "who", "whoever",
    "whole", "whom", "whose", "why", "will", "with", "within", "without", "would", "yet", "you",
    "your", "yours", "yourself", "yourselves",
];

/// Turns a question into its canonical keyword set: lowercase content words,
/// multi-word phrases and proper-name/quantity entities, all longer than two
/// characters.
///
/// Phrases are maximal runs of adjacent content words plus each run's trailing
/// sub-runs of at least two words, which approximates noun chunks ending on the
/// run's head word.
///
/// The stop-word resource is loaded once at startup. A missing resource file
/// is a configuration error, never a per-query failure.
pub struct KeywordExtractor {
    stop_words: HashSet<String>,
}

impl Default for KeywordExtractor {
    fn default() -> Self {
        Self::from_words(STOP_WORDS.iter().copied())
    }
}

impl KeywordExtractor {
    /// Build from an optional stop-word file (one word per line, `#` comments).
    /// `None` uses the built-in English list.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Resource {
            path: path.display().to_string(),
            source,
        })?;
        let extractor = Self::from_words(
            raw.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#')),
        );
        info!(
            path = %path.display(),
            stop_words = extractor.stop_words.len(),
            "keyword resource loaded"
        );
        Ok(extractor)
    }

    pub fn from_words<'a>(words: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            stop_words: words.into_iter().map(|w| w.to_lowercase()).collect(),
        }
    }

    fn is_stop(&self, lower: &str) -> bool {
        self.stop_words.contains(lower)
    }

    /// Alphabetic, not a stop word, longer than two characters.
    fn is_content(&self, lower: &str) -> bool {
        lower.chars().count() > 2 && lower.chars().all(char::is_alphabetic) && !self.is_stop(lower)
    }

    /// Content word or hyphenated compound with at least one content part.
    fn is_phrase_word(&self, lower: &str) -> bool {
        if lower.contains('-') {
            lower.split('-').any(|p| self.is_content(p))
        } else {
            self.is_content(lower)
        }
    }

    pub fn extract(&self, query: &str) -> BTreeSet<String> {
        let tokens = tokenize(query);
        let lowered: Vec<String> = tokens.iter().map(|t| t.text.to_lowercase()).collect();
        let mut keywords = BTreeSet::new();

        // Content words; hyphenated compounds are kept whole and split.
        for lower in &lowered {
            if lower.contains('-') {
                let parts: Vec<&str> = lower.split('-').filter(|p| !p.is_empty()).collect();
                if parts.iter().any(|p| self.is_content(p)) {
                    keywords.insert(lower.clone());
                }
                for part in parts {
                    if self.is_content(part) {
                        keywords.insert(part.to_string());
                    }
                }
            } else if self.is_content(lower) {
                keywords.insert(lower.clone());
            }
        }

        // Phrases: maximal runs of adjacent phrase words.
        let mut run: Vec<&str> = Vec::new();
        for (token, lower) in tokens.iter().zip(&lowered) {
            if !token.joined {
                flush_phrase(&mut run, &mut keywords);
            }
            if self.is_phrase_word(lower) {
                run.push(lower);
            } else {
                flush_phrase(&mut run, &mut keywords);
            }
        }
        flush_phrase(&mut run, &mut keywords);

        // Entities: runs of proper-looking tokens, and number + unit pairs.
        let mut entity: Vec<&str> = Vec::new();
        for (i, (token, lower)) in tokens.iter().zip(&lowered).enumerate() {
            if !token.joined {
                flush_entity(&mut entity, &mut keywords);
            }
            if token.is_proper() && !self.is_stop(lower) {
                entity.push(lower);
            } else {
                flush_entity(&mut entity, &mut keywords);
            }

            if token.text.chars().all(|c| c.is_ascii_digit()) {
                if let Some((next, next_lower)) = tokens.get(i + 1).zip(lowered.get(i + 1)) {
                    if next.joined && self.is_content(next_lower) {
                        keywords.insert(format!("{} {}", lower, next_lower));
                    }
                }
            }
        }
        flush_entity(&mut entity, &mut keywords);

        keywords
    }
}

/// Emit a run of adjacent phrase words and every trailing sub-run of two or
/// more words, so "policy sum insured" also yields "sum insured".
fn flush_phrase(run: &mut Vec<&str>, keywords: &mut BTreeSet<String>) {
    if run.len() >= 2 {
        for start in 0..=run.len() - 2 {
            keywords.insert(run[start..].join(" "));
        }
    }
    run.clear();
}

fn flush_entity(run: &mut Vec<&str>, keywords: &mut BTreeSet<String>) {
    let joined = run.join(" ");
    if joined.chars().count() > 2 {
        keywords.insert(joined);
    }
    run.clear();
}

struct Token<'a> {
    text: &'a str,
    /// First token of the query or of a sentence.
    sentence_start: bool,
    /// Separated from the previous token by whitespace only.
    joined: bool,
}

impl Token<'_> {
    /// Capitalised mid-sentence, or carrying an inner capital (`RNNs`, `McKinsey`).
    fn is_proper(&self) -> bool {
        let mut chars = self.text.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        let inner_upper = chars.filter(|c| c.is_uppercase()).count();
        first.is_uppercase() && (!self.sentence_start || inner_upper > 0)
    }
}

fn push_token<'a>(tokens: &mut Vec<Token<'a>>, word: &'a str, sentence_start: bool, joined: bool) {
    let word = word.trim_matches(|c: char| c == '-' || c == '\'');
    let word = word.strip_suffix("'s").unwrap_or(word);
    if !word.is_empty() {
        tokens.push(Token {
            text: word,
            sentence_start,
            joined,
        });
    }
}

fn tokenize(query: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    let mut sentence_start = true;
    let mut joined = false;

    for (i, c) in query.char_indices() {
        let in_word = c.is_alphanumeric() || (start.is_some() && (c == '-' || c == '\''));
        if in_word {
            if start.is_none() {
                start = Some(i);
            }
            continue;
        }
        if let Some(s) = start.take() {
            push_token(&mut tokens, &query[s..i], sentence_start, joined);
            sentence_start = false;
            joined = true;
        }
        if !c.is_whitespace() {
            joined = false;
            if matches!(c, '.' | '?' | '!' | ';' | ':') {
                sentence_start = true;
            }
        }
    }
    if let Some(s) = start {
        push_token(&mut tokens, &query[s..], sentence_start, joined);
    }
    tokens
}
