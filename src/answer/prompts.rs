use crate::docs::types::Block;

/// Exact text the generator must reproduce when the context holds no answer.
pub const NOT_FOUND_SENTINEL: &str = "Answer not found in the provided document.";

/// Render blocks in the order given, emitting a heading line whenever a block's
/// label differs from the last heading emitted.
pub fn format_context(blocks: &[Block]) -> String {
    let mut out = String::new();
    let mut current: Option<&str> = None;
    for block in blocks {
        if let Some(label) = block.label() {
            if current != Some(label) {
                current = Some(label);
                out.push('\n');
                out.push_str(label);
                out.push('\n');
            }
        }
        out.push_str(block.context_text());
        out.push_str("\n\n");
    }
    out.trim().to_string()
}

/// Prompt over the matched blocks only.
pub fn strict_prompt(context: &str, question: &str) -> String {
    format!(
        "You must answer strictly and exclusively from the provided document. \
         Your entire output must remain fully grounded in it.\n\n\
         RULES (no exceptions):\n\
         1. Use ONLY information explicitly in the document.\n\
         2. Quote exact wording whenever referencing the document.\n\
         3. Do NOT add, assume, infer, interpret, or use outside knowledge.\n\
         4. Do NOT summarize unless the summary consists only of quoted text.\n\
         5. Do NOT fabricate details, metadata, page numbers, or section labels.\n\
         6. Do NOT explain or expand beyond what the document states.\n\
         7. If the answer is not explicitly present, reply EXACTLY:\n   \
         {sentinel}\n\
         8. No alternative phrasing or extra commentary beyond the answer.\n\n\
         TASK:\n\
         Answer the question strictly using the document.\n\n\
         Document:\n{context}\n\n\
         Question: {question}\n\n\
         Answer:",
        sentinel = NOT_FOUND_SENTINEL,
    )
}

/// Prompt over the whole document, used for the single escalation.
pub fn full_document_prompt(context: &str, question: &str) -> String {
    format!(
        "You are an assistant answering questions based only on the provided document.\n\
         Quote the relevant policy wording exactly where possible.\n\
         If the answer is not found, reply exactly: {sentinel}\n\n\
         Document:\n{context}\n\n\
         Question: {question}\nAnswer:",
        sentinel = NOT_FOUND_SENTINEL,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::block;

    #[test]
    fn test_headers_emitted_on_change_only() {
        let blocks = vec![
            block(1, 0, Some("1 Intro"), "a"),
            block(1, 1, Some("1 Intro"), "b"),
            block(1, 2, Some("2 Cover"), "c"),
            block(2, 3, Some("1 Intro"), "d"),
        ];
        assert_eq!(
            format_context(&blocks),
            "1 Intro\na\n\nb\n\n\n2 Cover\nc\n\n\n1 Intro\nd"
        );
    }

    #[test]
    fn test_unlabelled_blocks_keep_current_heading() {
        let mut annotated = block(1, 1, None, "raw");
        annotated.flagged_text = Some("  [COVERS] raw  ".to_string());
        let mut sectioned = block(1, 2, None, "e");
        sectioned.section = Some("1 Intro".to_string());
        let blocks = vec![block(1, 0, Some("1 Intro"), "a"), annotated, sectioned];
        assert_eq!(format_context(&blocks), "1 Intro\na\n\n[COVERS] raw\n\ne");
    }

    #[test]
    fn test_prompts_carry_sentinel_and_question() {
        let strict = strict_prompt("ctx", "what is the grace period?");
        assert!(strict.contains(NOT_FOUND_SENTINEL));
        assert!(strict.contains("Document:\nctx\n\n"));
        assert!(strict.ends_with("Question: what is the grace period?\n\nAnswer:"));

        let full = full_document_prompt("ctx", "q");
        assert!(full.contains(&format!("reply exactly: {}", NOT_FOUND_SENTINEL)));
        assert!(full.ends_with("Question: q\nAnswer:"));
    }
}
