//! Prompt text for the three external calls.

pub const DECISION_SYSTEM: &str = "You split long documents into self-contained chunks. \
Reply with a single JSON object and nothing else.";

pub const SUMMARY_SYSTEM: &str = "You write dense, faithful summaries. Keep names, numbers, \
dates and defined terms. Do not add information that is not in the text.";

pub const ANALYSIS_SYSTEM: &str = "You answer questions about one excerpt of a larger document. \
Answer only from the excerpt. If it does not contain the answer, say so briefly.";

/// Ask for a semantic cut within `window`. Indices are char positions
/// relative to the window start.
pub fn decision_prompt(window: &str, window_chars: usize, target_chars: usize) -> String {
    format!(
        "The text below is {window_chars} characters long.\n\
         ---\n{window}\n---\n\n\
         Pick the best natural stopping point for a chunk of roughly {target_chars} characters \
         (end of a section, paragraph or sentence), and where the next chunk should begin so \
         that it keeps enough preceding context.\n\n\
         Return JSON with:\n\
         - \"cut_index\" (int): where this chunk ends, 1 to {window_chars}.\n\
         - \"next_chunk_start_index\" (int): where the next chunk begins, 1 to cut_index. \
         The difference is the overlap.\n\
         - \"reasoning\" (string): one short sentence on why."
    )
}

pub fn leaf_summary_prompt(text: &str) -> String {
    format!("Summarize:\n\n{text}")
}

/// Summarize consecutive sibling summaries into one parent summary.
pub fn group_summary_prompt(joined_summaries: &str) -> String {
    format!(
        "The following are summaries of consecutive sections of one document, in order. \
         Write one summary covering all of them.\n\n{joined_summaries}"
    )
}

pub fn analysis_prompt(chunk_text: &str, query: &str) -> String {
    format!("Excerpt:\n---\n{chunk_text}\n---\n\nQuestion: {query}")
}
