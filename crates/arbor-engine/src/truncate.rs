//! Char-bounded text clipping for everything the query surface hands out.

/// Upper bound on a navigation tool's output.
pub const MAX_TOOL_OUTPUT_CHARS: usize = 32 * 1024;

const ELLIPSIS: &str = "...";

/// Byte index of the `n`th char of `text`, or `text.len()` past the end.
pub fn byte_index(text: &str, n: usize) -> usize {
    text.char_indices().nth(n).map_or(text.len(), |(i, _)| i)
}

/// The first `max_chars` chars of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    &text[..byte_index(text, max_chars)]
}

/// Truncate tool output if it exceeds `max_chars`, appending a marker with
/// the original and kept sizes.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let kept = truncate_chars(output, max_chars);
    format!("{kept}\n\n[truncated: {total} chars -> {max_chars} chars]")
}

/// Char index of the first case-insensitive occurrence of `needle`.
pub fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let needle: Vec<char> = needle.chars().flat_map(char::to_lowercase).collect();
    if needle.is_empty() {
        return None;
    }
    let hay: Vec<char> = haystack.chars().collect();
    (0..hay.len()).find(|&start| {
        let mut lowered = hay[start..].iter().flat_map(|c| c.to_lowercase());
        needle.iter().all(|n| lowered.next() == Some(*n))
    })
}

/// A window of at most `max_chars` chars of `text`, centred on the first
/// match of `term` when there is one. Clipped sides are marked with `...`.
pub fn snippet_around(text: &str, term: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let term_len = term.chars().count();
    let start = match find_ci(text, term) {
        Some(hit) => {
            let lead = max_chars.saturating_sub(term_len) / 2;
            hit.saturating_sub(lead).min(total - max_chars)
        }
        None => 0,
    };
    let from = byte_index(text, start);
    let to = from + byte_index(&text[from..], max_chars);

    let mut out = String::with_capacity(to - from + 2 * ELLIPSIS.len());
    if start > 0 {
        out.push_str(ELLIPSIS);
    }
    out.push_str(&text[from..to]);
    if start + max_chars < total {
        out.push_str(ELLIPSIS);
    }
    out
}

/// Leading snippet with an ellipsis when clipped.
pub fn preview(text: &str, max_chars: usize) -> String {
    let kept = truncate_chars(text, max_chars);
    if kept.len() < text.len() {
        format!("{kept}{ELLIPSIS}")
    } else {
        kept.to_string()
    }
}
