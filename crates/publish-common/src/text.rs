//! Text helpers shared by the import log and the loaders
//!
//! Sizes are counted in characters, not bytes, so a chunk boundary never
//! lands inside a multi-byte UTF-8 sequence.

/// Split `text` into consecutive pieces of at most `max_chars` characters.
///
/// Concatenating the pieces in order yields `text` again. An empty input
/// yields a single empty piece so callers always have something to store.
pub fn chunk_chars(text: &str, max_chars: usize) -> Vec<&str> {
    if max_chars == 0 || text.is_empty() {
        return vec![text];
    }

    let mut chunks = Vec::with_capacity(text.len() / max_chars + 1);
    let mut start = 0;
    let mut count = 0;

    for (idx, _) in text.char_indices() {
        if count == max_chars {
            chunks.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    chunks.push(&text[start..]);

    chunks
}

/// First `max_chars` characters of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Number of newline characters, the way `wc -l` counts lines.
pub fn count_lines(bytes: &[u8]) -> u64 {
    bytes.iter().filter(|b| **b == b'\n').count() as u64
}
