//! Boundary-aware text truncation
//!
//! Lengths are counted in characters, not bytes, so a cut never splits a
//! UTF-8 sequence.

/// Truncate `text` to at most `max_len` characters, preferring natural
/// boundaries.
///
/// Tries, in order: the last sentence terminator within the final 20% of the
/// limit, the last paragraph break within the final 40%, the last whitespace,
/// then a hard cut. Text already within the limit is returned unchanged.
pub fn smart_truncate(text: &str, max_len: usize) -> String {
    let Some((end, _)) = text.char_indices().nth(max_len) else {
        return text.to_string();
    };

    let chars: Vec<char> = text[..end].chars().collect();
    let next = text[end..].chars().next();
    let sentence_floor = max_len - max_len / 5;
    let paragraph_floor = max_len - max_len * 2 / 5;

    let is_terminator_at = |i: usize| {
        matches!(chars[i], '.' | '!' | '?')
            && chars
                .get(i + 1)
                .copied()
                .or(next)
                .map_or(true, char::is_whitespace)
    };

    if let Some(i) = (sentence_floor..chars.len()).rev().find(|&i| is_terminator_at(i)) {
        return chars[..=i].iter().collect();
    }

    if let Some(i) = (paragraph_floor..chars.len().saturating_sub(1))
        .rev()
        .find(|&i| chars[i] == '\n' && chars[i + 1] == '\n')
    {
        let cut: String = chars[..i].iter().collect();
        return cut.trim_end().to_string();
    }

    if let Some(i) = (1..chars.len()).rev().find(|&i| chars[i].is_whitespace()) {
        let cut: String = chars[..i].iter().collect();
        let trimmed = cut.trim_end();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    chars.into_iter().collect()
}
