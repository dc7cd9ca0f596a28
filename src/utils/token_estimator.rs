//! Word-based token estimation, used where a piece of text has no stored
//! `n_tokens` count (prompt headers, formatted section titles).

/// Estimate tokens from text using a word-based heuristic: ~1.3 tokens per
/// word plus a small formatting overhead, cheaper than invoking a real
/// tokenizer for short strings assembled at prompt-build time.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let words = text.split_whitespace().count();
    ((words as f64 * 1.3) + 5.0).ceil() as usize
}

/// Check if adding `new_text` would push `current_tokens` past `max_tokens`.
pub fn would_exceed_limit(current_tokens: usize, new_text: &str, max_tokens: usize) -> bool {
    current_tokens + estimate_tokens(new_text) > max_tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_costs_nothing() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn word_count_drives_the_estimate() {
        let text = "one two three four five six seven";
        let tokens = estimate_tokens(text);
        assert!((13..=16).contains(&tokens));
    }

    #[test]
    fn would_exceed_respects_the_ceiling() {
        let current = 1000;
        let text = "word ".repeat(500);
        assert!(would_exceed_limit(current, &text, 1500));
        assert!(!would_exceed_limit(current, &text, 2000));
    }
}
