/// Longest prefix of `s` that is at most `max_bytes` bytes and does not
/// split a multi-byte UTF-8 character.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_is_unchanged() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("", 0), "");
    }

    #[test]
    fn ascii_truncates_exactly() {
        assert_eq!(truncate_utf8("hello world", 5), "hello");
    }

    #[test]
    fn multibyte_backs_off_to_char_boundary() {
        // Each emoji is 4 bytes; a 6-byte limit lands mid-character.
        let s = "🎉🎉🎉";
        let t = truncate_utf8(s, 6);
        assert_eq!(t, "🎉");
        assert!(t.len() <= 6);
    }

    #[test]
    fn result_is_prefix_valid_and_bounded_for_all_limits() {
        let s = "a✓🎉b漢字c";
        for limit in 0..=s.len() + 2 {
            let t = truncate_utf8(s, limit);
            assert!(t.len() <= limit || s.len() <= limit);
            assert!(s.starts_with(t));
            // &str output guarantees UTF-8 validity; re-check the boundary.
            assert!(s.is_char_boundary(t.len()));
        }
    }
}
