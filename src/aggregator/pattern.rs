//! Sequential-segments wildcard matcher used by `filter_tools`.
//!
//! A pattern with no `*` matches as a substring. A pattern with `*` is
//! split into non-empty segments that must appear in the input in order;
//! a leading segment anchors to position 0 unless the pattern starts with
//! `*`, a trailing segment anchors to the end unless the pattern ends with
//! `*`, and intermediate segments match anywhere after the previous one.
//! The end anchor only applies when that trailing segment is also the
//! pattern's only segment (e.g. `*foo`): once an earlier segment has
//! already anchored or matched, a later one just needs to appear
//! somewhere after it, not flush to the end.

pub fn matches(pattern: &str, input: &str, case_sensitive: bool) -> bool {
    let (pattern, input) = if case_sensitive {
        (pattern.to_string(), input.to_string())
    } else {
        (pattern.to_lowercase(), input.to_lowercase())
    };

    if !pattern.contains('*') {
        return input.contains(&pattern);
    }

    let anchored_start = !pattern.starts_with('*');
    let anchored_end = !pattern.ends_with('*');
    let segments: Vec<&str> = pattern.split('*').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return true; // pattern was "*" or "**" etc.
    }

    let mut cursor = 0usize;
    for (i, segment) in segments.iter().enumerate() {
        let is_first = i == 0;
        let is_last = i == segments.len() - 1;

        if is_first && anchored_start {
            if !input[cursor..].starts_with(segment) {
                return false;
            }
            cursor += segment.len();
            continue;
        }

        let remaining = &input[cursor..];
        let found = match remaining.find(segment) {
            Some(pos) => pos,
            None => return false,
        };

        // Only a single-segment pattern (e.g. "*foo") actually anchors to
        // the end: once a prior segment has already matched, this one just
        // needs to appear somewhere after it, not flush to the end, since
        // earlier tokens between the two are expected and allowed.
        if is_last && is_first && anchored_end && cursor + found + segment.len() != input.len() {
            return false;
        }

        cursor += found + segment.len();
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substring_pattern_with_no_wildcard() {
        assert!(matches("read", "x_fs_read_file", true));
        assert!(!matches("write", "x_fs_read_file", true));
    }

    #[test]
    fn leading_and_trailing_wildcards_are_unanchored() {
        assert!(matches("*read*", "x_fs_read_file", true));
    }

    #[test]
    fn anchored_start_requires_position_zero() {
        assert!(matches("x_fs*", "x_fs_read_file", true));
        assert!(!matches("x_fs*", "y_x_fs_read_file", true));
    }

    #[test]
    fn anchored_end_requires_flush_to_end() {
        assert!(matches("*_file", "x_fs_read_file", true));
        assert!(!matches("*_file", "x_fs_read_file_extra", true));
    }

    #[test]
    fn intermediate_segments_match_in_order_anywhere() {
        assert!(matches("x_*_read_*_file", "x_fs_read_local_file", true));
        assert!(!matches("x_*_write_*_file", "x_fs_read_local_file", true));
    }

    #[test]
    fn case_sensitivity_toggle() {
        assert!(!matches("READ", "x_fs_read_file", true));
        assert!(matches("READ", "x_fs_read_file", false));
    }

    #[test]
    fn trailing_segment_after_an_earlier_anchored_one_need_not_reach_the_end() {
        assert!(matches("service*list", "service_list_tools", false));
        assert!(!matches("service*list", "list_service_tools", false));
    }
}
