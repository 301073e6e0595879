//! SQL `LIKE` matching for error-message patterns.

/// Match `text` against a SQL `LIKE` pattern.
///
/// `%` matches any run of characters, `_` exactly one, and `\` escapes the
/// next character. Comparison is ASCII case-insensitive, as under the
/// default MySQL collation.
pub fn like_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    matches_from(&pattern, &text)
}

fn matches_from(pattern: &[char], text: &[char]) -> bool {
    // Iterative wildcard matching with single-star backtracking.
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                '%' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                '_' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                '\\' if p + 1 < pattern.len() => {
                    if eq(pattern[p + 1], text[t]) {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c => {
                    if eq(c, text[t]) {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }
        match star {
            Some((sp, st)) => {
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == '%')
}

fn eq(a: char, b: char) -> bool {
    a.eq_ignore_ascii_case(&b)
}

#[cfg(test)]
mod tests {
    use super::like_match;

    #[test]
    fn percent_wildcards() {
        assert!(like_match("%Deadlock%", "OperationalError: Deadlock found when trying"));
        assert!(like_match("%Deadlock%", "Deadlock"));
        assert!(!like_match("%Deadlock%", "dead lock"));
    }

    #[test]
    fn anchored_prefix() {
        assert!(like_match("InternalError: (1205%", "InternalError: (1205, 'Lock wait')"));
        assert!(!like_match("InternalError: (1205%", "x InternalError: (1205"));
    }

    #[test]
    fn underscore_matches_one_char() {
        assert!(like_match("a_c", "abc"));
        assert!(!like_match("a_c", "abbc"));
    }

    #[test]
    fn case_insensitive() {
        assert!(like_match("%sigterm%", "Received SIGTERM"));
    }

    #[test]
    fn escaped_wildcard_is_literal() {
        assert!(like_match("100\\%", "100%"));
        assert!(!like_match("100\\%", "1000"));
    }

    #[test]
    fn empty_pattern_only_matches_empty_text() {
        assert!(like_match("", ""));
        assert!(!like_match("", "x"));
        assert!(like_match("%", ""));
    }
}
