//! LIKE / ILIKE pattern matching.
//!
//! Shared by the expression evaluator and by the predicate utilities so that
//! both agree on wildcard semantics:
//! - `%` matches zero or more characters
//! - `_` matches exactly one character
//!
//! `like` is case-sensitive; `ilike` compares lowercased scalar values.

use alloc::string::String;
use alloc::vec::Vec;

/// Case-sensitive LIKE matching.
///
/// ```
/// use rill_core::pattern_match::like;
/// assert!(like("hello", "h%o"));
/// assert!(like("hello", "_ello"));
/// assert!(!like("hello", "world"));
/// ```
pub fn like(value: &str, pattern: &str) -> bool {
    let v: Vec<char> = value.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    match_chars(&v, &p)
}

/// Case-insensitive LIKE matching.
///
/// ```
/// use rill_core::pattern_match::ilike;
/// assert!(ilike("Hello", "h%O"));
/// ```
pub fn ilike(value: &str, pattern: &str) -> bool {
    let v: Vec<char> = lowercase(value).chars().collect();
    let p: Vec<char> = lowercase(pattern).chars().collect();
    match_chars(&v, &p)
}

fn lowercase(s: &str) -> String {
    s.chars().flat_map(char::to_lowercase).collect()
}

// Greedy two-pointer matcher with backtracking to the last `%`.
fn match_chars(v: &[char], p: &[char]) -> bool {
    let (mut vi, mut pi) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while vi < v.len() {
        if pi < p.len() && (p[pi] == '_' || (p[pi] != '%' && p[pi] == v[vi])) {
            vi += 1;
            pi += 1;
        } else if pi < p.len() && p[pi] == '%' {
            star = Some((pi, vi));
            pi += 1;
        } else if let Some((star_pi, star_vi)) = star {
            pi = star_pi + 1;
            vi = star_vi + 1;
            star = Some((star_pi, star_vi + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '%')
}
