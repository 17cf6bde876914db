//! Fuzzy scoring for the picker.
//!
//! Query characters must appear in order in the candidate, case
//! insensitively. Prefix matches rank above word-boundary matches, which
//! rank above bare subsequence matches; gaps between matched characters
//! are penalized by distance and camelCase transitions earn a bonus.
//! Ties break toward the shorter candidate, then lexicographically.

/// Picker responses never contain more than this many items.
pub const MAX_RESULTS: usize = 50;

mod bonus {
    /// Whole query is a contiguous prefix of the candidate.
    pub const PREFIX: i64 = 1000;
    /// First matched character sits on a word boundary.
    pub const BOUNDARY_START: i64 = 200;
    /// Matched character follows a separator.
    pub const WORD_BOUNDARY: i64 = 30;
    /// Matched character is an uppercase following a lowercase.
    pub const CAMEL_CASE: i64 = 20;
    /// Matched character directly follows the previous match.
    pub const CONSECUTIVE: i64 = 15;
    /// Per skipped character between matches.
    pub const GAP: i64 = -2;
}

fn is_separator(c: char) -> bool {
    matches!(c, ' ' | '_' | '-' | '/' | '.' | ':')
}

/// Score `query` against `candidate`. `None` when the query is not a
/// subsequence of the candidate. Higher is better; the empty query
/// matches everything with score 0.
pub fn score(query: &str, candidate: &str) -> Option<i64> {
    if query.is_empty() {
        return Some(0);
    }
    let query: Vec<char> = query.chars().flat_map(char::to_lowercase).collect();
    let chars: Vec<char> = candidate.chars().collect();
    let lower: Vec<char> = chars.iter().flat_map(|c| c.to_lowercase()).collect();
    if lower.len() != chars.len() || query.len() > chars.len() {
        // Multi-char lowercasings are rare; fall back to a simple scan.
        return subsequence_only(&query, candidate);
    }

    let mut best: Option<i64> = None;
    for start in 0..=chars.len() - query.len() {
        if lower[start] != query[0] {
            continue;
        }
        if let Some(s) = score_from(&query, &chars, &lower, start) {
            best = Some(best.map_or(s, |b| b.max(s)));
        }
    }
    best
}

/// Greedy forward match anchored at `start`.
fn score_from(query: &[char], chars: &[char], lower: &[char], start: usize) -> Option<i64> {
    let mut total = char_bonus(chars, start);
    let mut prev = start;
    let mut qi = 1;
    let mut ti = start + 1;
    while qi < query.len() {
        if ti >= chars.len() {
            return None;
        }
        if lower[ti] == query[qi] {
            if ti == prev + 1 {
                total += bonus::CONSECUTIVE;
            } else {
                total += bonus::GAP * (ti - prev - 1) as i64;
            }
            total += char_bonus(chars, ti);
            prev = ti;
            qi += 1;
        }
        ti += 1;
    }

    let contiguous = prev + 1 - start == query.len();
    if start == 0 && contiguous {
        total += bonus::PREFIX;
    } else if boundary(chars, start) {
        total += bonus::BOUNDARY_START;
    }
    Some(total)
}

fn boundary(chars: &[char], idx: usize) -> bool {
    idx == 0
        || is_separator(chars[idx - 1])
        || (chars[idx - 1].is_lowercase() && chars[idx].is_uppercase())
}

fn char_bonus(chars: &[char], idx: usize) -> i64 {
    if idx == 0 {
        return 0;
    }
    if is_separator(chars[idx - 1]) {
        bonus::WORD_BOUNDARY
    } else if chars[idx - 1].is_lowercase() && chars[idx].is_uppercase() {
        bonus::CAMEL_CASE
    } else {
        0
    }
}

/// Plain in-order scan for candidates where per-char indexing is unsafe.
fn subsequence_only(query: &[char], candidate: &str) -> Option<i64> {
    let mut qi = 0;
    for c in candidate.chars().flat_map(char::to_lowercase) {
        if qi < query.len() && c == query[qi] {
            qi += 1;
        }
    }
    (qi == query.len()).then_some(0)
}

/// Rank candidates against a query: matched indices sorted best-first,
/// capped at [`MAX_RESULTS`]. Ties break toward the shorter candidate,
/// then lexicographically.
pub fn rank<S: AsRef<str>>(query: &str, candidates: &[S]) -> Vec<usize> {
    let mut scored: Vec<(usize, i64)> = candidates
        .iter()
        .enumerate()
        .filter_map(|(idx, c)| score(query, c.as_ref()).map(|s| (idx, s)))
        .collect();
    scored.sort_by(|&(ia, sa), &(ib, sb)| {
        let a = candidates[ia].as_ref();
        let b = candidates[ib].as_ref();
        sb.cmp(&sa)
            .then_with(|| a.len().cmp(&b.len()))
            .then_with(|| a.cmp(b))
    });
    scored.truncate(MAX_RESULTS);
    scored.into_iter().map(|(idx, _)| idx).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked<'a>(query: &str, items: &[&'a str]) -> Vec<&'a str> {
        rank(query, items).into_iter().map(|i| items[i]).collect()
    }

    #[test]
    fn empty_query_matches_everything() {
        assert_eq!(score("", "anything"), Some(0));
    }

    #[test]
    fn non_subsequence_does_not_match() {
        assert_eq!(score("xyz", "main.rs"), None);
        assert_eq!(score("sm", "ms"), None);
    }

    #[test]
    fn case_insensitive() {
        assert!(score("MAIN", "main.rs").is_some());
        assert!(score("main", "MAIN.RS").is_some());
    }

    #[test]
    fn prefix_beats_word_boundary() {
        let prefix = score("ma", "main.rs").unwrap();
        let boundary = score("ma", "src/main.rs").unwrap();
        assert!(prefix > boundary, "prefix {prefix} <= boundary {boundary}");
    }

    #[test]
    fn word_boundary_beats_subsequence() {
        let boundary = score("ma", "src/main.rs").unwrap();
        let sparse = score("ma", "formula.rs").unwrap();
        assert!(boundary > sparse, "boundary {boundary} <= sparse {sparse}");
    }

    #[test]
    fn camel_case_boundary_beats_plain_subsequence() {
        let camel = score("ma", "fooMaker.rs").unwrap();
        let sparse = score("ma", "formula.rs").unwrap();
        assert!(camel > sparse, "camel {camel} <= sparse {sparse}");
    }

    #[test]
    fn gaps_are_penalized_by_distance() {
        let tight = score("ab", "xxab").unwrap();
        let wide = score("ab", "xxaxxxb").unwrap();
        assert!(tight > wide, "tight {tight} <= wide {wide}");
    }

    #[test]
    fn ties_break_to_shorter_then_lexicographic() {
        let items = ["makefile", "main.rs", "manifest"];
        let got = ranked("ma", &items);
        assert_eq!(got[0], "main.rs");
        // Same length, same score: lexicographic.
        assert_eq!(&got[1..], ["makefile", "manifest"]);
    }

    #[test]
    fn results_are_capped() {
        let many: Vec<String> = (0..200).map(|i| format!("file_{i:03}.rs")).collect();
        assert_eq!(rank("file", &many).len(), MAX_RESULTS);
    }

    #[test]
    fn best_anchor_wins_over_first_occurrence() {
        // 'm' occurs early with a bad continuation; the boundary anchor
        // later in the string must still be found.
        let s = score("map", "from_map.rs").unwrap();
        let sparse = score("map", "formulaic_pile.rs").unwrap();
        assert!(s > sparse);
    }
}
