//! Fuzzy resident-name validation and number normalization
//!
//! A provided name is compared against each known resident of the
//! apartment using three similarity measures (full ratio, best-window
//! partial ratio, token-sort ratio, all 0–100); the maximum decides.
//! Admission threshold is 75, inclusive.

use strsim::normalized_levenshtein;

/// Minimum score for a resident-name match.
pub const MATCH_THRESHOLD: u8 = 75;

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

fn ratio(a: &str, b: &str) -> u8 {
    (normalized_levenshtein(a, b) * 100.0).round() as u8
}

/// Plain normalized similarity of the full strings.
pub fn full_ratio(a: &str, b: &str) -> u8 {
    ratio(&normalize(a), &normalize(b))
}

/// Best similarity of the shorter string against every window of its
/// length in the longer one; catches a first name inside a full name.
pub fn partial_ratio(a: &str, b: &str) -> u8 {
    let a = normalize(a);
    let b = normalize(b);
    let (short, long) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    let short_len = short.chars().count();
    if short_len == 0 {
        return 0;
    }
    let long_chars: Vec<char> = long.chars().collect();
    if long_chars.len() == short_len {
        return ratio(&short, &long);
    }
    let mut best = 0u8;
    for window in long_chars.windows(short_len) {
        let candidate: String = window.iter().collect();
        best = best.max(ratio(&short, &candidate));
        if best == 100 {
            break;
        }
    }
    best
}

/// Similarity after sorting whitespace tokens, so word order is ignored.
pub fn token_sort_ratio(a: &str, b: &str) -> u8 {
    let sort = |value: &str| {
        let mut tokens: Vec<&str> = value.split_whitespace().collect();
        tokens.sort_unstable();
        tokens.join(" ")
    };
    ratio(&sort(&normalize(a)), &sort(&normalize(b)))
}

/// Maximum of the three measures.
pub fn similarity(a: &str, b: &str) -> u8 {
    full_ratio(a, b)
        .max(partial_ratio(a, b))
        .max(token_sort_ratio(a, b))
}

/// Best-scoring resident for a provided name, with the score.
pub fn best_match<'a>(provided: &str, residents: &'a [String]) -> Option<(&'a str, u8)> {
    residents
        .iter()
        .map(|resident| (resident.as_str(), similarity(provided, resident)))
        .max_by_key(|(_, score)| *score)
}

/// Whether a score clears the admission threshold (inclusive).
pub fn is_match(score: u8) -> bool {
    score >= MATCH_THRESHOLD
}

/// Extract the dialable digits from a directory voip number, which is
/// either bare digits or a SIP URI (`sip:<digits>@<host>`).
pub fn normalize_voip_number(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("sip:")
        .or_else(|| trimmed.strip_prefix("SIP:"))
        .unwrap_or(trimmed);
    let user_part = without_scheme.split('@').next().unwrap_or(without_scheme);
    user_part.chars().filter(|c| c.is_ascii_digit()).collect()
}
