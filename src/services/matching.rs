//! Channel name matching for failover suggestions
//!
//! Pure functions, no I/O.

use lazy_static::lazy_static;
use regex::Regex;

/// Added when one normalized name contains the other
pub const CONTAINMENT_BONUS: f64 = 0.3;

lazy_static! {
    static ref BRACKETED: Regex = Regex::new(r"\([^)]*\)|\[[^\]]*\]|\{[^}]*\}").unwrap();

    // Only stripped when followed by a separator, so "USA Network" survives
    static ref COUNTRY_PREFIX: Regex = Regex::new(
        r"(?i)^\s*(us|usa|uk|gb|ca|fr|de|es|it|br|pt|mx|ar|nl|be|au|in|tr|pl|ie|se|no|dk)\s*[:|\-]\s*"
    )
    .unwrap();

    static ref QUALITY: Regex =
        Regex::new(r"(?i)\b(uhd|fhd|hd|sd|4k|8k|hevc|h\.?265|1080[pi]?|720p|2160p|hdr)\b").unwrap();

    static ref NON_ALNUM: Regex = Regex::new(r"[^a-z0-9]").unwrap();
}

/// Canonical form used to compare names across providers
///
/// `"USA Network (East) HD"` becomes `"usanetwork"`.
pub fn normalize_name(name: &str) -> String {
    let without_brackets = BRACKETED.replace_all(name, " ");
    let without_country = COUNTRY_PREFIX.replace(&without_brackets, "");
    let without_quality = QUALITY.replace_all(&without_country, " ");
    let lowered = without_quality.to_lowercase();
    NON_ALNUM.replace_all(&lowered, "").into_owned()
}

/// Edit distance over chars
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Similarity of two already-normalized names in `[0, 1]`
pub fn similarity_normalized(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let longest = a.chars().count().max(b.chars().count()) as f64;
    let mut score = 1.0 - levenshtein(a, b) as f64 / longest;
    if a.contains(b) || b.contains(a) {
        score += CONTAINMENT_BONUS;
    }
    score.clamp(0.0, 1.0)
}
