//! Snapshot canonicalization and change scoring.
//!
//! Canonical form depends on content type: text-like content is
//! whitespace-collapsed, lowercased and stripped of volatile sections;
//! images become a 64-bit average-hash digest over a chunk-averaged
//! luminance grid; everything else is raw bytes. Hashes are sha-256 over
//! the canonical form, so hash equality short-circuits scoring.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use netmind_store::types::{ChangeType, ServiceStatus};

/// Shingle length for text similarity, in tokens.
const SHINGLE_LEN: usize = 5;

/// Volatile sections removed from text-like content before comparison.
/// Defaults cover timestamps, nonces and session tokens; extra rules can
/// be supplied per detector.
static DEFAULT_STRIP: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // ISO-8601 timestamps
        r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:z|[+-]\d{2}:?\d{2})?",
        // explicit nonce attributes/fields
        r#"nonce["'=:\s]+[a-z0-9+/=_-]+"#,
        // session ids and tokens in urls or fields
        r#"(?:session[_-]?(?:id|token)|csrf[_-]?token)["'=:\s]+[a-z0-9+/=_-]+"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Canonical representation of one snapshot's content.
#[derive(Debug, Clone, PartialEq)]
pub enum Canonical {
    Text(String),
    ImageDigest(u64),
    Raw(Vec<u8>),
}

impl Canonical {
    /// Bytes fed into the stable hash.
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            Canonical::Text(s) => s.as_bytes().to_vec(),
            Canonical::ImageDigest(d) => d.to_be_bytes().to_vec(),
            Canonical::Raw(b) => b.clone(),
        }
    }
}

pub struct ChangeDetector {
    strip: Vec<Regex>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self {
            strip: DEFAULT_STRIP.clone(),
        }
    }

    /// Add a strip rule on top of the defaults.
    pub fn with_strip_rule(mut self, pattern: &str) -> Self {
        if let Ok(re) = Regex::new(pattern) {
            self.strip.push(re);
        }
        self
    }

    /// Canonicalize content according to its type.
    pub fn canonicalize(&self, content: &[u8], content_type: &str) -> Canonical {
        if is_text_like(content_type) {
            let text = String::from_utf8_lossy(content).to_lowercase();
            let mut stripped = text;
            for re in &self.strip {
                stripped = re.replace_all(&stripped, " ").into_owned();
            }
            let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
            Canonical::Text(collapsed)
        } else if content_type.starts_with("image/") {
            Canonical::ImageDigest(luminance_digest(content))
        } else {
            Canonical::Raw(content.to_vec())
        }
    }

    /// Stable hex hash of the canonical form.
    pub fn hash(&self, content: &[u8], content_type: &str) -> String {
        let canonical = self.canonicalize(content, content_type);
        hex::encode(Sha256::digest(canonical.bytes()))
    }

    /// Score the delta between two observations of the same target.
    /// 0 means identical, 1 means entirely different.
    pub fn score(
        &self,
        prev: &[u8],
        curr: &[u8],
        content_type: &str,
    ) -> (f64, ChangeType) {
        let prev_canon = self.canonicalize(prev, content_type);
        let curr_canon = self.canonicalize(curr, content_type);

        if prev_canon == curr_canon {
            return (0.0, ChangeType::Content);
        }

        let score = match (&prev_canon, &curr_canon) {
            (Canonical::Text(a), Canonical::Text(b)) => shingle_distance(a, b),
            (Canonical::ImageDigest(a), Canonical::ImageDigest(b)) => {
                (a ^ b).count_ones() as f64 / 64.0
            }
            _ => 1.0,
        };
        (score, ChangeType::Content)
    }

    /// online ⇄ offline transitions score 1.0; anything touching
    /// `unknown` is not a transition.
    pub fn score_status(
        &self,
        prev: ServiceStatus,
        curr: ServiceStatus,
    ) -> Option<(f64, ChangeType)> {
        match (prev, curr) {
            (ServiceStatus::Online, ServiceStatus::Offline)
            | (ServiceStatus::Offline, ServiceStatus::Online) => Some((1.0, ChangeType::Status)),
            _ => None,
        }
    }

    /// Metadata-only delta: fraction of touched keys, capped at 0.5.
    pub fn score_metadata(
        &self,
        prev: &serde_json::Map<String, serde_json::Value>,
        curr: &serde_json::Map<String, serde_json::Value>,
    ) -> (f64, ChangeType) {
        let keys: HashSet<&String> = prev.keys().chain(curr.keys()).collect();
        if keys.is_empty() {
            return (0.0, ChangeType::Metadata);
        }
        let changed = keys
            .iter()
            .filter(|k| prev.get(**k) != curr.get(**k))
            .count();
        let score = (changed as f64 / keys.len() as f64) * 0.5;
        (score, ChangeType::Metadata)
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn is_text_like(content_type: &str) -> bool {
    content_type.starts_with("text/")
        || content_type == "application/json"
        || content_type.ends_with("+json")
        || content_type.ends_with("+xml")
}

/// Jaccard distance over the shingle sets of the two texts.
fn shingle_distance(a: &str, b: &str) -> f64 {
    let sa = shingles(a);
    let sb = shingles(b);
    if sa.is_empty() && sb.is_empty() {
        return 0.0;
    }
    if sa.is_empty() || sb.is_empty() {
        return 1.0;
    }
    let intersection = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    1.0 - intersection / union
}

fn shingles(text: &str) -> HashSet<String> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return HashSet::new();
    }
    if tokens.len() < SHINGLE_LEN {
        let mut set = HashSet::new();
        set.insert(tokens.join(" "));
        return set;
    }
    tokens
        .windows(SHINGLE_LEN)
        .map(|w| w.join(" "))
        .collect()
}

/// 64-bit average hash over a chunk-averaged luminance grid.
///
/// Input bytes are treated as a luminance sequence (capture plugins hand
/// over decoded low-resolution frames); the sequence is reduced to 64
/// cells by chunk averaging, and each cell contributes one bit: above or
/// below the grid mean.
fn luminance_digest(bytes: &[u8]) -> u64 {
    if bytes.is_empty() {
        return 0;
    }
    let chunk = bytes.len().div_ceil(64);
    let cells: Vec<u64> = bytes
        .chunks(chunk)
        .map(|c| c.iter().map(|b| *b as u64).sum::<u64>() / c.len() as u64)
        .collect();
    let mean = cells.iter().sum::<u64>() / cells.len() as u64;
    let mut digest = 0u64;
    for (i, cell) in cells.iter().enumerate().take(64) {
        if *cell >= mean {
            digest |= 1 << i;
        }
    }
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_scores_zero() {
        let d = ChangeDetector::new();
        let (score, _) = d.score(b"<html>same</html>", b"<html>same</html>", "text/html");
        assert_eq!(score, 0.0);
    }

    #[test]
    fn whitespace_and_case_are_canonical() {
        let d = ChangeDetector::new();
        let a = d.hash(b"Hello   World\n\n  foo", "text/html");
        let b = d.hash(b"hello world foo", "text/html");
        assert_eq!(a, b);
    }

    #[test]
    fn timestamps_are_volatile() {
        let d = ChangeDetector::new();
        let a = d.hash(
            b"generated at 2026-08-01T10:00:00Z content body here",
            "text/html",
        );
        let b = d.hash(
            b"generated at 2026-08-01T11:30:00Z content body here",
            "text/html",
        );
        assert_eq!(a, b);
    }

    #[test]
    fn session_tokens_are_volatile() {
        let d = ChangeDetector::new();
        let a = d.hash(b"page session_token=abc123 body", "text/html");
        let b = d.hash(b"page session_token=zzz999 body", "text/html");
        assert_eq!(a, b);
    }

    #[test]
    fn small_text_edit_scores_low_rewrite_scores_high() {
        let d = ChangeDetector::new();
        let base = "one two three four five six seven eight nine ten eleven twelve";
        let edited = "one two three four five six seven eight nine ten eleven thirteen";
        let (small, _) = d.score(base.as_bytes(), edited.as_bytes(), "text/plain");
        let rewrite = "completely different words appear in this other document now";
        let (big, _) = d.score(base.as_bytes(), rewrite.as_bytes(), "text/plain");
        assert!(small > 0.0 && small < 0.6, "small edit scored {small}");
        assert!(big > 0.9, "rewrite scored {big}");
    }

    #[test]
    fn image_distance_is_normalized_hamming() {
        let d = ChangeDetector::new();
        let a: Vec<u8> = (0..64).map(|i| if i < 32 { 10 } else { 200 }).collect();
        let b: Vec<u8> = (0..64).map(|i| if i < 32 { 200 } else { 10 }).collect();
        let (same, _) = d.score(&a, &a, "image/jpeg");
        assert_eq!(same, 0.0);
        let (flipped, _) = d.score(&a, &b, "image/jpeg");
        assert_eq!(flipped, 1.0);
    }

    #[test]
    fn octet_stream_differs_fully() {
        let d = ChangeDetector::new();
        let (score, kind) = d.score(b"\x00\x01", b"\x00\x02", "application/octet-stream");
        assert_eq!(score, 1.0);
        assert_eq!(kind, ChangeType::Content);
    }

    #[test]
    fn status_transition_is_full_score() {
        let d = ChangeDetector::new();
        assert_eq!(
            d.score_status(ServiceStatus::Online, ServiceStatus::Offline),
            Some((1.0, ChangeType::Status))
        );
        assert_eq!(d.score_status(ServiceStatus::Unknown, ServiceStatus::Online), None);
        assert_eq!(d.score_status(ServiceStatus::Online, ServiceStatus::Online), None);
    }

    #[test]
    fn metadata_delta_capped_at_half() {
        let d = ChangeDetector::new();
        let mut prev = serde_json::Map::new();
        prev.insert("ports".into(), serde_json::json!([80, 443]));
        prev.insert("server".into(), serde_json::json!("nginx"));
        let mut curr = serde_json::Map::new();
        curr.insert("ports".into(), serde_json::json!([80]));
        curr.insert("server".into(), serde_json::json!("caddy"));
        let (score, kind) = d.score_metadata(&prev, &curr);
        assert_eq!(kind, ChangeType::Metadata);
        assert!(score <= 0.5);
        assert!(score > 0.0);
    }

    #[test]
    fn custom_strip_rule_extends_defaults() {
        let d = ChangeDetector::new().with_strip_rule(r"viewers: \d+");
        let a = d.hash(b"stream page viewers: 4 body", "text/html");
        let b = d.hash(b"stream page viewers: 250 body", "text/html");
        assert_eq!(a, b);
    }

    #[test]
    fn canonical_form_and_hash_survive_round_trip() {
        let d = ChangeDetector::new();
        let content = b"<html>Device   Dashboard</html>".to_vec();
        let hash = d.hash(&content, "text/html");
        // serialize/deserialize the raw content (as the store does)
        let json = serde_json::to_vec(&content).unwrap();
        let back: Vec<u8> = serde_json::from_slice(&json).unwrap();
        assert_eq!(
            d.canonicalize(&back, "text/html"),
            d.canonicalize(&content, "text/html")
        );
        assert_eq!(d.hash(&back, "text/html"), hash);
    }
}
