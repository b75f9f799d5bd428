//! Rate-limit detection from unstructured backend output.

/// Lowercase substrings that mark a throttling or quota message.
pub const MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "429",
    "quota exceeded",
    "too many requests",
    "usage limit",
];

/// Whether `text` looks like a rate-limit or quota message. Case-insensitive.
pub fn detect(text: &str) -> bool {
    let lower = text.to_lowercase();
    MARKERS.iter().any(|marker| lower.contains(marker))
}
