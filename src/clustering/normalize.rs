//! Prompt canonicalization and the exact-match hash.

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Canonicalize a prompt for comparison.
///
/// Applies NFKC, lowercases, turns punctuation and symbols into separators
/// and collapses whitespace. Blank input yields an empty string.
pub fn normalize_prompt(prompt: &str) -> String {
    let mut result = String::with_capacity(prompt.len());
    let mut pending_space = false;

    for ch in prompt.nfkc().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            if pending_space && !result.is_empty() {
                result.push(' ');
            }
            pending_space = false;
            result.push(ch);
        } else {
            // Whitespace, punctuation, symbols and control characters all separate tokens.
            pending_space = true;
        }
    }

    result
}

/// Stable hex SHA-256 of an already normalized prompt.
pub fn prompt_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_case_and_whitespace() {
        assert_eq!(normalize_prompt("  A Cat\tSitting\n on  a MAT "), "a cat sitting on a mat");
    }

    #[test]
    fn test_normalize_punctuation() {
        assert_eq!(
            normalize_prompt("(masterpiece:1.2), best_quality!!"),
            "masterpiece 1 2 best quality"
        );
        assert_eq!(normalize_prompt("cat,dog"), normalize_prompt("cat, dog"));
    }

    #[test]
    fn test_normalize_blank() {
        assert_eq!(normalize_prompt(""), "");
        assert_eq!(normalize_prompt("   \n\t"), "");
        assert_eq!(normalize_prompt("...,,,"), "");
    }

    #[test]
    fn test_normalize_unicode_compat() {
        // Fullwidth letters fold to ASCII under NFKC.
        assert_eq!(normalize_prompt("ＣＡＴ"), "cat");
        assert_eq!(normalize_prompt("Café"), normalize_prompt("Cafe\u{301}"));
    }

    #[test]
    fn test_hash_is_stable() {
        let a = prompt_hash(&normalize_prompt("A cat, sitting."));
        let b = prompt_hash(&normalize_prompt("a cat sitting"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        // Known SHA-256 of the empty string, proving no salt is mixed in.
        assert_eq!(
            prompt_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(a, prompt_hash("a dog sitting"));
    }
}
