//! Quality gate for model output.
//!
//! Vision models under token pressure sometimes fall into a loop and emit
//! the same few lines until the output limit. The repetition check cuts the
//! text into three equal word blocks and compares neighbours with a
//! word-level normalized edit distance; looping output scores close to 1.0,
//! ordinary prose close to 0.

use crate::config::ExtractionConfig;
use sha2::{Digest, Sha256};
use strsim::generic_levenshtein;

/// Verdict on one block of returned text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Quality {
    Acceptable,
    TooShort { chars: usize },
    Repetitive { score: f64 },
}

/// Thresholds for [`QualityGate::assess`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    pub min_length: usize,
    pub repetition_threshold: f64,
    pub min_chars: usize,
    pub min_words: usize,
}

impl QualityGate {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self {
            min_length: config.min_ocr_length,
            repetition_threshold: config.repetition_threshold,
            min_chars: config.repetition_min_chars,
            min_words: config.repetition_min_words,
        }
    }

    /// Short check first, then repetition.
    pub fn assess(&self, text: &str) -> Quality {
        let chars = text.trim().chars().count();
        if chars < self.min_length {
            return Quality::TooShort { chars };
        }
        match self.repetition_score(text) {
            Some(score) if score > self.repetition_threshold => Quality::Repetitive { score },
            _ => Quality::Acceptable,
        }
    }

    /// Highest adjacent-block similarity, or `None` when the text is too
    /// small to judge.
    pub fn repetition_score(&self, text: &str) -> Option<f64> {
        let words: Vec<&str> = text.split_whitespace().collect();
        if text.chars().count() < self.min_chars || words.len() < self.min_words.max(3) {
            return None;
        }
        let block = words.len() / 3;
        let first = words[..block].to_vec();
        let second = words[block..2 * block].to_vec();
        let third = words[2 * block..3 * block].to_vec();
        Some(block_similarity(&first, &second).max(block_similarity(&second, &third)))
    }

    pub fn is_repetitive(&self, text: &str) -> bool {
        matches!(self.assess_repetition(text), Quality::Repetitive { .. })
    }

    /// Repetition only, ignoring the length floor.
    pub fn assess_repetition(&self, text: &str) -> Quality {
        match self.repetition_score(text) {
            Some(score) if score > self.repetition_threshold => Quality::Repetitive { score },
            _ => Quality::Acceptable,
        }
    }
}

/// `1 - distance / max_len` over words.
fn block_similarity(a: &Vec<&str>, b: &Vec<&str>) -> f64 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - generic_levenshtein(a, b) as f64 / longest as f64
}

/// SHA-256 of the case-folded, trimmed text, as lowercase hex.
pub fn fingerprint(text: &str) -> String {
    let normalized = text.trim().to_lowercase();
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}
