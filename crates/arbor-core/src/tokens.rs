//! Token estimation.
//!
//! Every estimator is pure and monotonic: `estimate(a + b) >= estimate(a)`.
//! The default is a character-ratio approximation; an exact BPE counter is
//! available behind the `tiktoken` feature.

/// Characters per token used by the default estimator.
pub const DEFAULT_CHARS_PER_TOKEN: u32 = 4;

pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;

    /// Largest number of leading chars of `text` whose estimate fits in
    /// `limit`. The default binary-searches over char positions.
    fn max_prefix_chars(&self, text: &str, limit: u64) -> usize {
        if text.is_empty() {
            return 0;
        }
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .skip(1)
            .chain(std::iter::once(text.len()))
            .collect();
        // boundaries[k] is the byte end of the first k + 1 chars.
        let (mut lo, mut hi) = (0usize, boundaries.len());
        while lo < hi {
            let mid = lo + (hi - lo).div_ceil(2);
            if self.estimate(&text[..boundaries[mid - 1]]) <= limit {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        lo
    }

    /// `Some(ratio)` when the estimate is exactly `ceil(chars / ratio)`, so
    /// callers tracking a char count can derive tokens without estimating.
    fn fixed_chars_per_token(&self) -> Option<u32> {
        None
    }
}

/// `ceil(chars / chars_per_token)`, counted over Unicode scalar values.
#[derive(Clone, Copy, Debug)]
pub struct CharRatioEstimator {
    chars_per_token: u32,
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: u32) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    pub fn chars_per_token(&self) -> u32 {
        self.chars_per_token
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> u64 {
        (text.chars().count() as u64).div_ceil(u64::from(self.chars_per_token))
    }

    fn max_prefix_chars(&self, text: &str, limit: u64) -> usize {
        let cap = limit.saturating_mul(u64::from(self.chars_per_token));
        let cap = usize::try_from(cap).unwrap_or(usize::MAX);
        text.chars().take(cap).count()
    }

    fn fixed_chars_per_token(&self) -> Option<u32> {
        Some(self.chars_per_token)
    }
}

#[cfg(feature = "tiktoken")]
pub use exact::TiktokenEstimator;

#[cfg(feature = "tiktoken")]
mod exact {
    use super::TokenEstimator;

    /// Exact BPE token counts.
    pub struct TiktokenEstimator {
        bpe: tiktoken_rs::CoreBPE,
    }

    impl TiktokenEstimator {
        pub fn cl100k() -> Result<Self, String> {
            tiktoken_rs::cl100k_base()
                .map(|bpe| Self { bpe })
                .map_err(|e| format!("load cl100k_base: {e}"))
        }

        pub fn o200k() -> Result<Self, String> {
            tiktoken_rs::o200k_base()
                .map(|bpe| Self { bpe })
                .map_err(|e| format!("load o200k_base: {e}"))
        }
    }

    impl TokenEstimator for TiktokenEstimator {
        fn estimate(&self, text: &str) -> u64 {
            self.bpe.encode_ordinary(text).len() as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(CharRatioEstimator::default().estimate(""), 0);
    }

    #[test]
    fn rounds_up() {
        let est = CharRatioEstimator::default();
        assert_eq!(est.estimate("a"), 1);
        assert_eq!(est.estimate("abcd"), 1);
        assert_eq!(est.estimate("abcde"), 2);
    }

    #[test]
    fn counts_chars_not_bytes() {
        let est = CharRatioEstimator::new(1);
        assert_eq!(est.estimate("héllo"), 5);
        assert_eq!(est.estimate("日本語"), 3);
    }

    #[test]
    fn zero_ratio_is_clamped() {
        let est = CharRatioEstimator::new(0);
        assert_eq!(est.chars_per_token(), 1);
        assert_eq!(est.estimate("abc"), 3);
    }

    #[test]
    fn max_prefix_chars_fast_path() {
        let est = CharRatioEstimator::new(4);
        assert_eq!(est.max_prefix_chars("abcdefghij", 2), 8);
        assert_eq!(est.max_prefix_chars("abc", 2), 3);
        assert_eq!(est.max_prefix_chars("abc", 0), 0);
    }

    struct WordEstimator;

    impl TokenEstimator for WordEstimator {
        fn estimate(&self, text: &str) -> u64 {
            text.split_whitespace().count() as u64
        }
    }

    #[test]
    fn default_max_prefix_uses_binary_search() {
        let est = WordEstimator;
        let text = "one two three four";
        let n = est.max_prefix_chars(text, 2);
        assert!(est.estimate(&text[..n]) <= 2);
        assert!(est.estimate(&text[..(n + 1).min(text.len())]) > 2);
    }

    #[test]
    fn only_char_ratio_advertises_fixed_ratio() {
        assert_eq!(CharRatioEstimator::new(3).fixed_chars_per_token(), Some(3));
        assert_eq!(CharRatioEstimator::new(0).fixed_chars_per_token(), Some(1));
        assert_eq!(WordEstimator.fixed_chars_per_token(), None);
    }

    proptest! {
        #[test]
        fn estimate_is_monotonic(a in ".{0,64}", b in ".{0,64}") {
            let est = CharRatioEstimator::default();
            let joined = format!("{a}{b}");
            prop_assert!(est.estimate(&joined) >= est.estimate(&a).max(est.estimate(&b)));
        }

        #[test]
        fn estimate_is_stable(a in ".{0,64}") {
            let est = CharRatioEstimator::default();
            prop_assert_eq!(est.estimate(&a), est.estimate(&a));
        }
    }
}
