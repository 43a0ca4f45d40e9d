use std::collections::VecDeque;
use std::sync::Arc;

use arbor_core::tokens::TokenEstimator;

use crate::truncate::byte_index;

/// Prefix handed out by [`RollingBuffer::take_up_to`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TakeResult {
    pub text: String,
    pub chars: usize,
    pub tokens: u64,
    /// Even the first char did not fit the limit; it was returned anyway.
    pub budget_exceeded: bool,
}

/// One appended piece still (at least partly) pending.
#[derive(Clone, Copy, Debug)]
struct Piece {
    chars: usize,
    tokens: u64,
}

/// Pending document text plus an incrementally maintained token estimate.
///
/// Offsets are char offsets into the document. For a fixed-ratio estimator
/// the token count is derived from the char count and is always exact.
/// Otherwise the running total is the sum of per-piece estimates: appending
/// estimates only the new piece, and advancing drops whole consumed pieces
/// and re-estimates only the retained tail of a partly consumed head piece.
pub struct RollingBuffer {
    estimator: Arc<dyn TokenEstimator>,
    text: String,
    pieces: VecDeque<Piece>,
    char_len: usize,
    start_offset: usize,
    running_tokens: u64,
}

impl RollingBuffer {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self::starting_at(estimator, 0)
    }

    /// A buffer whose first char sits at document offset `start_offset`.
    pub fn starting_at(estimator: Arc<dyn TokenEstimator>, start_offset: usize) -> Self {
        Self {
            estimator,
            text: String::new(),
            pieces: VecDeque::new(),
            char_len: 0,
            start_offset,
            running_tokens: 0,
        }
    }

    pub fn append(&mut self, piece: &str) {
        if piece.is_empty() {
            return;
        }
        let entry = Piece {
            chars: piece.chars().count(),
            tokens: self.estimator.estimate(piece),
        };
        self.text.push_str(piece);
        self.running_tokens += entry.tokens;
        self.char_len += entry.chars;
        self.pieces.push_back(entry);
    }

    pub fn tokens_used(&self) -> u64 {
        match self.estimator.fixed_chars_per_token() {
            Some(ratio) => (self.char_len as u64).div_ceil(u64::from(ratio.max(1))),
            None => self.running_tokens,
        }
    }

    pub fn char_len(&self) -> usize {
        self.char_len
    }

    pub fn is_empty(&self) -> bool {
        self.char_len == 0
    }

    /// Document offset of the first pending char.
    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    /// Document offset one past the last pending char.
    pub fn end_offset(&self) -> usize {
        self.start_offset + self.char_len
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The first `chars` pending chars.
    pub fn prefix(&self, chars: usize) -> &str {
        &self.text[..byte_index(&self.text, chars)]
    }

    /// Longest prefix whose estimate fits `limit`. Never empty while text
    /// remains: if the first char alone is over budget it is returned with
    /// `budget_exceeded` set.
    pub fn take_up_to(&self, limit: u64) -> TakeResult {
        if self.is_empty() {
            return TakeResult {
                text: String::new(),
                chars: 0,
                tokens: 0,
                budget_exceeded: false,
            };
        }
        let mut chars = self.estimator.max_prefix_chars(&self.text, limit);
        let budget_exceeded = chars == 0;
        if budget_exceeded {
            chars = 1;
        }
        let text = self.prefix(chars).to_string();
        let tokens = self.estimator.estimate(&text);
        TakeResult {
            text,
            chars,
            tokens,
            budget_exceeded,
        }
    }

    /// Discard the first `chars` pending chars.
    pub fn advance(&mut self, chars: usize) {
        let chars = chars.min(self.char_len);
        if chars == 0 {
            return;
        }
        if chars == self.char_len {
            self.clear();
            return;
        }
        self.text.drain(..byte_index(&self.text, chars));
        self.char_len -= chars;
        self.start_offset += chars;

        let mut remaining = chars;
        while remaining > 0 {
            let Some(head) = self.pieces.front_mut() else {
                break;
            };
            if head.chars <= remaining {
                remaining -= head.chars;
                self.running_tokens -= head.tokens;
                self.pieces.pop_front();
                continue;
            }
            // The retained tail of the head piece now leads the text.
            let kept = head.chars - remaining;
            let tokens = self.estimator.estimate(&self.text[..byte_index(&self.text, kept)]);
            self.running_tokens = self.running_tokens - head.tokens + tokens;
            *head = Piece { chars: kept, tokens };
            remaining = 0;
        }
    }

    /// Discard everything pending.
    pub fn clear(&mut self) {
        self.start_offset += self.char_len;
        self.text.clear();
        self.pieces.clear();
        self.char_len = 0;
        self.running_tokens = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::tokens::CharRatioEstimator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn buffer(chars_per_token: u32) -> RollingBuffer {
        RollingBuffer::new(Arc::new(CharRatioEstimator::new(chars_per_token)))
    }

    /// Counts how many chars were ever estimated.
    struct CountingEstimator {
        seen: Arc<AtomicUsize>,
    }

    impl TokenEstimator for CountingEstimator {
        fn estimate(&self, text: &str) -> u64 {
            let n = text.chars().count();
            self.seen.fetch_add(n, Ordering::Relaxed);
            n as u64
        }
    }

    #[test]
    fn append_is_additive() {
        let est = CharRatioEstimator::new(4);
        let mut buf = buffer(4);
        buf.append("hello world");
        buf.append("and more text");
        assert_eq!(
            buf.tokens_used(),
            est.estimate("hello world") + est.estimate("and more text")
        );
        assert_eq!(buf.char_len(), 24);
    }

    #[test]
    fn append_never_rescans() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut buf = RollingBuffer::new(Arc::new(CountingEstimator { seen: seen.clone() }));
        let piece = "x".repeat(100);
        for _ in 0..50 {
            buf.append(&piece);
        }
        assert_eq!(seen.load(Ordering::Relaxed), 5_000);
        assert_eq!(buf.tokens_used(), 5_000);
    }

    #[test]
    fn take_up_to_respects_limit() {
        let mut buf = buffer(1);
        buf.append("abcdefghij");
        let take = buf.take_up_to(4);
        assert_eq!(take.text, "abcd");
        assert_eq!(take.chars, 4);
        assert_eq!(take.tokens, 4);
        assert!(!take.budget_exceeded);
        // Taking does not consume.
        assert_eq!(buf.char_len(), 10);
    }

    #[test]
    fn take_up_to_never_empty() {
        let mut buf = buffer(1);
        buf.append("abc");
        let take = buf.take_up_to(0);
        assert_eq!(take.text, "a");
        assert!(take.budget_exceeded);
    }

    #[test]
    fn take_from_empty_buffer() {
        let buf = buffer(1);
        let take = buf.take_up_to(10);
        assert!(take.text.is_empty());
        assert!(!take.budget_exceeded);
    }

    #[test]
    fn advance_moves_offsets() {
        let mut buf = buffer(1);
        buf.append("0123456789");
        buf.advance(4);
        assert_eq!(buf.as_str(), "456789");
        assert_eq!(buf.start_offset(), 4);
        assert_eq!(buf.end_offset(), 10);
        assert_eq!(buf.tokens_used(), 6);

        buf.advance(100);
        assert!(buf.is_empty());
        assert_eq!(buf.start_offset(), 10);
        assert_eq!(buf.tokens_used(), 0);
    }

    #[test]
    fn advance_only_estimates_head_piece() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut buf = RollingBuffer::new(Arc::new(CountingEstimator { seen: seen.clone() }));
        for _ in 0..10 {
            buf.append(&"y".repeat(100));
        }
        buf.advance(10);
        // 1000 on append, then only the 90 retained chars of the first piece.
        assert_eq!(seen.load(Ordering::Relaxed), 1_090);
        assert_eq!(buf.tokens_used(), 990);

        buf.advance(190);
        assert_eq!(seen.load(Ordering::Relaxed), 1_090);
        assert_eq!(buf.tokens_used(), 800);
    }

    #[test]
    fn running_estimate_survives_small_advances() {
        let est = CharRatioEstimator::new(4);
        let mut buf = buffer(4);
        buf.append(&"x".repeat(4_000));
        for _ in 0..600 {
            buf.advance(5);
            assert_eq!(buf.tokens_used(), est.estimate(buf.as_str()));
        }
        assert_eq!(buf.char_len(), 1_000);
        assert_eq!(buf.tokens_used(), 250);
    }

    #[test]
    fn running_estimate_tracks_interleaved_appends() {
        let est = CharRatioEstimator::new(4);
        let mut buf = buffer(4);
        for round in 0..200 {
            buf.append(&"ab".repeat(2 + 2 * (round % 5)));
            buf.advance(3 + round % 4);
            assert_eq!(buf.tokens_used(), est.estimate(buf.as_str()), "round {round}");
        }
        assert!(!buf.is_empty());
    }

    #[test]
    fn uneven_pieces_stay_exact_for_char_ratio() {
        let est = CharRatioEstimator::new(4);
        let mut buf = buffer(4);
        for round in 0..300 {
            buf.append(&"z".repeat(1 + round % 7));
            buf.advance(1 + round % 3);
            assert_eq!(buf.tokens_used(), est.estimate(buf.as_str()), "round {round}");
        }
    }

    /// Rounds every piece up to a whole 3-char token, like the char ratio
    /// estimator, but does not advertise a fixed ratio.
    struct PieceRounding;

    impl TokenEstimator for PieceRounding {
        fn estimate(&self, text: &str) -> u64 {
            (text.chars().count() as u64).div_ceil(3)
        }
    }

    #[test]
    fn piecewise_totals_never_undercount() {
        let mut buf = RollingBuffer::new(Arc::new(PieceRounding));
        for round in 0..300 {
            buf.append(&"z".repeat(1 + round % 7));
            buf.advance(1 + round % 3);
            let actual = PieceRounding.estimate(buf.as_str());
            assert!(buf.tokens_used() >= actual);
            assert!(buf.tokens_used() <= actual + buf.pieces.len() as u64);
        }
    }

    #[test]
    fn multibyte_offsets_are_chars() {
        let mut buf = buffer(1);
        buf.append("héllo wörld");
        assert_eq!(buf.char_len(), 11);
        assert_eq!(buf.prefix(5), "héllo");
        buf.advance(6);
        assert_eq!(buf.as_str(), "wörld");
        assert_eq!(buf.start_offset(), 6);
    }

    #[test]
    fn clear_keeps_document_position() {
        let mut buf = RollingBuffer::starting_at(Arc::new(CharRatioEstimator::new(1)), 100);
        buf.append("abc");
        buf.clear();
        assert_eq!(buf.start_offset(), 103);
        assert!(buf.is_empty());
    }
}
