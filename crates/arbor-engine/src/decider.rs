//! Boundary decisions: ask the fast model where a chunk should end, validate
//! the answer, and fall back to a deterministic cut when it is unusable.

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use arbor_core::errors::GatewayError;
use arbor_core::provider::{CallOptions, CompletionRequest, LlmProvider};
use arbor_core::tokens::TokenEstimator;
use arbor_core::tree::{BoundaryDecision, DecisionSource};
use arbor_settings::IndexConfig;

use crate::error::EngineError;
use crate::prompts;
use crate::retry::complete_with_policy;

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());

static FENCED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").unwrap());

const DECISION_MAX_TOKENS: u32 = 256;

/// Why a model decision was not used.
#[derive(Clone, Debug)]
pub enum Rejection {
    Malformed(String),
    MissingField(&'static str),
    CutOutOfRange { cut: i64, window: usize },
    NextOutOfRange { next: i64, cut: i64 },
    NoProgress,
    Timeout(Duration),
    CallFailed(GatewayError),
}

impl Rejection {
    /// The external call itself failed, as opposed to answering badly.
    pub fn is_call_failure(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::CallFailed(_))
    }

    fn is_final(&self) -> bool {
        matches!(self, Self::CallFailed(e) if e.is_fatal())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::MissingField(_) => "missing_field",
            Self::CutOutOfRange { .. } => "cut_out_of_range",
            Self::NextOutOfRange { .. } => "next_out_of_range",
            Self::NoProgress => "no_progress",
            Self::Timeout(_) => "timeout",
            Self::CallFailed(_) => "call_failed",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(detail) => write!(f, "malformed response: {detail}"),
            Self::MissingField(field) => write!(f, "missing field {field}"),
            Self::CutOutOfRange { cut, window } => {
                write!(f, "cut_index {cut} outside 1..={window}")
            }
            Self::NextOutOfRange { next, cut } => {
                write!(f, "next_chunk_start_index {next} outside 0..={cut}")
            }
            Self::NoProgress => f.write_str("next_chunk_start_index 0 makes no progress"),
            Self::Timeout(d) => write!(f, "decision timed out after {}ms", d.as_millis()),
            Self::CallFailed(e) => write!(f, "decision call failed: {e}"),
        }
    }
}

/// A usable decision and where it came from.
#[derive(Clone, Debug)]
pub struct DecisionOutcome {
    pub decision: BoundaryDecision,
    pub source: DecisionSource,
    pub rejection: Option<Rejection>,
}

/// Deterministic cut used whenever the model's answer is rejected.
#[derive(Clone, Debug)]
pub struct FallbackPolicy {
    pub target_chunk_tokens: u64,
    pub overlap_chars: usize,
    pub max_scan_chars: usize,
}

impl FallbackPolicy {
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            target_chunk_tokens: config.target_chunk_tokens,
            overlap_chars: config.fallback_overlap_chars,
            max_scan_chars: config.max_sentence_scan_chars,
        }
    }

    /// Cut near `target_chunk_tokens`, preferring a paragraph, sentence or
    /// word boundary, and overlap back to the previous sentence start.
    /// Always returns `1 <= next <= cut <= window length` for a non-empty
    /// window.
    pub fn decide(&self, window: &str, estimator: &dyn TokenEstimator) -> BoundaryDecision {
        let chars: Vec<char> = window.chars().collect();
        let len = chars.len();
        if len == 0 {
            return BoundaryDecision {
                cut_index: 0,
                next_chunk_start_index: 0,
                reasoning: "empty window".into(),
            };
        }

        let greedy = estimator
            .max_prefix_chars(window, self.target_chunk_tokens)
            .clamp(1, len);
        let (cut, cut_kind) = if greedy < len {
            self.pull_back(&chars, greedy)
        } else {
            (greedy, "end of window")
        };

        let max_overlap = self.overlap_chars.min(cut / 2);
        let (next, overlap_kind) = match sentence_start_before(&chars, cut, max_overlap) {
            Some(start) => (start, "last sentence"),
            None => (cut - max_overlap, "fixed overlap"),
        };

        BoundaryDecision {
            cut_index: cut,
            next_chunk_start_index: next,
            reasoning: format!("token-budget cut at {cut_kind}, {overlap_kind} overlap"),
        }
    }

    /// Move a greedy cut back to the best boundary within the scan range.
    /// The cut never moves below half its greedy position.
    fn pull_back(&self, chars: &[char], greedy: usize) -> (usize, &'static str) {
        let floor = (greedy / 2).max(greedy.saturating_sub(self.max_scan_chars));
        let candidates = || (floor + 1..=greedy).rev();

        if let Some(p) = candidates().find(|&p| is_paragraph_end(chars, p)) {
            return (p, "paragraph boundary");
        }
        if let Some(p) = candidates().find(|&p| is_sentence_end(chars, p)) {
            return (p, "sentence boundary");
        }
        if let Some(p) = candidates().find(|&p| chars[p - 1].is_whitespace()) {
            return (p, "word boundary");
        }
        (greedy, "token limit")
    }
}

fn is_paragraph_end(chars: &[char], p: usize) -> bool {
    p >= 2 && chars[p - 1] == '\n' && chars[p - 2] == '\n'
}

/// Position `p` directly follows sentence-ending punctuation and its
/// whitespace, or a newline.
fn is_sentence_end(chars: &[char], p: usize) -> bool {
    if p == 0 {
        return false;
    }
    if chars[p - 1] == '\n' {
        return true;
    }
    p >= 2 && chars[p - 1].is_whitespace() && matches!(chars[p - 2], '.' | '!' | '?')
}

/// Latest sentence start strictly before `cut` and at most `max_overlap`
/// chars back.
fn sentence_start_before(chars: &[char], cut: usize, max_overlap: usize) -> Option<usize> {
    if max_overlap == 0 {
        return None;
    }
    let lowest = cut.saturating_sub(max_overlap).max(1);
    (lowest..cut).rev().find(|&p| is_sentence_end(chars, p))
}

/// Pull the decision object out of a model reply. Tolerates reasoning
/// blocks, code fences and prose around the object.
pub fn extract_json(raw: &str) -> Option<Value> {
    let cleaned = THINK_BLOCK.replace_all(raw, "");
    let body = match FENCED.captures(&cleaned) {
        Some(caps) => caps.get(1).map_or("", |m| m.as_str()).to_string(),
        None => cleaned.trim().to_string(),
    };
    if let Ok(value) = serde_json::from_str::<Value>(body.trim()) {
        if value.is_object() {
            return Some(value);
        }
    }
    first_object(&body).and_then(|obj| serde_json::from_str(obj).ok())
}

/// First balanced `{...}` in `text`, skipping braces inside strings.
fn first_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn int_field(obj: &Value, field: &'static str) -> Result<i64, Rejection> {
    let value = obj.get(field).ok_or(Rejection::MissingField(field))?;
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => Ok(f as i64),
        _ => Err(Rejection::Malformed(format!("{field} is not an integer: {value}"))),
    }
}

/// Parse and validate a reply against a window of `window_chars` chars.
pub fn parse_decision(raw: &str, window_chars: usize) -> Result<BoundaryDecision, Rejection> {
    let obj = extract_json(raw).ok_or_else(|| {
        Rejection::Malformed(format!("no JSON object in {} chars of output", raw.chars().count()))
    })?;
    let cut = int_field(&obj, "cut_index")?;
    let next = int_field(&obj, "next_chunk_start_index")?;
    let reasoning = obj
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if cut <= 0 || cut as u64 > window_chars as u64 {
        return Err(Rejection::CutOutOfRange { cut, window: window_chars });
    }
    if next < 0 || next > cut {
        return Err(Rejection::NextOutOfRange { next, cut });
    }
    if next == 0 {
        return Err(Rejection::NoProgress);
    }
    Ok(BoundaryDecision {
        cut_index: cut as usize,
        next_chunk_start_index: next as usize,
        reasoning,
    })
}

/// Request/validate/fallback protocol around the fast model.
pub struct BoundaryDecider {
    provider: Arc<dyn LlmProvider>,
    estimator: Arc<dyn TokenEstimator>,
    policy: FallbackPolicy,
    options: CallOptions,
    retries: u32,
}

impl BoundaryDecider {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        estimator: Arc<dyn TokenEstimator>,
        config: &IndexConfig,
    ) -> Self {
        Self {
            provider,
            estimator,
            policy: FallbackPolicy::from_config(config),
            options: CallOptions {
                timeout: config.decision_timeout(),
                retries: 0,
                backoff: config.summary_backoff(),
            },
            retries: config.decision_retries,
        }
    }

    pub fn fallback(&self, window: &str) -> BoundaryDecision {
        self.policy.decide(window, self.estimator.as_ref())
    }

    /// Decide where the chunk starting at the window's first char ends.
    /// Only cancellation is an error; every other failure yields the
    /// fallback decision.
    #[instrument(skip(self, window, cancel), fields(window_chars))]
    pub async fn decide(
        &self,
        window: &str,
        cancel: &CancellationToken,
    ) -> Result<DecisionOutcome, EngineError> {
        let window_chars = window.chars().count();
        tracing::Span::current().record("window_chars", window_chars);
        if window_chars == 0 {
            return Err(EngineError::Internal("decision requested for an empty window".into()));
        }

        let target_chars = self
            .estimator
            .max_prefix_chars(window, self.policy.target_chunk_tokens)
            .max(1);
        let request = CompletionRequest::new(prompts::decision_prompt(window, window_chars, target_chars))
            .with_system(prompts::DECISION_SYSTEM)
            .with_max_tokens(DECISION_MAX_TOKENS)
            .with_temperature(0.0)
            .json();

        let mut attempt = 0;
        let rejection = loop {
            match self.ask(&request, window_chars, cancel).await? {
                Ok(decision) => {
                    return Ok(DecisionOutcome {
                        decision,
                        source: DecisionSource::Model,
                        rejection: None,
                    })
                }
                Err(r) if attempt < self.retries && !r.is_final() => {
                    debug!(attempt = attempt + 1, reason = %r, "decision rejected, asking again");
                    attempt += 1;
                }
                Err(r) => break r,
            }
        };

        debug!(reason = %rejection, "using fallback decision");
        Ok(DecisionOutcome {
            decision: self.fallback(window),
            source: DecisionSource::Fallback,
            rejection: Some(rejection),
        })
    }

    async fn ask(
        &self,
        request: &CompletionRequest,
        window_chars: usize,
        cancel: &CancellationToken,
    ) -> Result<Result<BoundaryDecision, Rejection>, EngineError> {
        match complete_with_policy(self.provider.as_ref(), request, &self.options, cancel).await {
            Ok(raw) => Ok(parse_decision(&raw, window_chars)),
            Err(GatewayError::Cancelled) => Err(EngineError::Cancelled),
            Err(GatewayError::Timeout(d)) => Ok(Err(Rejection::Timeout(d))),
            Err(e) => Ok(Err(Rejection::CallFailed(e))),
        }
    }
}
