//! Context-window bookkeeping: overflow detection on failed completions
//! and the preemptive near-limit threshold on successful ones.

use lemon_domain::config::CompactionConfig;

const OVERFLOW_NEEDLES: &[&str] = &[
    "context_length_exceeded",
    "context length exceeded",
    "context window",
];

/// Whether an opaque completion error is a context-window overflow.
pub fn is_context_overflow(error_text: &str) -> bool {
    let lowered = error_text.to_lowercase();
    OVERFLOW_NEEDLES.iter().any(|n| lowered.contains(n))
}

/// Tokens of input usage at which a chat is marked pending compaction:
/// `min(window - reserve, window * ratio)`.
pub fn compaction_threshold(context_window: u64, cfg: &CompactionConfig) -> u64 {
    let reserved = context_window.saturating_sub(cfg.reserve_tokens);
    let ratio = (context_window as f64 * cfg.trigger_ratio) as u64;
    reserved.min(ratio)
}
