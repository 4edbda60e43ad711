//! Runtime tuning knobs for the routing core.
//!
//! Every section deserializes with per-field defaults so a partial config
//! file (or none at all) yields a fully working configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub coalescer: CoalescerConfig,
    pub runs: RunsConfig,
    pub approvals: ApprovalsConfig,
    pub compaction: CompactionConfig,
    pub telegram: TelegramConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Coalescers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Time-and-size bounds for the stream and tool-status coalescers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalescerConfig {
    /// Flush as soon as this many buffered characters accumulate.
    #[serde(default = "d_min_chars")]
    pub min_chars: usize,
    /// Flush after this long without a new delta.
    #[serde(default = "d_idle_ms")]
    pub idle_ms: u64,
    /// Hard latency bound: flush once the pending buffer is this old.
    #[serde(default = "d_max_latency_ms")]
    pub max_latency_ms: u64,
    /// Cap on the accumulated full text (tail kept).
    #[serde(default = "d_full_text_cap")]
    pub full_text_cap: usize,
    /// Tool-status action window: oldest actions beyond this are dropped.
    #[serde(default = "d_max_actions")]
    pub max_actions: usize,
    /// Coalescer actors exit after this long idle once finalized.
    #[serde(default = "d_teardown_idle_ms")]
    pub teardown_idle_ms: u64,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            min_chars: d_min_chars(),
            idle_ms: d_idle_ms(),
            max_latency_ms: d_max_latency_ms(),
            full_text_cap: d_full_text_cap(),
            max_actions: d_max_actions(),
            teardown_idle_ms: d_teardown_idle_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run admission and run-process timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    /// Maximum concurrent run processes. `0` = unlimited.
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent: usize,
    /// Gateway submit retry: first backoff.
    #[serde(default = "d_submit_backoff_ms")]
    pub submit_backoff_ms: u64,
    /// Gateway submit retry: backoff cap.
    #[serde(default = "d_submit_backoff_cap_ms")]
    pub submit_backoff_cap_ms: u64,
    /// Gateway submit retry: attempts before the run is failed.
    #[serde(default = "d_submit_max_attempts")]
    pub submit_max_attempts: u32,
    /// Session-slot registration retry: first delay.
    #[serde(default = "d_register_retry_ms")]
    pub register_retry_ms: u64,
    /// Session-slot registration retry: delay cap.
    #[serde(default = "d_register_retry_cap_ms")]
    pub register_retry_cap_ms: u64,
    /// Grace before synthesizing completion after a clean gateway exit.
    #[serde(default = "d_down_grace_ms")]
    pub down_grace_ms: u64,
    /// Grace before synthesizing completion after an abnormal gateway exit.
    #[serde(default = "d_down_grace_abnormal_ms")]
    pub down_grace_abnormal_ms: u64,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: d_max_concurrent(),
            submit_backoff_ms: d_submit_backoff_ms(),
            submit_backoff_cap_ms: d_submit_backoff_cap_ms(),
            submit_max_attempts: d_submit_max_attempts(),
            register_retry_ms: d_register_retry_ms(),
            register_retry_cap_ms: d_register_retry_cap_ms(),
            down_grace_ms: d_down_grace_ms(),
            down_grace_abnormal_ms: d_down_grace_abnormal_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approvals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalsConfig {
    /// Absolute timeout for a pending approval request.
    #[serde(default = "d_expires_in_ms")]
    pub expires_in_ms: u64,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            expires_in_ms: d_expires_in_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Preemptive-compaction thresholds.  A successful completion whose usage
/// crosses `min(window - reserve, window * ratio)` marks the chat as
/// pending compaction before the next prompt overflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "d_reserve_tokens")]
    pub reserve_tokens: u64,
    #[serde(default = "d_trigger_ratio")]
    pub trigger_ratio: f64,
    /// Per-model context-window overrides (tokens).
    #[serde(default)]
    pub context_windows: HashMap<String, u64>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            reserve_tokens: d_reserve_tokens(),
            trigger_ratio: d_trigger_ratio(),
            context_windows: HashMap::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Telegram
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Append a resume-token footer to final answers.
    #[serde(default = "d_true")]
    pub resume_footer: bool,
    /// Resume-index cleanup retries: attempt cap.
    #[serde(default = "d_resume_retry_attempts")]
    pub resume_retry_attempts: u32,
    /// Resume-index cleanup retries: first backoff.
    #[serde(default = "d_resume_retry_base_ms")]
    pub resume_retry_base_ms: u64,
    /// Resume-index cleanup retries: backoff cap.
    #[serde(default = "d_resume_retry_cap_ms")]
    pub resume_retry_cap_ms: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            resume_footer: true,
            resume_retry_attempts: d_resume_retry_attempts(),
            resume_retry_base_ms: d_resume_retry_base_ms(),
            resume_retry_cap_ms: d_resume_retry_cap_ms(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_min_chars() -> usize {
    48
}
fn d_idle_ms() -> u64 {
    400
}
fn d_max_latency_ms() -> u64 {
    1200
}
fn d_full_text_cap() -> usize {
    100_000
}
fn d_max_actions() -> usize {
    40
}
fn d_teardown_idle_ms() -> u64 {
    30_000
}
fn d_max_concurrent() -> usize {
    500
}
fn d_submit_backoff_ms() -> u64 {
    100
}
fn d_submit_backoff_cap_ms() -> u64 {
    2000
}
fn d_submit_max_attempts() -> u32 {
    20
}
fn d_register_retry_ms() -> u64 {
    25
}
fn d_register_retry_cap_ms() -> u64 {
    250
}
fn d_down_grace_ms() -> u64 {
    200
}
fn d_down_grace_abnormal_ms() -> u64 {
    20
}
fn d_expires_in_ms() -> u64 {
    300_000
}
fn d_reserve_tokens() -> u64 {
    20_000
}
fn d_trigger_ratio() -> f64 {
    0.85
}
fn d_resume_retry_attempts() -> u32 {
    4
}
fn d_resume_retry_base_ms() -> u64 {
    2_000
}
fn d_resume_retry_cap_ms() -> u64 {
    30_000
}
