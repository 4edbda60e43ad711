//! Tool-status rendering — a pure function from action records to the
//! editable status text.

use lemon_domain::event::{ActionKind, ActionRecord};
use lemon_domain::truncate_str;

use crate::adapter::ChannelAdapter;

const COMMAND_PREVIEW_CHARS: usize = 80;

/// Render the status message body for a window of actions.
///
/// ```text
/// Tool calls:
/// - (3 tools omitted)
/// - [running] Search: docs
/// - [ok] Read: foo.txt -> ok
/// ```
pub fn render_status(
    actions: &[&ActionRecord],
    omitted: usize,
    adapter: &dyn ChannelAdapter,
) -> String {
    let mut out = String::from("Tool calls:\n");
    let mut lines = Vec::with_capacity(actions.len() + 1);
    if omitted > 0 {
        lines.push(format!("- ({omitted} tools omitted)"));
    }
    for action in actions {
        let extra = adapter.format_action_extra(action);
        let line = if action.is_running() {
            format!("- [running] {}{extra}", action.title)
        } else {
            let mark = if action.ok.unwrap_or(true) { "ok" } else { "err" };
            let preview = action
                .detail
                .result_preview
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(|p| format!(" -> {p}"))
                .unwrap_or_default();
            format!("- [{mark}] {}{extra}{preview}", action.title)
        };
        lines.push(line);
    }
    out.push_str(&lines.join("\n"));
    out
}

/// Telegram's per-action decoration: subagent actions carry engine/role/
/// async annotations, command actions carry status/exit and the command
/// line.
pub fn telegram_action_extra(action: &ActionRecord) -> String {
    match action.kind {
        ActionKind::Subagent => {
            let mut parts = Vec::new();
            if let Some(engine) = action.detail.engine.as_deref() {
                parts.push(format!("engine={engine}"));
            }
            if let Some(role) = action.detail.role.as_deref() {
                parts.push(format!("role={role}"));
            }
            if let Some(via) = action.detail.async_via.as_deref() {
                parts.push(format!("async via={via}"));
            }
            if parts.is_empty() {
                String::new()
            } else {
                format!(" ({})", parts.join(" "))
            }
        }
        ActionKind::Command => {
            let mut out = String::new();
            let mut parts = Vec::new();
            if let Some(status) = action.detail.status.as_deref() {
                parts.push(format!("status={status}"));
            }
            if let Some(exit) = action.detail.exit_code {
                parts.push(format!("exit={exit}"));
            }
            if !parts.is_empty() {
                out.push_str(&format!(" ({})", parts.join(" ")));
            }
            if let Some(cmd) = action.detail.command.as_deref() {
                out.push_str(&format!(
                    " cmd: \"{}\"",
                    truncate_str(cmd, COMMAND_PREVIEW_CHARS)
                ));
            }
            out
        }
        _ => String::new(),
    }
}
