//! Tool-status lifecycle through the run process: status message create,
//! edit convergence, cancel-button removal, and the no-synthetic-answer
//! invariant.

mod common;

use common::{default_world, settle, settle_long, telegram_inbound};

use lemon_domain::event::{
    ActionDetail, ActionKind, ActionPhase, ActionRecord, GatewayEvent,
};
use lemon_domain::outbound::OutboundContent;

fn action_event(run_id: &str, action: ActionRecord) -> GatewayEvent {
    GatewayEvent::EngineAction {
        run_id: run_id.to_owned(),
        action,
    }
}

fn tool_action(id: &str, title: &str, phase: ActionPhase) -> ActionRecord {
    ActionRecord {
        id: id.into(),
        kind: ActionKind::Tool,
        title: title.into(),
        phase,
        ok: None,
        detail: ActionDetail::default(),
        caller_engine: None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 3 — tool-status lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn status_message_lifecycle_with_cancel_button() {
    let world = default_world();
    world
        .router
        .handle_inbound(telegram_inbound("agent-x", "42", "u1", "read a file"))
        .await;
    settle().await;
    let job = world.gateway.submitted().pop().unwrap();
    let run_id = job.run_id.clone();

    world.gateway.emit_started(&run_id);
    world.gateway.emit(action_event(
        &run_id,
        tool_action("a1", "Read: foo.txt", ActionPhase::Started),
    ));
    settle_long().await;

    let mut done = tool_action("a1", "Read: foo.txt", ActionPhase::Completed);
    done.ok = Some(true);
    done.detail.result_preview = Some("ok".into());
    world.gateway.emit(action_event(&run_id, done));
    settle_long().await;

    world.gateway.emit_completed(&run_id, true, "done reading");
    settle_long().await;

    let status: Vec<_> = world
        .outbox
        .sent_for_run(&run_id)
        .into_iter()
        .filter(|p| p.idempotency_key.contains(":status:"))
        .collect();
    assert!(status.len() >= 2, "create + edits, got {status:#?}");

    // The first status payload creates the message with the cancel button.
    match &status[0].content {
        OutboundContent::Text { text } => {
            assert!(text.contains("- [running] Read: foo.txt"), "text: {text}");
        }
        other => panic!("expected create, got {other:?}"),
    }
    let markup = status[0].meta.reply_markup.as_ref().unwrap();
    assert_eq!(
        markup.rows[0][0].callback_data,
        format!("lemon:cancel:{run_id}")
    );

    // The completion edit converges on the final line.
    let completed_edit = status
        .iter()
        .find(|p| {
            p.content
                .text()
                .is_some_and(|t| t.contains("- [ok] Read: foo.txt -> ok"))
        })
        .expect("completed line rendered");
    assert!(matches!(
        completed_edit.content,
        OutboundContent::Edit { .. }
    ));

    // The final status payload clears the keyboard.
    let last = status.last().unwrap();
    let last_markup = last.meta.reply_markup.as_ref().unwrap();
    assert!(last_markup.is_cleared(), "cancel button removed on finalize");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Synthetic-answer rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn completion_without_deltas_sends_answer_once() {
    let world = default_world();
    world
        .router
        .handle_inbound(telegram_inbound("agent-x", "42", "u1", "quick question"))
        .await;
    settle().await;
    let job = world.gateway.submitted().pop().unwrap();

    world.gateway.emit_started(&job.run_id);
    world.gateway.emit_completed(&job.run_id, true, "Short answer.");
    settle_long().await;

    let answers: Vec<_> = world
        .outbox
        .sent_for_run(&job.run_id)
        .into_iter()
        .filter(|p| !p.idempotency_key.contains(":status:"))
        .collect();
    assert_eq!(answers.len(), 1, "payloads: {answers:#?}");
    assert_eq!(answers[0].content.text(), Some("Short answer."));
    assert_eq!(answers[0].reply_to.as_deref(), Some("u1"));
    assert_eq!(
        answers[0].idempotency_key,
        format!("{}:final:send", job.run_id)
    );
}

#[tokio::test(start_paused = true)]
async fn streamed_run_never_duplicates_answer_as_final_send() {
    let world = default_world();
    world
        .router
        .handle_inbound(telegram_inbound("agent-x", "42", "u1", "stream it"))
        .await;
    settle().await;
    let job = world.gateway.submitted().pop().unwrap();

    world.gateway.emit_started(&job.run_id);
    world.gateway.emit_delta(&job.run_id, 1, "All of it.");
    settle_long().await;
    world.gateway.emit_completed(&job.run_id, true, "All of it.");
    settle_long().await;

    let sent = world.outbox.sent_for_run(&job.run_id);
    // One create from streaming; the finalize converges without a second
    // send (the text already matches).
    let texts: Vec<_> = sent
        .iter()
        .filter(|p| matches!(p.content, OutboundContent::Text { .. }))
        .collect();
    assert_eq!(texts.len(), 1);
    let finals = sent
        .iter()
        .filter(|p| p.idempotency_key == format!("{}:final:send", job.run_id))
        .count();
    assert!(finals <= 1);
}
