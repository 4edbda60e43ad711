//! Outbound payloads — what the routing core hands to a channel outbox.
//!
//! Every payload carries an idempotency key of the form
//! `<run_id>:<phase>[:<seq>]`; re-enqueueing the same key must not cause a
//! second observable send.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::inbound::Peer;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundContent {
    Text { text: String },
    Edit { message_id: String, text: String },
    Delete { message_id: String },
    File { files: Vec<SendFile> },
}

impl OutboundContent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Edit { .. } => "edit",
            Self::Delete { .. } => "delete",
            Self::File { .. } => "file",
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } | Self::Edit { text, .. } => Some(text),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reply markup
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

/// Inline keyboard attached to a message.  An empty markup clears any
/// existing keyboard on edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMarkup {
    pub rows: Vec<Vec<InlineButton>>,
}

impl ReplyMarkup {
    /// The cancel button whose callback the command bot resolves back to
    /// an abort of the named run.
    pub fn cancel_button(run_id: &str) -> Self {
        Self {
            rows: vec![vec![InlineButton {
                text: "Cancel".into(),
                callback_data: format!("lemon:cancel:{run_id}"),
            }]],
        }
    }

    /// Markup that removes the keyboard.
    pub fn cleared() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn is_cleared(&self) -> bool {
        self.rows.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadMeta {
    pub run_id: String,
    pub session_key: String,
    #[serde(rename = "final", skip_serializing_if = "std::ops::Not::not")]
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<ReplyMarkup>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub auto_send_generated: bool,
}

/// One outbound unit accepted by a channel outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub channel_id: String,
    pub account_id: String,
    pub peer: Peer,
    pub content: OutboundContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub idempotency_key: String,
    pub meta: PayloadMeta,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery acks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Transport acknowledgement for an `enqueue_with_notify` payload.  For a
/// fresh send, `message_id` is the transport-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub notify_ref: Uuid,
    pub ok: bool,
    #[serde(default)]
    pub message_id: Option<String>,
}
