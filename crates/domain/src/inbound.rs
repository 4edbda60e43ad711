//! Inbound channel contract — the normalized envelope that transports post,
//! plus the route tuple used for outbound addressing and fanout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Peer kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The fixed whitelist of peer kinds.  Unrecognized transport input is
/// normalized to [`PeerKind::Unknown`]; no new identifier ever enters a
/// global table from untrusted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    Dm,
    Group,
    Channel,
    Main,
    Unknown,
}

impl PeerKind {
    /// Exact, case-sensitive whitelist match.  Used when parsing structured
    /// session keys, where a mismatch is an error rather than `unknown`.
    pub fn parse_strict(s: &str) -> Result<Self, Error> {
        match s {
            "dm" => Ok(Self::Dm),
            "group" => Ok(Self::Group),
            "channel" => Ok(Self::Channel),
            "main" => Ok(Self::Main),
            "unknown" => Ok(Self::Unknown),
            other => Err(Error::InvalidSessionKey(format!(
                "invalid peer kind: {other}"
            ))),
        }
    }

    /// Lenient normalization for transport input: anything off the
    /// whitelist maps to `Unknown`.
    pub fn normalize(s: &str) -> Self {
        Self::parse_strict(s).unwrap_or(Self::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dm => "dm",
            Self::Group => "group",
            Self::Channel => "channel",
            Self::Main => "main",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for PeerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Who the message came from / goes to within a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub kind: PeerKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl Peer {
    pub fn dm(id: impl Into<String>) -> Self {
        Self {
            kind: PeerKind::Dm,
            id: id.into(),
            thread_id: None,
        }
    }
}

/// Display metadata about the human sender (logging only, never routing).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// The message body of an inbound envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub reply_to_id: Option<String>,
}

/// Normalized inbound envelope posted by a channel transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel_id: String,
    pub account_id: String,
    pub peer: Peer,
    #[serde(default)]
    pub sender: Option<SenderInfo>,
    pub message: MessageBody,
    /// The transport's raw event, untouched.
    #[serde(default)]
    pub raw: Value,
    #[serde(default)]
    pub meta: crate::job::RequestMeta,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A chat destination: where an outbound message lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub channel_id: String,
    pub account_id: String,
    pub peer_kind: PeerKind,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl Route {
    /// Stable identity used for fanout dedup.
    pub fn signature(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.channel_id,
            self.account_id,
            self.peer_kind,
            self.peer_id,
            self.thread_id.as_deref().unwrap_or("-")
        )
    }

    pub fn peer(&self) -> Peer {
        Peer {
            kind: self.peer_kind,
            id: self.peer_id.clone(),
            thread_id: self.thread_id.clone(),
        }
    }

    /// Parse a short fanout target.
    ///
    /// Accepted forms: `<channel>:<peer_id>` and
    /// `<channel>:<account>:<peer_id>`.  `tg` is an alias for `telegram`.
    /// The peer kind is always `dm`; group targets must go through a full
    /// session key.
    pub fn parse_target(s: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = s.split(':').collect();
        let (channel, account, peer) = match parts.as_slice() {
            [channel, peer] => (*channel, "default", *peer),
            [channel, account, peer] => (*channel, *account, *peer),
            _ => return Err(Error::InvalidFanoutTarget(s.to_string())),
        };
        if channel.is_empty() || peer.is_empty() {
            return Err(Error::InvalidFanoutTarget(s.to_string()));
        }
        let channel_id = if channel == "tg" { "telegram" } else { channel };
        Ok(Self {
            channel_id: channel_id.to_string(),
            account_id: account.to_string(),
            peer_kind: PeerKind::Dm,
            peer_id: peer.to_string(),
            thread_id: None,
        })
    }
}
