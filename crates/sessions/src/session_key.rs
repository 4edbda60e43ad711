//! Session key algebra — the structured identifiers that route prompts to
//! conversational threads.
//!
//! Canonical text forms:
//! - `agent:<agent_id>:main`
//! - `agent:<agent_id>:<channel_id>:<account_id>:<peer_kind>:<peer_id>`
//!   with optional `:thread:<thread_id>` and `:sub:<sub_id>` suffixes
//! - legacy `channel:telegram:<transport>:<chat_id>[:thread:<tid>]` is
//!   accepted on parse and normalized on format
//!
//! `parse(format(k)) == k` for every valid key.  Key atoms must not contain
//! `:`; the peer kind is checked against the fixed whitelist and a mismatch
//! is a parse error, never a new identifier.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lemon_domain::{Error, PeerKind, Route};

/// A parsed session key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKey {
    /// The agent's own main thread.
    Main { agent_id: String },
    /// A channel-scoped conversation with a peer.
    ChannelPeer {
        agent_id: String,
        channel_id: String,
        account_id: String,
        peer_kind: PeerKind,
        peer_id: String,
        thread_id: Option<String>,
        sub_id: Option<String>,
    },
}

impl SessionKey {
    pub fn main(agent_id: impl Into<String>) -> Self {
        Self::Main {
            agent_id: agent_id.into(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn channel_peer(
        agent_id: impl Into<String>,
        channel_id: impl Into<String>,
        account_id: impl Into<String>,
        peer_kind: PeerKind,
        peer_id: impl Into<String>,
        thread_id: Option<String>,
        sub_id: Option<String>,
    ) -> Self {
        Self::ChannelPeer {
            agent_id: agent_id.into(),
            channel_id: channel_id.into(),
            account_id: account_id.into(),
            peer_kind,
            peer_id: peer_id.into(),
            thread_id,
            sub_id,
        }
    }

    /// Parse a canonical or legacy key.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.first() {
            Some(&"agent") => Self::parse_agent(s, &parts),
            Some(&"channel") => Self::parse_legacy(s, &parts),
            _ => Err(Error::InvalidSessionKey(s.to_string())),
        }
    }

    fn parse_agent(s: &str, parts: &[&str]) -> Result<Self, Error> {
        if parts.len() < 3 || parts[1].is_empty() {
            return Err(Error::InvalidSessionKey(s.to_string()));
        }
        let agent_id = parts[1].to_string();

        if parts.len() == 3 && parts[2] == "main" {
            return Ok(Self::Main { agent_id });
        }
        if parts.len() < 6 {
            return Err(Error::InvalidSessionKey(s.to_string()));
        }

        let peer_kind = PeerKind::parse_strict(parts[4])?;
        let (channel_id, account_id, peer_id) = (parts[2], parts[3], parts[5]);
        if channel_id.is_empty() || account_id.is_empty() || peer_id.is_empty() {
            return Err(Error::InvalidSessionKey(s.to_string()));
        }

        let (thread_id, sub_id) = Self::parse_suffix(s, &parts[6..])?;
        Ok(Self::ChannelPeer {
            agent_id,
            channel_id: channel_id.to_string(),
            account_id: account_id.to_string(),
            peer_kind,
            peer_id: peer_id.to_string(),
            thread_id,
            sub_id,
        })
    }

    /// Trailing `thread:<t>` / `sub:<s>` pairs, in that order, each at
    /// most once.
    fn parse_suffix(
        s: &str,
        rest: &[&str],
    ) -> Result<(Option<String>, Option<String>), Error> {
        let mut thread_id = None;
        let mut sub_id = None;
        let mut i = 0;
        while i < rest.len() {
            match rest[i] {
                "thread" if thread_id.is_none() && sub_id.is_none() && i + 1 < rest.len() => {
                    thread_id = Some(rest[i + 1].to_string());
                    i += 2;
                }
                "sub" if sub_id.is_none() && i + 1 < rest.len() => {
                    sub_id = Some(rest[i + 1].to_string());
                    i += 2;
                }
                _ => return Err(Error::InvalidSessionKey(s.to_string())),
            }
        }
        Ok((thread_id, sub_id))
    }

    /// Legacy `channel:telegram:<transport>:<chat_id>[:thread:<tid>]`.
    fn parse_legacy(s: &str, parts: &[&str]) -> Result<Self, Error> {
        if parts.len() < 4 || parts[1] != "telegram" {
            return Err(Error::InvalidSessionKey(s.to_string()));
        }
        let (transport, chat_id) = (parts[2], parts[3]);
        if transport.is_empty() || chat_id.is_empty() {
            return Err(Error::InvalidSessionKey(s.to_string()));
        }
        let thread_id = match &parts[4..] {
            [] => None,
            ["thread", tid] => Some(tid.to_string()),
            _ => return Err(Error::InvalidSessionKey(s.to_string())),
        };
        Ok(Self::ChannelPeer {
            agent_id: "default".to_string(),
            channel_id: "telegram".to_string(),
            account_id: transport.to_string(),
            peer_kind: PeerKind::Dm,
            peer_id: chat_id.to_string(),
            thread_id,
            sub_id: None,
        })
    }

    pub fn is_valid(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    /// The agent a key belongs to, if the key parses.
    pub fn agent_of(s: &str) -> Option<String> {
        Self::parse(s).ok().map(|k| k.agent_id().to_string())
    }

    pub fn agent_id(&self) -> &str {
        match self {
            Self::Main { agent_id } | Self::ChannelPeer { agent_id, .. } => agent_id,
        }
    }

    /// The chat route a key addresses, for `ChannelPeer` keys.
    pub fn route(&self) -> Option<Route> {
        match self {
            Self::Main { .. } => None,
            Self::ChannelPeer {
                channel_id,
                account_id,
                peer_kind,
                peer_id,
                thread_id,
                ..
            } => Some(Route {
                channel_id: channel_id.clone(),
                account_id: account_id.clone(),
                peer_kind: *peer_kind,
                peer_id: peer_id.clone(),
                thread_id: thread_id.clone(),
            }),
        }
    }

    /// Build the key a route addresses for a given agent (no sub id).
    pub fn from_route(agent_id: &str, route: &Route) -> Self {
        Self::ChannelPeer {
            agent_id: agent_id.to_string(),
            channel_id: route.channel_id.clone(),
            account_id: route.account_id.clone(),
            peer_kind: route.peer_kind,
            peer_id: route.peer_id.clone(),
            thread_id: route.thread_id.clone(),
            sub_id: None,
        }
    }

    /// Fork a channel-peer key into a fresh sub-session.  Main keys fork
    /// to themselves (there is nothing to scope under).
    pub fn fork(&self) -> Self {
        match self {
            Self::Main { .. } => self.clone(),
            Self::ChannelPeer {
                agent_id,
                channel_id,
                account_id,
                peer_kind,
                peer_id,
                thread_id,
                ..
            } => Self::ChannelPeer {
                agent_id: agent_id.clone(),
                channel_id: channel_id.clone(),
                account_id: account_id.clone(),
                peer_kind: *peer_kind,
                peer_id: peer_id.clone(),
                thread_id: thread_id.clone(),
                sub_id: Some(fresh_sub_id()),
            },
        }
    }
}

fn fresh_sub_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[..8].to_string()
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Main { agent_id } => write!(f, "agent:{agent_id}:main"),
            Self::ChannelPeer {
                agent_id,
                channel_id,
                account_id,
                peer_kind,
                peer_id,
                thread_id,
                sub_id,
            } => {
                write!(
                    f,
                    "agent:{agent_id}:{channel_id}:{account_id}:{peer_kind}:{peer_id}"
                )?;
                if let Some(t) = thread_id {
                    write!(f, ":thread:{t}")?;
                }
                if let Some(s) = sub_id {
                    write!(f, ":sub:{s}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::str::FromStr for SessionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
