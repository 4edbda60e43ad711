//! Output coalescers: per-(session, channel) actors that rate-limit the
//! stream of deltas and tool actions into a small number of outbound
//! messages.

pub mod render;
pub mod status;
pub mod stream;

pub use status::StatusCoalescers;
pub use stream::StreamCoalescers;

use crate::adapter::CoalescerMeta;
use lemon_domain::Peer;

/// Resolve the outbound addressing a coalescer needs.  Runs without a
/// channel peer have nothing to address and skip emission.
pub(crate) fn stream_addressing(meta: &CoalescerMeta) -> Option<(String, Peer)> {
    let peer = meta.peer.clone()?;
    let account = meta
        .account_id
        .clone()
        .unwrap_or_else(|| "default".to_owned());
    Some((account, peer))
}
