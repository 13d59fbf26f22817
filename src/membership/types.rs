use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a partition-replica worker ("site").
///
/// The host id lives in the high 32 bits and the site's index on that host in the low
/// 32 bits, so ordering by `SiteId` groups sites of the same host together.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SiteId(pub i64);

impl SiteId {
    pub fn from_parts(host_id: u32, local_index: u32) -> Self {
        Self((((host_id as u64) << 32) | local_index as u64) as i64)
    }

    pub fn host_id(&self) -> u32 {
        ((self.0 as u64) >> 32) as u32
    }

    pub fn local_index(&self) -> u32 {
        (self.0 as u64 & 0xFFFF_FFFF) as u32
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_id(), self.local_index())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PeerState {
    Alive,
    Suspect,
}

/// Liveness record for a single peer.
///
/// `last_contact` is the sender-side timestamp (ms) of the newest heartbeat accepted;
/// older or repeated timestamps never move it backwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: SiteId,
    pub state: PeerState,
    pub last_contact: u64,
}

/// Event raised by the heartbeat monitor towards the agreement engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// A suspected peer was heard from again.
    Retracted(SiteId),
}
