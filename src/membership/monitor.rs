use std::collections::BTreeMap;
use std::time::Duration;

use super::types::{HeartbeatEvent, Peer, PeerState, SiteId};

/// Per-peer liveness tracking for one site.
///
/// Time is passed in explicitly (milliseconds) so the owner decides which clock drives it.
/// The monitor never touches the network; it only classifies what it was told.
pub struct HeartbeatMonitor {
    local: SiteId,
    suspect_timeout: Duration,
    peers: BTreeMap<SiteId, PeerEntry>,
}

struct PeerEntry {
    peer: Peer,
    // Local receive time of the last accepted heartbeat; drives the timeout.
    last_seen: u64,
}

impl HeartbeatMonitor {
    pub fn new(local: SiteId, suspect_timeout: Duration) -> Self {
        Self {
            local,
            suspect_timeout,
            peers: BTreeMap::new(),
        }
    }

    /// Starts tracking `site`. A freshly added peer gets a full timeout of grace.
    pub fn add_peer(&mut self, site: SiteId, now: u64) {
        if site == self.local {
            return;
        }
        self.peers.entry(site).or_insert_with(|| PeerEntry {
            peer: Peer {
                id: site,
                state: PeerState::Alive,
                last_contact: 0,
            },
            last_seen: now,
        });
    }

    pub fn remove_peer(&mut self, site: SiteId) {
        if self.peers.remove(&site).is_some() {
            tracing::debug!("Stopped tracking heartbeats from {}", site);
        }
    }

    /// Records a heartbeat sent by `site` at `sent_at` and received at `now`.
    ///
    /// Returns a retraction when the peer had been suspected.
    pub fn on_heartbeat(&mut self, site: SiteId, sent_at: u64, now: u64) -> Option<HeartbeatEvent> {
        let Some(entry) = self.peers.get_mut(&site) else {
            tracing::debug!("Heartbeat from untracked site {}", site);
            return None;
        };

        if sent_at <= entry.peer.last_contact {
            tracing::trace!(
                "Ignoring stale heartbeat from {} ({} <= {})",
                site,
                sent_at,
                entry.peer.last_contact
            );
            return None;
        }

        entry.peer.last_contact = sent_at;
        entry.last_seen = now;

        if entry.peer.state == PeerState::Suspect {
            entry.peer.state = PeerState::Alive;
            tracing::info!("Site {} refuted suspicion", site);
            return Some(HeartbeatEvent::Retracted(site));
        }

        None
    }

    /// Returns the sites that crossed the suspect timeout since the previous tick.
    pub fn tick(&mut self, now: u64) -> Vec<SiteId> {
        let timeout = self.suspect_timeout.as_millis() as u64;
        let mut suspected = Vec::new();

        for entry in self.peers.values_mut() {
            if entry.peer.state != PeerState::Alive {
                continue;
            }
            let elapsed = now.saturating_sub(entry.last_seen);
            if elapsed > timeout {
                tracing::warn!(
                    "Site {} suspected (no contact for {}ms)",
                    entry.peer.id,
                    elapsed
                );
                entry.peer.state = PeerState::Suspect;
                suspected.push(entry.peer.id);
            }
        }

        suspected
    }

    pub fn state_of(&self, site: SiteId) -> Option<PeerState> {
        self.peers.get(&site).map(|entry| entry.peer.state)
    }

    pub fn peer(&self, site: SiteId) -> Option<&Peer> {
        self.peers.get(&site).map(|entry| &entry.peer)
    }

    pub fn alive_peers(&self) -> Vec<SiteId> {
        self.peers
            .values()
            .filter(|entry| entry.peer.state == PeerState::Alive)
            .map(|entry| entry.peer.id)
            .collect()
    }

    pub fn suspected_peers(&self) -> Vec<SiteId> {
        self.peers
            .values()
            .filter(|entry| entry.peer.state == PeerState::Suspect)
            .map(|entry| entry.peer.id)
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
