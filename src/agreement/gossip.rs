//! Gossip Dissemination
//!
//! Decides what to (re)send; delivery belongs to the transport. Every belief seen for the
//! first time is folded into the local view; one that changed the view is flooded to the
//! other live peers, skipping the hop it came from and its proposer. A time-windowed dedup cache stops the copies that
//! arrive over several paths.

use std::collections::{BTreeSet, HashMap, VecDeque};

use super::belief::{ClusterView, FailureBelief, ForwardedBelief, MergeEffect};
use super::protocol::{SiteFailureForwardMessage, SiteFailureMessage, WireMessage};
use crate::membership::types::SiteId;

type DedupKey = (SiteId, u64);

/// Bounded record of recently seen `(proposer, fingerprint)` pairs.
pub struct DedupCache {
    window_ms: u64,
    capacity: usize,
    seen: HashMap<DedupKey, u64>,
    order: VecDeque<(DedupKey, u64)>,
}

impl DedupCache {
    pub fn new(window_ms: u64, capacity: usize) -> Self {
        Self {
            window_ms,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` the first time `key` shows up within the window.
    pub fn insert(&mut self, key: DedupKey, now: u64) -> bool {
        self.expire(now);
        if self.seen.contains_key(&key) {
            return false;
        }

        self.seen.insert(key, now);
        self.order.push_back((key, now));
        while self.seen.len() > self.capacity {
            self.evict_front();
        }
        true
    }

    fn expire(&mut self, now: u64) {
        while let Some((_, inserted)) = self.order.front() {
            if now.saturating_sub(*inserted) < self.window_ms {
                break;
            }
            self.evict_front();
        }
    }

    fn evict_front(&mut self) {
        if let Some((key, inserted)) = self.order.pop_front()
            && self.seen.get(&key) == Some(&inserted)
        {
            self.seen.remove(&key);
        }
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// A belief as it arrived from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundBelief {
    Direct(FailureBelief),
    Forwarded(ForwardedBelief),
}

impl InboundBelief {
    pub fn belief(&self) -> &FailureBelief {
        match self {
            InboundBelief::Direct(belief) => belief,
            InboundBelief::Forwarded(forwarded) => &forwarded.inner,
        }
    }

    /// The site the message came from on its last hop.
    pub fn sender(&self) -> SiteId {
        match self {
            InboundBelief::Direct(belief) => belief.proposer,
            InboundBelief::Forwarded(forwarded) => forwarded.forwarder,
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, InboundBelief::Direct(_))
    }

    pub fn map_belief(self, f: impl FnOnce(FailureBelief) -> FailureBelief) -> Self {
        match self {
            InboundBelief::Direct(belief) => InboundBelief::Direct(f(belief)),
            InboundBelief::Forwarded(forwarded) => InboundBelief::Forwarded(ForwardedBelief {
                forwarder: forwarded.forwarder,
                inner: f(forwarded.inner),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipPayload {
    Belief(FailureBelief),
    Forward(ForwardedBelief),
}

/// A message the transport should deliver to `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: SiteId,
    pub payload: GossipPayload,
}

impl OutboundMessage {
    pub fn to_wire(&self) -> WireMessage {
        match &self.payload {
            GossipPayload::Belief(belief) => WireMessage::SiteFailure(SiteFailureMessage::from(belief)),
            GossipPayload::Forward(forwarded) => {
                WireMessage::SiteFailureForward(SiteFailureForwardMessage::from(forwarded))
            }
        }
    }
}

/// Outcome of feeding one non-duplicate belief through the disseminator.
#[derive(Debug)]
pub struct Reception {
    pub effect: MergeEffect,
    pub relays: Vec<OutboundMessage>,
}

pub struct GossipDisseminator {
    local: SiteId,
    dedup: DedupCache,
}

impl GossipDisseminator {
    pub fn new(local: SiteId, dedup_window_ms: u64, dedup_capacity: usize) -> Self {
        Self {
            local,
            dedup: DedupCache::new(dedup_window_ms, dedup_capacity),
        }
    }

    /// Merges `inbound` into `view` and plans its relays.
    ///
    /// Only a belief that changed the view is relayed. Returns `None` for a copy already seen
    /// inside the dedup window; such copies are neither merged again nor relayed.
    pub fn receive(
        &mut self,
        view: &mut ClusterView,
        inbound: &InboundBelief,
        live_peers: &BTreeSet<SiteId>,
        now: u64,
    ) -> Option<Reception> {
        let belief = inbound.belief();
        let key = (belief.proposer, belief.fingerprint());
        if !self.dedup.insert(key, now) {
            tracing::trace!(
                "Dropping duplicate belief of {} (via {})",
                belief.proposer,
                inbound.sender()
            );
            return None;
        }

        let effect = view.absorb(belief);
        if effect == MergeEffect::Unchanged {
            return Some(Reception {
                effect,
                relays: Vec::new(),
            });
        }

        let sender = inbound.sender();
        let relays = live_peers
            .iter()
            .filter(|peer| **peer != self.local && **peer != sender && **peer != belief.proposer)
            .map(|peer| OutboundMessage {
                to: *peer,
                payload: GossipPayload::Forward(ForwardedBelief {
                    forwarder: self.local,
                    inner: belief.clone(),
                }),
            })
            .collect();

        Some(Reception { effect, relays })
    }

    /// Sends the local belief to every live peer.
    pub fn broadcast(
        &mut self,
        belief: &FailureBelief,
        live_peers: &BTreeSet<SiteId>,
        now: u64,
    ) -> Vec<OutboundMessage> {
        // Our own belief coming back through a relay is not news.
        self.dedup.insert((belief.proposer, belief.fingerprint()), now);

        live_peers
            .iter()
            .filter(|peer| **peer != self.local)
            .map(|peer| OutboundMessage {
                to: *peer,
                payload: GossipPayload::Belief(belief.clone()),
            })
            .collect()
    }

    /// Records `belief` as seen without merging it; `false` for a copy inside the window.
    pub fn admit(&mut self, belief: &FailureBelief, now: u64) -> bool {
        self.dedup.insert((belief.proposer, belief.fingerprint()), now)
    }

    /// Direct answer carrying the local belief to a single peer.
    pub fn reply(&self, to: SiteId, belief: &FailureBelief) -> OutboundMessage {
        OutboundMessage {
            to,
            payload: GossipPayload::Belief(belief.clone()),
        }
    }

    pub fn reset(&mut self) {
        self.dedup.clear();
    }

    pub fn cached_entries(&self) -> usize {
        self.dedup.len()
    }
}
