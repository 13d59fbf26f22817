use std::collections::{BTreeMap, BTreeSet};

use super::types::SiteId;

/// Newest safe transaction id heard from each peer.
///
/// Every heartbeat carries the sender's safe point. Once a peer is declared failed its entry
/// is frozen: a straggling heartbeat must not raise the cut-point the cluster agrees on.
#[derive(Debug, Default, Clone)]
pub struct SafetyLedger {
    newest: BTreeMap<SiteId, i64>,
    frozen: BTreeSet<SiteId>,
}

impl SafetyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `txn_id` for `site`; returns `true` when the stored value moved.
    pub fn note(&mut self, site: SiteId, txn_id: i64) -> bool {
        if self.frozen.contains(&site) {
            return false;
        }
        let entry = self.newest.entry(site).or_insert(i64::MIN);
        if txn_id > *entry {
            *entry = txn_id;
            true
        } else {
            false
        }
    }

    pub fn freeze(&mut self, site: SiteId) {
        self.frozen.insert(site);
    }

    /// Lifts a freeze after a suspicion was withdrawn.
    pub fn thaw(&mut self, site: SiteId) {
        self.frozen.remove(&site);
    }

    pub fn is_frozen(&self, site: SiteId) -> bool {
        self.frozen.contains(&site)
    }

    pub fn newest(&self, site: SiteId) -> Option<i64> {
        self.newest.get(&site).copied()
    }

    /// Safe points for the given sites, skipping sites never heard from.
    pub fn safe_points<'a>(&self, sites: impl IntoIterator<Item = &'a SiteId>) -> BTreeMap<SiteId, i64> {
        sites
            .into_iter()
            .filter_map(|site| self.newest(*site).map(|txn| (*site, txn)))
            .collect()
    }

    /// Drops entries for sites that left the membership.
    pub fn retain(&mut self, members: &BTreeSet<SiteId>) {
        self.newest.retain(|site, _| members.contains(site));
        self.frozen.retain(|site| members.contains(site));
    }
}
