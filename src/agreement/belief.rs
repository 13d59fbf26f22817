//! Failure beliefs and their join.
//!
//! A belief is one site's opinion about which members failed and up to which transaction
//! each failed site is known to be safe. Beliefs only ever grow: `merge` is a semilattice
//! join, so the order in which copies arrive (or how often) does not matter.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::error::AgreementError;
use crate::membership::types::SiteId;

/// Safe point of a site nothing is known about.
pub const NO_SAFE_TXN: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureBelief {
    pub proposer: SiteId,
    pub failed: BTreeSet<SiteId>,
    pub survivors: BTreeSet<SiteId>,
    pub decided: BTreeSet<SiteId>,
    pub safe_txn_ids: BTreeMap<SiteId, i64>,
}

impl FailureBelief {
    /// Belief of `proposer` that everybody in `members` is alive.
    pub fn all_alive(proposer: SiteId, members: &BTreeSet<SiteId>) -> Self {
        Self {
            proposer,
            failed: BTreeSet::new(),
            survivors: members.clone(),
            decided: BTreeSet::new(),
            safe_txn_ids: BTreeMap::new(),
        }
    }

    /// Checks the structural invariants every belief must satisfy.
    pub fn validate(&self) -> Result<(), AgreementError> {
        if let Some(site) = self.failed.intersection(&self.survivors).next() {
            return Err(AgreementError::MalformedMessage(format!(
                "site {} is both failed and surviving in belief of {}",
                site, self.proposer
            )));
        }
        if let Some(site) = self
            .safe_txn_ids
            .keys()
            .find(|site| !self.failed.contains(*site) && !self.survivors.contains(*site))
        {
            return Err(AgreementError::MalformedMessage(format!(
                "safe txn id for unknown site {} in belief of {}",
                site, self.proposer
            )));
        }
        if let Some((site, txn)) = self
            .safe_txn_ids
            .iter()
            .find(|(_, txn)| **txn < NO_SAFE_TXN)
        {
            return Err(AgreementError::MalformedMessage(format!(
                "safe txn id {} for site {} is below {}",
                txn, site, NO_SAFE_TXN
            )));
        }
        Ok(())
    }

    pub fn covers(&self, membership: &BTreeSet<SiteId>) -> bool {
        membership
            .iter()
            .all(|site| self.failed.contains(site) || self.survivors.contains(site))
    }

    /// Same opinion on failures, survivors and safe points; proposer and `decided` ignored.
    pub fn same_knowledge(&self, other: &FailureBelief) -> bool {
        self.failed == other.failed
            && self.survivors == other.survivors
            && self.safe_txn_ids == other.safe_txn_ids
    }

    /// Restricts the belief to `membership`, dropping references to departed sites.
    pub fn project(&self, membership: &BTreeSet<SiteId>) -> FailureBelief {
        FailureBelief {
            proposer: self.proposer,
            failed: self.failed.intersection(membership).copied().collect(),
            survivors: self.survivors.intersection(membership).copied().collect(),
            decided: self.decided.intersection(membership).copied().collect(),
            safe_txn_ids: self
                .safe_txn_ids
                .iter()
                .filter(|(site, _)| membership.contains(*site))
                .map(|(site, txn)| (*site, *txn))
                .collect(),
        }
    }

    /// Stable-within-process digest used by the dedup cache.
    ///
    /// A proposer's beliefs only grow, so `(proposer, fingerprint)` identifies one of its
    /// successive views the same way a version number would.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn with_proposer(mut self, proposer: SiteId) -> Self {
        self.proposer = proposer;
        self
    }
}

/// Semilattice join of two beliefs. The result keeps `a`'s proposer.
pub fn merge(a: &FailureBelief, b: &FailureBelief) -> FailureBelief {
    let failed: BTreeSet<SiteId> = a.failed.union(&b.failed).copied().collect();
    let survivors: BTreeSet<SiteId> = a
        .survivors
        .union(&b.survivors)
        .filter(|site| !failed.contains(*site))
        .copied()
        .collect();
    let decided = a.decided.union(&b.decided).copied().collect();

    let safe_txn_ids = a
        .safe_txn_ids
        .keys()
        .chain(b.safe_txn_ids.keys())
        .map(|site| {
            let left = a.safe_txn_ids.get(site).copied().unwrap_or(NO_SAFE_TXN);
            let right = b.safe_txn_ids.get(site).copied().unwrap_or(NO_SAFE_TXN);
            (*site, left.max(right))
        })
        .collect();

    FailureBelief {
        proposer: a.proposer,
        failed,
        survivors,
        decided,
        safe_txn_ids,
    }
}

/// Belief relayed by a site other than its proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedBelief {
    pub forwarder: SiteId,
    pub inner: FailureBelief,
}

/// What absorbing a belief did to a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeEffect {
    Unchanged,
    /// Only the `decided` set grew.
    DecidedOnly,
    Changed,
}

/// Running join of every belief a site has seen during the current epoch.
#[derive(Debug, Clone)]
pub struct ClusterView {
    belief: FailureBelief,
    version: u64,
}

impl ClusterView {
    pub fn new(local: SiteId, members: &BTreeSet<SiteId>) -> Self {
        Self {
            belief: FailureBelief::all_alive(local, members),
            version: 0,
        }
    }

    pub fn absorb(&mut self, other: &FailureBelief) -> MergeEffect {
        let merged = merge(&self.belief, other);
        self.replace(merged)
    }

    /// Installs `next` as the view, bumping the version when anything moved.
    pub fn replace(&mut self, next: FailureBelief) -> MergeEffect {
        if next == self.belief {
            return MergeEffect::Unchanged;
        }
        let effect = if next.same_knowledge(&self.belief) {
            MergeEffect::DecidedOnly
        } else {
            MergeEffect::Changed
        };
        self.belief = next;
        self.version += 1;
        effect
    }

    /// Starts over for a new epoch. The version keeps counting so observers never see it
    /// move backwards.
    pub fn reset(&mut self, members: &BTreeSet<SiteId>) {
        let fresh = FailureBelief::all_alive(self.belief.proposer, members);
        if fresh != self.belief {
            self.belief = fresh;
            self.version += 1;
        }
    }

    pub fn belief(&self) -> &FailureBelief {
        &self.belief
    }

    pub fn failed(&self) -> &BTreeSet<SiteId> {
        &self.belief.failed
    }

    pub fn survivors(&self) -> &BTreeSet<SiteId> {
        &self.belief.survivors
    }

    pub fn safe_txn_ids(&self) -> &BTreeMap<SiteId, i64> {
        &self.belief.safe_txn_ids
    }

    pub fn decided(&self) -> &BTreeSet<SiteId> {
        &self.belief.decided
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Cluster-wide verdict for one topology epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Decision {
    pub epoch: i64,
    pub failed: BTreeSet<SiteId>,
    pub survivors: BTreeSet<SiteId>,
    pub safe_txn_ids: BTreeMap<SiteId, i64>,
}

impl Decision {
    pub fn from_view(epoch: i64, view: &ClusterView) -> Self {
        Self {
            epoch,
            failed: view.failed().clone(),
            survivors: view.survivors().clone(),
            safe_txn_ids: view.safe_txn_ids().clone(),
        }
    }
}
