use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::PartitionEntry;
use crate::membership::types::SiteId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Durable record of who masters which partition.
///
/// Stored as JSON under a single key of the coordination store; the store's version counter
/// guards concurrent writers. `replica_order` is configuration and never changes between
/// epochs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyEpoch {
    pub epoch: i64,
    pub partition_masters: BTreeMap<PartitionId, SiteId>,
    pub replica_order: BTreeMap<PartitionId, Vec<SiteId>>,
    /// Sites still part of the cluster at this epoch.
    pub members: BTreeSet<SiteId>,
    /// Partitions left without any live replica.
    #[serde(default)]
    pub unavailable: BTreeSet<PartitionId>,
}

impl TopologyEpoch {
    /// Epoch 0: every configured site is a member and the head of each replica order masters
    /// its partition.
    pub fn initial(members: BTreeSet<SiteId>, partitions: &[PartitionEntry]) -> Self {
        let replica_order: BTreeMap<PartitionId, Vec<SiteId>> = partitions
            .iter()
            .map(|partition| (partition.id, partition.replicas.clone()))
            .collect();
        let partition_masters = replica_order
            .iter()
            .filter_map(|(id, replicas)| replicas.first().map(|site| (*id, *site)))
            .collect();

        Self {
            epoch: 0,
            partition_masters,
            replica_order,
            members,
            unavailable: BTreeSet::new(),
        }
    }

    pub fn master_of(&self, partition: PartitionId) -> Option<SiteId> {
        self.partition_masters.get(&partition).copied()
    }

    /// Partitions mastered by `site`.
    pub fn mastered_by(&self, site: SiteId) -> Vec<PartitionId> {
        self.partition_masters
            .iter()
            .filter(|(_, master)| **master == site)
            .map(|(partition, _)| *partition)
            .collect()
    }
}
