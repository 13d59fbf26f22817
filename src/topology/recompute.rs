use std::collections::BTreeSet;

use super::types::TopologyEpoch;
use crate::agreement::belief::Decision;
use crate::agreement::error::AgreementError;

/// Next epoch derived from a prior one and a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recomputed {
    pub epoch: TopologyEpoch,
    /// One `InsufficientReplicas` per partition that lost its last replica with this decision.
    pub errors: Vec<AgreementError>,
}

/// Applies `decision` to `prior`.
///
/// Every partition whose master failed is handed to the first replica in its order that
/// survived. Partitions with no survivor become unavailable; the rest of the topology is
/// still valid and gets published.
pub fn recompute(prior: &TopologyEpoch, decision: &Decision) -> Recomputed {
    let members: BTreeSet<_> = prior.members.difference(&decision.failed).copied().collect();
    let mut next = TopologyEpoch {
        epoch: prior.epoch + 1,
        partition_masters: prior.partition_masters.clone(),
        replica_order: prior.replica_order.clone(),
        members,
        unavailable: prior.unavailable.clone(),
    };
    let mut errors = Vec::new();

    for (partition, replicas) in &prior.replica_order {
        let master = prior.partition_masters.get(partition);
        let needs_master = match master {
            Some(site) => decision.failed.contains(site),
            None => true,
        };
        if !needs_master {
            continue;
        }

        match replicas
            .iter()
            .find(|site| decision.survivors.contains(*site) && next.members.contains(*site))
        {
            Some(promoted) => {
                tracing::info!(
                    "Partition {} moves from {:?} to {}",
                    partition,
                    master,
                    promoted
                );
                next.partition_masters.insert(*partition, *promoted);
                next.unavailable.remove(partition);
            }
            None => {
                next.partition_masters.remove(partition);
                if next.unavailable.insert(*partition) {
                    tracing::error!("Partition {} has no surviving replica", partition);
                    errors.push(AgreementError::InsufficientReplicas {
                        partition: *partition,
                    });
                }
            }
        }
    }

    Recomputed { epoch: next, errors }
}

/// Whether `stored` already has the failures of `decision` applied.
pub fn reflects(stored: &TopologyEpoch, decision: &Decision) -> bool {
    stored.epoch >= decision.epoch
        && decision
            .failed
            .iter()
            .all(|site| !stored.members.contains(site))
}
