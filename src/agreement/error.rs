use crate::membership::types::SiteId;
use crate::topology::types::PartitionId;
use thiserror::Error;

/// Recoverable and per-partition failures raised while agreeing on site failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgreementError {
    /// A send or broadcast did not go through; the caller retries.
    #[error("transient network error towards {site}: {reason}")]
    TransientNetworkError { site: SiteId, reason: String },
    /// Live sites disagree about membership and no fresher information arrived.
    #[error("membership still ambiguous after {escalations} escalation(s): {ambiguous:?}")]
    AmbiguousMembership {
        escalations: u32,
        ambiguous: Vec<SiteId>,
    },
    /// No surviving replica left for the partition.
    #[error("partition {partition} has no surviving replica")]
    InsufficientReplicas { partition: PartitionId },
    /// Another site advanced the topology record first and the retry budget ran out.
    #[error("coordination store conflict on '{key}' after {attempts} attempt(s)")]
    CoordinationStoreConflict { key: String, attempts: u32 },
    /// Undecodable or invariant-violating message; dropped.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

/// Conditions that stop agreement on this side of the cluster.
///
/// These are never absorbed: the runtime reports them to the operator and stops the
/// agreement loop, since guessing about membership can corrupt committed data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalCondition {
    SplitClusterDetected {
        reason: SplitReason,
        reachable: Vec<SiteId>,
        total: usize,
    },
    /// A fault was reported while this site was still catching up after joining.
    RecoveryAborted { failed: SiteId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitReason {
    /// The surviving side is not a majority of the epoch membership.
    MinorityPartition,
    /// Peers declared the local site failed.
    LocalSiteEvicted,
    /// Quiescence was not reached within the escalation budget.
    EscalationsExhausted,
}

impl std::fmt::Display for FatalCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalCondition::SplitClusterDetected {
                reason,
                reachable,
                total,
            } => write!(
                f,
                "split cluster detected ({:?}): {} of {} sites reachable {:?}",
                reason,
                reachable.len(),
                total,
                reachable
            ),
            FatalCondition::RecoveryAborted { failed } => {
                write!(f, "recovery aborted: site {} failed while recovering", failed)
            }
        }
    }
}
