use std::sync::Arc;
use std::time::Duration;

use super::recompute::{recompute, reflects};
use super::types::TopologyEpoch;
use crate::agreement::belief::Decision;
use crate::agreement::error::AgreementError;
use crate::config::AgreementConfig;
use crate::coordination::store::{CoordinationStore, StoreError};
use crate::retry::Backoff;

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub epoch: TopologyEpoch,
    /// Store version the epoch was written (or found) at.
    pub version: u64,
    /// `InsufficientReplicas` for every partition that became unavailable.
    pub errors: Vec<AgreementError>,
}

/// Writes topology epochs to the coordination store with compare-and-set.
pub struct TopologyPublisher {
    store: Arc<dyn CoordinationStore>,
    key: String,
    cas_timeout: Duration,
    attempts: u32,
}

impl TopologyPublisher {
    pub fn new(store: Arc<dyn CoordinationStore>, key: &str, config: &AgreementConfig) -> Self {
        Self {
            store,
            key: key.to_string(),
            cas_timeout: config.cas_timeout,
            attempts: config.cas_attempts.max(1),
        }
    }

    /// Reads the current epoch and the version it is stored at.
    pub async fn current(&self) -> Result<Option<(TopologyEpoch, u64)>, StoreError> {
        let record = tokio::time::timeout(self.cas_timeout, self.store.read(&self.key))
            .await
            .map_err(|_| {
                StoreError::Unreachable(format!("read timed out after {:?}", self.cas_timeout))
            })??;

        match record {
            Some(record) => {
                let epoch: TopologyEpoch = serde_json::from_str(&record.value)
                    .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
                Ok(Some((epoch, record.version)))
            }
            None => Ok(None),
        }
    }

    async fn try_cas(&self, expected: u64, epoch: &TopologyEpoch) -> Result<bool, StoreError> {
        let value =
            serde_json::to_string(epoch).map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        tokio::time::timeout(
            self.cas_timeout,
            self.store.compare_and_set(&self.key, expected, value),
        )
        .await
        .map_err(|_| {
            StoreError::Unreachable(format!("CAS timed out after {:?}", self.cas_timeout))
        })?
    }

    async fn backoff(&self, attempt: u32, backoff: &mut Backoff) {
        if attempt >= self.attempts {
            return;
        }
        backoff.wait().await;
    }

    fn exhausted(&self) -> AgreementError {
        AgreementError::CoordinationStoreConflict {
            key: self.key.clone(),
            attempts: self.attempts,
        }
    }

    /// Returns the stored epoch, creating it from `initial` when the record does not exist.
    pub async fn bootstrap(
        &self,
        initial: TopologyEpoch,
    ) -> Result<(TopologyEpoch, u64), AgreementError> {
        let mut backoff = Backoff::store();

        for attempt in 1..=self.attempts {
            match self.current().await {
                Ok(Some(found)) => {
                    tracing::info!("Found topology epoch {} (v{})", found.0.epoch, found.1);
                    return Ok(found);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Bootstrap read {} on '{}' failed: {}", attempt, self.key, e);
                    self.backoff(attempt, &mut backoff).await;
                    continue;
                }
            }

            match self.try_cas(0, &initial).await {
                Ok(true) => {
                    tracing::info!("Created topology epoch {}", initial.epoch);
                    return Ok((initial, 1));
                }
                // Somebody else created it; the next read picks it up.
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Bootstrap CAS {} on '{}' failed: {}", attempt, self.key, e);
                    self.backoff(attempt, &mut backoff).await;
                }
            }
        }

        Err(self.exhausted())
    }

    /// Persists the epoch that follows `prior` under `decision`.
    ///
    /// A lost race is resolved by re-reading: an epoch that already carries the decision is
    /// success, anything else is recomputed on top of what was found.
    pub async fn publish(
        &self,
        prior: &TopologyEpoch,
        prior_version: u64,
        decision: &Decision,
    ) -> Result<Published, AgreementError> {
        let ours = recompute(prior, decision).epoch;
        let mut candidate = ours.clone();
        let mut expected = prior_version;
        let mut backoff = Backoff::store();

        for attempt in 1..=self.attempts {
            match self.try_cas(expected, &candidate).await {
                Ok(true) => {
                    tracing::info!(
                        "Published topology epoch {} (v{})",
                        candidate.epoch,
                        expected + 1
                    );
                    let errors = newly_unavailable(prior, &candidate);
                    return Ok(Published {
                        epoch: candidate,
                        version: expected + 1,
                        errors,
                    });
                }
                Ok(false) => match self.current().await {
                    Ok(Some((stored, version))) => {
                        if stored == ours || reflects(&stored, decision) {
                            tracing::info!(
                                "Topology epoch {} already published by another site",
                                stored.epoch
                            );
                            let errors = newly_unavailable(prior, &stored);
                            return Ok(Published {
                                epoch: stored,
                                version,
                                errors,
                            });
                        }
                        tracing::debug!(
                            "Record moved to epoch {} (v{}), recomputing",
                            stored.epoch,
                            version
                        );
                        candidate = recompute(&stored, decision).epoch;
                        expected = version;
                    }
                    Ok(None) => {
                        candidate = recompute(prior, decision).epoch;
                        expected = 0;
                    }
                    Err(e) => {
                        tracing::warn!("Re-read {} on '{}' failed: {}", attempt, self.key, e);
                        self.backoff(attempt, &mut backoff).await;
                    }
                },
                Err(e) => {
                    tracing::warn!("CAS {} on '{}' failed: {}", attempt, self.key, e);
                    self.backoff(attempt, &mut backoff).await;
                }
            }
        }

        tracing::error!(
            "Giving up on topology epoch {} after {} attempt(s)",
            decision.epoch,
            self.attempts
        );
        Err(self.exhausted())
    }
}

fn newly_unavailable(prior: &TopologyEpoch, next: &TopologyEpoch) -> Vec<AgreementError> {
    next.unavailable
        .difference(&prior.unavailable)
        .map(|partition| AgreementError::InsufficientReplicas {
            partition: *partition,
        })
        .collect()
}
