//! Topology Module Tests
//!
//! ## Test Scopes
//! - **Recompute**: promotion order, unavailable partitions, never promoting a failed site.
//! - **Publish**: bootstrap, CAS races against other sites, store outages and timeouts.

#[cfg(test)]
mod tests {
    use crate::agreement::belief::Decision;
    use crate::agreement::error::AgreementError;
    use crate::config::{AgreementConfig, PartitionEntry};
    use crate::coordination::store::{
        CoordinationStore, InMemoryStore, StoreError, VersionedValue,
    };
    use crate::membership::types::SiteId;
    use crate::topology::publisher::TopologyPublisher;
    use crate::topology::recompute::{recompute, reflects};
    use crate::topology::types::{PartitionId, TopologyEpoch};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use std::time::Duration;

    const KEY: &str = "topology";

    fn sites(ids: &[i64]) -> BTreeSet<SiteId> {
        ids.iter().map(|id| SiteId(*id)).collect()
    }

    fn partition(id: u32, replicas: &[i64]) -> PartitionEntry {
        PartitionEntry {
            id: PartitionId(id),
            replicas: replicas.iter().map(|site| SiteId(*site)).collect(),
        }
    }

    fn five_sites() -> TopologyEpoch {
        TopologyEpoch::initial(
            sites(&[1, 2, 3, 4, 5]),
            &[
                partition(0, &[3, 1]),
                partition(1, &[1, 2]),
                partition(2, &[3, 4]),
                partition(3, &[4, 5, 3]),
            ],
        )
    }

    fn decision(epoch: i64, failed: &[i64], members: &[i64]) -> Decision {
        let failed = sites(failed);
        Decision {
            epoch,
            survivors: sites(members).difference(&failed).copied().collect(),
            failed,
            safe_txn_ids: BTreeMap::new(),
        }
    }

    fn config() -> AgreementConfig {
        AgreementConfig {
            cas_timeout: Duration::from_millis(100),
            cas_attempts: 3,
            ..AgreementConfig::default()
        }
    }

    fn publisher(store: Arc<dyn CoordinationStore>) -> TopologyPublisher {
        TopologyPublisher::new(store, KEY, &config())
    }

    // ============================================================
    // RECOMPUTE TESTS
    // ============================================================

    #[test]
    fn test_initial_epoch_uses_head_of_replica_order() {
        let epoch = five_sites();

        assert_eq!(epoch.epoch, 0);
        assert_eq!(epoch.master_of(PartitionId(0)), Some(SiteId(3)));
        assert_eq!(epoch.master_of(PartitionId(3)), Some(SiteId(4)));
        assert_eq!(epoch.mastered_by(SiteId(3)), vec![PartitionId(0), PartitionId(2)]);
    }

    #[test]
    fn test_failed_master_hands_over_to_next_replica() {
        let prior = five_sites();

        let next = recompute(&prior, &decision(1, &[3], &[1, 2, 3, 4, 5]));

        assert!(next.errors.is_empty());
        assert_eq!(next.epoch.epoch, 1);
        assert_eq!(next.epoch.master_of(PartitionId(0)), Some(SiteId(1)));
        assert_eq!(next.epoch.master_of(PartitionId(1)), Some(SiteId(1)));
        assert_eq!(next.epoch.master_of(PartitionId(2)), Some(SiteId(4)));
        assert_eq!(next.epoch.members, sites(&[1, 2, 4, 5]));
        assert_eq!(next.epoch.replica_order, prior.replica_order);
    }

    #[test]
    fn test_partition_without_survivor_becomes_unavailable() {
        let prior = five_sites();

        let next = recompute(&prior, &decision(1, &[3, 4], &[1, 2, 3, 4, 5]));

        assert_eq!(
            next.errors,
            vec![AgreementError::InsufficientReplicas {
                partition: PartitionId(2)
            }]
        );
        assert_eq!(next.epoch.master_of(PartitionId(2)), None);
        assert!(next.epoch.unavailable.contains(&PartitionId(2)));

        // Everything else is still a valid assignment
        assert_eq!(next.epoch.master_of(PartitionId(0)), Some(SiteId(1)));
        assert_eq!(next.epoch.master_of(PartitionId(1)), Some(SiteId(1)));
        assert_eq!(next.epoch.master_of(PartitionId(3)), Some(SiteId(5)));
    }

    #[test]
    fn test_unavailable_partition_is_reported_once() {
        let prior = five_sites();
        let first = recompute(&prior, &decision(1, &[3, 4], &[1, 2, 3, 4, 5]));

        let second = recompute(&first.epoch, &decision(2, &[5], &[1, 2, 5]));

        // P2 was already lost; only P3 is news
        assert_eq!(
            second.errors,
            vec![AgreementError::InsufficientReplicas {
                partition: PartitionId(3)
            }]
        );
        assert!(second.epoch.unavailable.contains(&PartitionId(2)));
        assert!(second.epoch.unavailable.contains(&PartitionId(3)));
    }

    #[test]
    fn test_reflects_requires_failed_sites_removed() {
        let prior = five_sites();
        let applied = recompute(&prior, &decision(1, &[3], &[1, 2, 3, 4, 5])).epoch;

        assert!(reflects(&applied, &decision(1, &[3], &[1, 2, 3, 4, 5])));
        assert!(!reflects(&applied, &decision(1, &[2], &[1, 2, 3, 4, 5])));
        assert!(!reflects(&prior, &decision(1, &[3], &[1, 2, 3, 4, 5])));
    }

    #[test]
    fn test_epoch_survives_json_roundtrip() {
        let epoch = recompute(&five_sites(), &decision(1, &[3, 4], &[1, 2, 3, 4, 5])).epoch;

        let json = serde_json::to_string(&epoch).unwrap();
        let back: TopologyEpoch = serde_json::from_str(&json).unwrap();

        assert_eq!(back, epoch);
    }

    fn arb_layout() -> impl Strategy<Value = (Vec<Vec<i64>>, BTreeSet<i64>)> {
        (
            prop::collection::vec(
                prop::sample::subsequence((1i64..=6).collect::<Vec<_>>(), 1..=3)
                    .prop_shuffle(),
                1..8,
            ),
            prop::collection::btree_set(1i64..=6, 0..=5),
        )
    }

    proptest! {
        #[test]
        fn test_recompute_never_promotes_failed_site((orders, failed) in arb_layout()) {
            let partitions: Vec<PartitionEntry> = orders
                .iter()
                .enumerate()
                .map(|(index, replicas)| partition(index as u32, replicas))
                .collect();
            let prior = TopologyEpoch::initial(sites(&[1, 2, 3, 4, 5, 6]), &partitions);
            let failed: Vec<i64> = failed.into_iter().collect();

            let next = recompute(&prior, &decision(1, &failed, &[1, 2, 3, 4, 5, 6])).epoch;

            for (id, master) in &next.partition_masters {
                prop_assert!(!failed.contains(&master.0));
                prop_assert!(next.replica_order[id].contains(master));
            }
            for id in prior.replica_order.keys() {
                prop_assert!(
                    next.partition_masters.contains_key(id) != next.unavailable.contains(id)
                );
            }
        }
    }

    // ============================================================
    // PUBLISH TESTS
    // ============================================================

    struct UnreachableStore;

    #[async_trait]
    impl CoordinationStore for UnreachableStore {
        async fn read(&self, _key: &str) -> Result<Option<VersionedValue>, StoreError> {
            Err(StoreError::Unreachable("connection refused".to_string()))
        }

        async fn compare_and_set(
            &self,
            _key: &str,
            _expected: u64,
            _value: String,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Unreachable("connection refused".to_string()))
        }
    }

    struct HangingStore;

    #[async_trait]
    impl CoordinationStore for HangingStore {
        async fn read(&self, _key: &str) -> Result<Option<VersionedValue>, StoreError> {
            std::future::pending().await
        }

        async fn compare_and_set(
            &self,
            _key: &str,
            _expected: u64,
            _value: String,
        ) -> Result<bool, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_bootstrap_creates_then_reuses_record() {
        let store = Arc::new(InMemoryStore::new());
        let publisher = publisher(store.clone());

        let (created, version) = publisher.bootstrap(five_sites()).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(created, five_sites());

        let mut other = five_sites();
        other.epoch = 42;
        let (found, version) = publisher.bootstrap(other).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(found.epoch, 0, "existing record wins over local configuration");
    }

    #[tokio::test]
    async fn test_publish_advances_epoch() {
        let store = Arc::new(InMemoryStore::new());
        let publisher = publisher(store.clone());
        let (prior, version) = publisher.bootstrap(five_sites()).await.unwrap();

        let published = publisher
            .publish(&prior, version, &decision(1, &[3], &[1, 2, 3, 4, 5]))
            .await
            .unwrap();

        assert_eq!(published.version, 2);
        assert_eq!(published.epoch.epoch, 1);
        assert_eq!(published.epoch.master_of(PartitionId(0)), Some(SiteId(1)));
        assert!(published.errors.is_empty());

        let (stored, stored_version) = publisher.current().await.unwrap().unwrap();
        assert_eq!(stored, published.epoch);
        assert_eq!(stored_version, 2);
    }

    #[tokio::test]
    async fn test_second_site_publishing_same_decision_succeeds() {
        let store = Arc::new(InMemoryStore::new());
        let first = publisher(store.clone());
        let second = publisher(store.clone());
        let (prior, version) = first.bootstrap(five_sites()).await.unwrap();
        let verdict = decision(1, &[3, 4], &[1, 2, 3, 4, 5]);

        let a = first.publish(&prior, version, &verdict).await.unwrap();
        let b = second.publish(&prior, version, &verdict).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(
            b.errors,
            vec![AgreementError::InsufficientReplicas {
                partition: PartitionId(2)
            }]
        );
        assert_eq!(store.read(KEY).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_publish_recomputes_on_top_of_newer_epoch() {
        let store = Arc::new(InMemoryStore::new());
        let publisher = publisher(store.clone());
        let (prior, version) = publisher.bootstrap(five_sites()).await.unwrap();

        // Another writer moved the record on with an unrelated decision
        let other = recompute(&prior, &decision(1, &[5], &[1, 2, 3, 4, 5])).epoch;
        let json = serde_json::to_string(&other).unwrap();
        assert!(store.compare_and_set(KEY, version, json).await.unwrap());

        let published = publisher
            .publish(&prior, version, &decision(1, &[3], &[1, 2, 3, 4, 5]))
            .await
            .unwrap();

        assert_eq!(published.version, 3);
        assert_eq!(published.epoch.epoch, 2);
        assert_eq!(published.epoch.members, sites(&[1, 2, 4]));
        assert_eq!(published.epoch.master_of(PartitionId(0)), Some(SiteId(1)));
        assert_eq!(published.epoch.master_of(PartitionId(3)), Some(SiteId(4)));
    }

    #[tokio::test]
    async fn test_unreachable_store_surfaces_conflict() {
        let publisher = TopologyPublisher::new(
            Arc::new(UnreachableStore),
            KEY,
            &AgreementConfig {
                cas_attempts: 2,
                ..config()
            },
        );

        let err = publisher
            .publish(&five_sites(), 1, &decision(1, &[3], &[1, 2, 3, 4, 5]))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AgreementError::CoordinationStoreConflict {
                key: KEY.to_string(),
                attempts: 2
            }
        );
    }

    #[tokio::test]
    async fn test_hanging_store_is_bounded_by_timeout() {
        let publisher = TopologyPublisher::new(
            Arc::new(HangingStore),
            KEY,
            &AgreementConfig {
                cas_timeout: Duration::from_millis(20),
                cas_attempts: 1,
                ..config()
            },
        );

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            publisher.publish(&five_sites(), 1, &decision(1, &[3], &[1, 2, 3, 4, 5])),
        )
        .await
        .expect("publish must give up on its own");

        assert!(matches!(
            result,
            Err(AgreementError::CoordinationStoreConflict { .. })
        ));
    }
}
