//! Simulated Cluster Runs
//!
//! Drives several [`AgreementEngine`]s against each other over a seeded in-memory network
//! that encodes every message with the real wire codec, delays and reorders frames, drops a
//! configurable share of them and can cut the cluster into two sides.
//!
//! ## Test Scopes
//! - **Single crash**: every survivor decides the same verdict within the expected time.
//! - **Lossy network**: identical decisions across seeds with 10% message loss.
//! - **Network split**: the majority side decides, the minority side halts.

#[cfg(test)]
mod tests {
    use std::cmp::Reverse;
    use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::agreement::belief::{Decision, FailureBelief, ForwardedBelief};
    use crate::agreement::engine::{AgreementEngine, AgreementState, EngineOutput};
    use crate::agreement::error::{FatalCondition, SplitReason};
    use crate::agreement::gossip::InboundBelief;
    use crate::agreement::protocol::{HeartbeatMessage, WireMessage, decode, encode};
    use crate::config::{AgreementConfig, PartitionEntry};
    use crate::membership::types::SiteId;
    use crate::topology::recompute::recompute;
    use crate::topology::types::{PartitionId, TopologyEpoch};

    const MAX_DELAY_MS: u64 = 5;

    fn sim_config(suspect_ms: u64) -> AgreementConfig {
        AgreementConfig {
            heartbeat_interval: Duration::from_millis(50),
            tick_interval: Duration::from_millis(10),
            suspect_timeout: Duration::from_millis(suspect_ms),
            round_timeout: Duration::from_millis(100),
            max_escalations: 6,
            dedup_window: Duration::from_millis(100),
            dedup_capacity: 1024,
            ..AgreementConfig::default()
        }
    }

    fn sites(ids: &[i64]) -> BTreeSet<SiteId> {
        ids.iter().map(|id| SiteId(*id)).collect()
    }

    // ============================================================
    // SIMULATED NETWORK
    // ============================================================

    struct Network {
        rng: StdRng,
        loss: f64,
        // When set, sites inside and outside this side cannot reach each other.
        side: Option<BTreeSet<SiteId>>,
        in_flight: BinaryHeap<Reverse<(u64, u64, SiteId, Vec<u8>)>>,
        seq: u64,
    }

    impl Network {
        fn new(seed: u64, loss: f64) -> Self {
            Self {
                rng: StdRng::seed_from_u64(seed),
                loss,
                side: None,
                in_flight: BinaryHeap::new(),
                seq: 0,
            }
        }

        fn reachable(&self, from: SiteId, to: SiteId) -> bool {
            match &self.side {
                Some(side) => side.contains(&from) == side.contains(&to),
                None => true,
            }
        }

        fn send(&mut self, now: u64, from: SiteId, to: SiteId, message: &WireMessage) {
            if !self.reachable(from, to) || self.rng.gen_bool(self.loss) {
                return;
            }
            let frame = encode(message).unwrap();
            let deliver_at = now + self.rng.gen_range(1..=MAX_DELAY_MS);
            self.seq += 1;
            self.in_flight
                .push(Reverse((deliver_at, self.seq, to, frame)));
        }

        fn due(&mut self, now: u64) -> Option<(SiteId, Vec<u8>)> {
            let ready = matches!(self.in_flight.peek(), Some(Reverse((at, ..))) if *at <= now);
            if !ready {
                return None;
            }
            self.in_flight
                .pop()
                .map(|Reverse((_, _, to, frame))| (to, frame))
        }
    }

    // ============================================================
    // SIMULATED CLUSTER
    // ============================================================

    struct Cluster {
        config: AgreementConfig,
        engines: BTreeMap<SiteId, AgreementEngine>,
        crash_at: BTreeMap<SiteId, u64>,
        network: Network,
        decisions: BTreeMap<SiteId, (u64, Decision)>,
        fatal: BTreeMap<SiteId, FatalCondition>,
        now: u64,
    }

    impl Cluster {
        fn new(members: &BTreeSet<SiteId>, config: AgreementConfig, seed: u64, loss: f64) -> Self {
            let engines = members
                .iter()
                .map(|site| {
                    (
                        *site,
                        AgreementEngine::new(*site, 0, members.clone(), &config, 0),
                    )
                })
                .collect();

            Self {
                config,
                engines,
                crash_at: BTreeMap::new(),
                network: Network::new(seed, loss),
                decisions: BTreeMap::new(),
                fatal: BTreeMap::new(),
                now: 0,
            }
        }

        fn crash(&mut self, site: SiteId, at: u64) {
            self.crash_at.insert(site, at);
        }

        fn split(&mut self, side: BTreeSet<SiteId>) {
            self.network.side = Some(side);
        }

        fn crashed(&self, site: SiteId) -> bool {
            self.crash_at.get(&site).is_some_and(|at| self.now >= *at)
        }

        fn running(&self) -> Vec<SiteId> {
            self.engines
                .keys()
                .copied()
                .filter(|site| !self.crashed(*site))
                .collect()
        }

        fn settled(&self) -> bool {
            self.running().iter().all(|site| {
                matches!(
                    self.engines[site].state(),
                    AgreementState::Decided | AgreementState::Halted
                )
            })
        }

        /// Advances one millisecond at a time until every running site decided or halted.
        fn run_until(&mut self, horizon: u64) {
            let heartbeat = self.config.heartbeat_interval.as_millis() as u64;
            let tick = self.config.tick_interval.as_millis() as u64;

            while self.now < horizon {
                self.now += 1;
                while let Some((to, frame)) = self.network.due(self.now) {
                    self.deliver(to, &frame);
                }
                if self.now % heartbeat == 0 {
                    self.heartbeats();
                }
                if self.now % tick == 0 {
                    for site in self.running() {
                        let now = self.now;
                        let outputs = self.engines.get_mut(&site).unwrap().tick(now);
                        self.apply(site, outputs);
                    }
                    if self.settled() {
                        return;
                    }
                }
            }
        }

        fn deliver(&mut self, to: SiteId, frame: &[u8]) {
            if self.crashed(to) {
                return;
            }
            let now = self.now;
            let engine = self.engines.get_mut(&to).unwrap();
            let outputs = match decode(frame).unwrap() {
                WireMessage::Heartbeat(heartbeat) => engine.on_heartbeat(
                    SiteId(heartbeat.source_site_id),
                    heartbeat.timestamp_ms,
                    heartbeat.last_safe_txn_id,
                    now,
                ),
                WireMessage::SiteFailure(msg) => engine.on_belief(
                    InboundBelief::Direct(FailureBelief::try_from(&msg).unwrap()),
                    now,
                ),
                WireMessage::SiteFailureForward(msg) => engine.on_belief(
                    InboundBelief::Forwarded(ForwardedBelief::try_from(&msg).unwrap()),
                    now,
                ),
            };
            self.apply(to, outputs);
        }

        fn heartbeats(&mut self) {
            let now = self.now;
            let running = self.running();
            let members: Vec<SiteId> = self.engines.keys().copied().collect();
            for site in running {
                let message = WireMessage::Heartbeat(HeartbeatMessage {
                    source_site_id: site.0,
                    timestamp_ms: now,
                    last_safe_txn_id: (now / 10) as i64,
                });
                for peer in members.iter().filter(|peer| **peer != site) {
                    self.network.send(now, site, *peer, &message);
                }
            }
        }

        fn apply(&mut self, site: SiteId, outputs: Vec<EngineOutput>) {
            for output in outputs {
                match output {
                    EngineOutput::Send(msg) => {
                        self.network.send(self.now, site, msg.to, &msg.to_wire())
                    }
                    EngineOutput::Decided(decision) => {
                        self.decisions.insert(site, (self.now, decision));
                    }
                    EngineOutput::Fatal(condition) => {
                        self.fatal.insert(site, condition);
                    }
                    EngineOutput::Retracted(_) | EngineOutput::Ambiguous(_) => {}
                }
            }
        }

        fn decision_of(&self, site: i64) -> &Decision {
            &self.decisions[&SiteId(site)].1
        }
    }

    // ============================================================
    // SCENARIO TESTS
    // ============================================================

    #[test]
    fn test_single_crash_decided_by_every_survivor() {
        let members = sites(&[1, 2, 3, 4, 5]);
        let mut cluster = Cluster::new(&members, sim_config(300), 7, 0.0);
        cluster.crash(SiteId(3), 0);

        cluster.run_until(5_000);

        let survivors = sites(&[1, 2, 4, 5]);
        assert_eq!(cluster.decisions.keys().copied().collect::<BTreeSet<_>>(), survivors);
        assert!(cluster.fatal.is_empty());

        let reference = cluster.decision_of(1).clone();
        assert_eq!(reference.epoch, 1);
        assert_eq!(reference.failed, sites(&[3]));
        assert_eq!(reference.survivors, survivors);
        for (site, (decided_at, decision)) in &cluster.decisions {
            assert_eq!(decision, &reference, "site {} decided differently", site);
            // Suspect timeout, two quiet rounds and some slack for ticks and delivery.
            assert!(*decided_at <= 600, "site {} decided at {}ms", site, decided_at);
        }

        let initial = TopologyEpoch::initial(
            members,
            &[PartitionEntry {
                id: PartitionId(1),
                replicas: vec![SiteId(3), SiteId(1)],
            }],
        );
        let next = recompute(&initial, &reference).epoch;
        assert_eq!(next.epoch, 1);
        assert_eq!(next.master_of(PartitionId(1)), Some(SiteId(1)));
        assert!(!next.members.contains(&SiteId(3)));
    }

    #[test]
    fn test_lossy_network_yields_identical_decisions() {
        let members = sites(&[1, 2, 3, 4, 5]);
        let survivors = sites(&[1, 2, 4, 5]);

        for seed in 1..=5u64 {
            let mut cluster = Cluster::new(&members, sim_config(350), seed, 0.1);
            cluster.crash(SiteId(3), 400);

            cluster.run_until(60_000);

            assert!(cluster.fatal.is_empty(), "seed {}: {:?}", seed, cluster.fatal);
            assert_eq!(
                cluster.decisions.keys().copied().collect::<BTreeSet<_>>(),
                survivors,
                "seed {}",
                seed
            );

            let reference = cluster.decision_of(1).clone();
            assert_eq!(reference.failed, sites(&[3]), "seed {}", seed);
            assert!(
                reference
                    .safe_txn_ids
                    .get(&SiteId(3))
                    .is_some_and(|txn| (0..=40).contains(txn)),
                "seed {}: {:?}",
                seed,
                reference.safe_txn_ids
            );
            for (site, (_, decision)) in &cluster.decisions {
                assert_eq!(decision, &reference, "seed {}: site {} diverged", seed, site);
            }
        }
    }

    #[test]
    fn test_split_majority_decides_and_minority_halts() {
        let members = sites(&[1, 2, 3, 4, 5]);
        let mut cluster = Cluster::new(&members, sim_config(300), 11, 0.0);
        cluster.split(sites(&[1, 2, 3]));

        cluster.run_until(5_000);

        let majority = sites(&[1, 2, 3]);
        assert_eq!(cluster.decisions.keys().copied().collect::<BTreeSet<_>>(), majority);
        for site in &majority {
            let decision = cluster.decision_of(site.0);
            assert_eq!(decision.failed, sites(&[4, 5]));
            assert_eq!(decision.survivors, majority);
        }

        for site in [SiteId(4), SiteId(5)] {
            assert!(matches!(
                cluster.fatal.get(&site),
                Some(FatalCondition::SplitClusterDetected {
                    reason: SplitReason::MinorityPartition,
                    total: 5,
                    ..
                })
            ));
            assert_eq!(cluster.engines[&site].state(), AgreementState::Halted);
        }
    }
}
