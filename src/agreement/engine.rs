//! Agreement State Machine
//!
//! One engine per site and topology epoch. Inputs are heartbeats, suspicions, fault reports,
//! beliefs from peers and timer ticks; outputs are messages to send plus at most one
//! [`Decision`] per epoch. Time is passed in as milliseconds and nothing here blocks, so the
//! owner decides which clock and which transport drive it.
//!
//! ```text
//! IDLE ──suspicion / new belief──▶ SUSPECTING ──2 quiet rounds──▶ STABLE ──all confirm──▶ DECIDED
//!   ▲            ▲                                                  │                         │
//!   │            └──────────────── escalate (round timeout × 2) ◀───┘                         │
//!   └─────────────────────────────────── epoch advanced ──────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::Serialize;

use super::belief::{ClusterView, Decision, FailureBelief, MergeEffect, NO_SAFE_TXN, merge};
use super::error::{AgreementError, FatalCondition, SplitReason};
use super::gossip::{GossipDisseminator, InboundBelief, OutboundMessage};
use crate::config::AgreementConfig;
use crate::membership::ledger::SafetyLedger;
use crate::membership::monitor::HeartbeatMonitor;
use crate::membership::types::{HeartbeatEvent, SiteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AgreementState {
    Idle,
    Suspecting,
    Stable,
    Decided,
    /// A fatal condition was raised; every further input is ignored.
    Halted,
}

/// Something the owner of the engine has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutput {
    Send(OutboundMessage),
    Decided(Decision),
    /// A local suspicion was withdrawn before anybody else picked it up.
    Retracted(SiteId),
    /// Non-fatal trouble, reported for observability.
    Ambiguous(AgreementError),
    Fatal(FatalCondition),
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub local_site: SiteId,
    pub epoch: i64,
    pub state: AgreementState,
    pub view_version: u64,
    pub failed: Vec<SiteId>,
    pub survivors: Vec<SiteId>,
    pub escalations: u32,
    pub round_timeout_ms: u64,
    pub decided_epoch: Option<i64>,
}

pub struct AgreementEngine {
    local: SiteId,
    epoch: i64,
    members: BTreeSet<SiteId>,
    state: AgreementState,
    view: ClusterView,
    // Join of everything each proposer told us this epoch.
    peer_beliefs: BTreeMap<SiteId, FailureBelief>,
    // Failures this site raised itself; the only ones it may withdraw.
    local_suspicions: BTreeSet<SiteId>,
    monitor: HeartbeatMonitor,
    ledger: SafetyLedger,
    gossip: GossipDisseminator,
    base_round_ms: u64,
    round_timeout_ms: u64,
    max_escalations: u32,
    escalations: u32,
    last_change: u64,
    recovering: bool,
    decision: Option<Decision>,
    deferred: Vec<InboundBelief>,
    deferred_suspicions: BTreeSet<SiteId>,
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl AgreementEngine {
    pub fn new(
        local: SiteId,
        epoch: i64,
        members: BTreeSet<SiteId>,
        config: &AgreementConfig,
        now: u64,
    ) -> Self {
        let mut monitor = HeartbeatMonitor::new(local, config.suspect_timeout);
        for site in &members {
            monitor.add_peer(*site, now);
        }
        let round = millis(config.round_timeout).max(1);

        Self {
            local,
            epoch,
            view: ClusterView::new(local, &members),
            members,
            state: AgreementState::Idle,
            peer_beliefs: BTreeMap::new(),
            local_suspicions: BTreeSet::new(),
            monitor,
            ledger: SafetyLedger::new(),
            gossip: GossipDisseminator::new(
                local,
                millis(config.dedup_window),
                config.dedup_capacity,
            ),
            base_round_ms: round,
            round_timeout_ms: round,
            max_escalations: config.max_escalations,
            escalations: 0,
            last_change: now,
            recovering: false,
            decision: None,
            deferred: Vec::new(),
            deferred_suspicions: BTreeSet::new(),
        }
    }

    // ==========================================
    // Inputs
    // ==========================================

    /// Heartbeat from `site`, stamped `sent_at` by the sender and carrying its safe point.
    pub fn on_heartbeat(
        &mut self,
        site: SiteId,
        sent_at: u64,
        safe_txn_id: i64,
        now: u64,
    ) -> Vec<EngineOutput> {
        if self.state == AgreementState::Halted || !self.members.contains(&site) {
            return Vec::new();
        }

        match self.monitor.on_heartbeat(site, sent_at, now) {
            Some(HeartbeatEvent::Retracted(site)) => {
                let outputs = self.retract(site, now);
                self.ledger.note(site, safe_txn_id);
                outputs
            }
            _ => {
                self.ledger.note(site, safe_txn_id);
                Vec::new()
            }
        }
    }

    /// Fault reported by an execution site or operator; handled like a local suspicion.
    pub fn report_fault(&mut self, site: SiteId, now: u64) -> Vec<EngineOutput> {
        tracing::warn!("Fault reported for site {}", site);
        self.suspect(site, now)
    }

    pub fn on_belief(&mut self, inbound: InboundBelief, now: u64) -> Vec<EngineOutput> {
        if self.state == AgreementState::Halted {
            return Vec::new();
        }

        let proposer = inbound.belief().proposer;
        let sender = inbound.sender();
        if proposer == self.local {
            return Vec::new();
        }
        if !self.members.contains(&proposer) || !self.members.contains(&sender) {
            tracing::warn!(
                "Dropping belief of {} via {}: not a member of epoch {}",
                proposer,
                sender,
                self.epoch
            );
            return Vec::new();
        }

        let inbound = inbound.map_belief(|belief| belief.project(&self.members));
        if self.state == AgreementState::Decided {
            return self.on_belief_while_decided(inbound, now);
        }
        if self.recovering
            && let Some(failed) = inbound.belief().failed.first().copied()
        {
            return self.halt(FatalCondition::RecoveryAborted { failed });
        }

        let live = self.live_peers();
        let Some(reception) = self.gossip.receive(&mut self.view, &inbound, &live, now) else {
            return Vec::new();
        };
        tracing::debug!(
            "Belief of {} via {} -> {:?} (view v{})",
            proposer,
            sender,
            reception.effect,
            self.view.version()
        );
        self.remember(inbound.belief());

        let mut outputs: Vec<EngineOutput> =
            reception.relays.into_iter().map(EngineOutput::Send).collect();
        match reception.effect {
            MergeEffect::Changed => {
                let merged = self.view.belief().clone();
                let next = self.with_local_safe_points(merged);
                self.view.replace(next);
                outputs.extend(self.view_changed(now));
            }
            MergeEffect::DecidedOnly | MergeEffect::Unchanged => {
                // Tell the proposer we already agree; this is how it collects confirmations.
                if inbound.is_direct() && self.state != AgreementState::Idle {
                    outputs.push(EngineOutput::Send(
                        self.gossip.reply(proposer, self.view.belief()),
                    ));
                }
            }
        }
        outputs
    }

    /// Advances the heartbeat monitor and the quiescence detector to `now`.
    pub fn tick(&mut self, now: u64) -> Vec<EngineOutput> {
        if self.state == AgreementState::Halted {
            return Vec::new();
        }

        let mut outputs = Vec::new();
        for site in self.monitor.tick(now) {
            outputs.extend(self.suspect(site, now));
            if self.state == AgreementState::Halted {
                return outputs;
            }
        }

        if self.state == AgreementState::Suspecting
            && now.saturating_sub(self.last_change) >= 2 * self.round_timeout_ms
        {
            tracing::info!(
                "View v{} quiet for two rounds of {}ms",
                self.view.version(),
                self.round_timeout_ms
            );
            self.state = AgreementState::Stable;
            outputs.extend(self.evaluate(now));
        }
        outputs
    }

    /// Installs the next topology epoch and replays what was held back meanwhile.
    pub fn on_epoch_advanced(
        &mut self,
        epoch: i64,
        members: BTreeSet<SiteId>,
        now: u64,
    ) -> Vec<EngineOutput> {
        if self.state == AgreementState::Halted {
            return Vec::new();
        }
        if epoch <= self.epoch {
            tracing::debug!("Ignoring epoch {} (current {})", epoch, self.epoch);
            return Vec::new();
        }
        if !members.contains(&self.local) {
            self.members = members;
            return self.split(SplitReason::LocalSiteEvicted);
        }

        for departed in self.members.difference(&members) {
            self.monitor.remove_peer(*departed);
        }
        for joined in members.difference(&self.members) {
            self.monitor.add_peer(*joined, now);
        }
        self.ledger.retain(&members);

        tracing::info!(
            "Epoch {} installed with {} member(s), replaying {} deferred belief(s)",
            epoch,
            members.len(),
            self.deferred.len()
        );
        self.members = members;
        self.epoch = epoch;
        self.view.reset(&self.members);
        self.peer_beliefs.clear();
        self.local_suspicions.clear();
        self.gossip.reset();
        self.state = AgreementState::Idle;
        self.escalations = 0;
        self.round_timeout_ms = self.base_round_ms;
        self.decision = None;
        self.last_change = now;

        let mut outputs = Vec::new();
        for site in std::mem::take(&mut self.deferred_suspicions) {
            outputs.extend(self.suspect(site, now));
        }
        for inbound in std::mem::take(&mut self.deferred) {
            outputs.extend(self.on_belief(inbound, now));
        }
        outputs
    }

    /// Marks the site as catching up after a join; faults during that window are fatal.
    pub fn set_recovering(&mut self, recovering: bool) {
        self.recovering = recovering;
    }

    // ==========================================
    // Transitions
    // ==========================================

    fn suspect(&mut self, site: SiteId, now: u64) -> Vec<EngineOutput> {
        match self.state {
            AgreementState::Halted => return Vec::new(),
            AgreementState::Decided => {
                tracing::debug!("Deferring suspicion of {} until the next epoch", site);
                self.deferred_suspicions.insert(site);
                return Vec::new();
            }
            _ => {}
        }
        if site == self.local || !self.members.contains(&site) {
            tracing::debug!("Ignoring suspicion of {} in epoch {}", site, self.epoch);
            return Vec::new();
        }
        if self.recovering {
            return self.halt(FatalCondition::RecoveryAborted { failed: site });
        }

        self.local_suspicions.insert(site);
        if self.view.failed().contains(&site) {
            return Vec::new();
        }

        let mut next = self.view.belief().clone();
        next.survivors.remove(&site);
        next.failed.insert(site);
        let next = self.with_local_safe_points(next);
        match self.view.replace(next) {
            MergeEffect::Changed => self.view_changed(now),
            _ => Vec::new(),
        }
    }

    fn retract(&mut self, site: SiteId, now: u64) -> Vec<EngineOutput> {
        match self.state {
            AgreementState::Halted => return Vec::new(),
            AgreementState::Decided => {
                self.deferred_suspicions.remove(&site);
                tracing::info!("Site {} is back after epoch {} was decided", site, self.epoch);
                return Vec::new();
            }
            _ => {}
        }
        if !self.view.failed().contains(&site) {
            self.deferred_suspicions.remove(&site);
            return Vec::new();
        }

        let echoed = self
            .peer_beliefs
            .values()
            .any(|belief| belief.failed.contains(&site));
        if echoed || !self.local_suspicions.contains(&site) {
            tracing::warn!(
                "Site {} is back but peers already share its failure; keeping it failed",
                site
            );
            return Vec::new();
        }

        self.local_suspicions.remove(&site);
        self.ledger.thaw(site);
        let rebuilt = self.rebuild_view();
        self.view.replace(rebuilt);

        let mut outputs = vec![EngineOutput::Retracted(site)];
        if self.view.failed().is_empty() {
            tracing::info!("Suspicion of {} withdrawn, back to idle", site);
            self.state = AgreementState::Idle;
            self.escalations = 0;
            self.round_timeout_ms = self.base_round_ms;
        } else {
            tracing::info!("Suspicion of {} withdrawn, other failures remain", site);
            self.state = AgreementState::Suspecting;
            self.last_change = now;
            outputs.extend(self.broadcast(now));
        }
        outputs
    }

    fn on_belief_while_decided(&mut self, inbound: InboundBelief, now: u64) -> Vec<EngineOutput> {
        let merged = merge(self.view.belief(), inbound.belief());
        if merged.same_knowledge(self.view.belief()) {
            // A straggler still collecting confirmations for this epoch.
            if inbound.is_direct() && self.gossip.admit(inbound.belief(), now) {
                let proposer = inbound.belief().proposer;
                return vec![EngineOutput::Send(
                    self.gossip.reply(proposer, self.view.belief()),
                )];
            }
            return Vec::new();
        }

        if self
            .deferred
            .iter()
            .any(|held| held.belief() == inbound.belief())
        {
            return Vec::new();
        }
        tracing::debug!(
            "Deferring belief of {} until epoch {} is installed",
            inbound.belief().proposer,
            self.epoch + 1
        );
        self.deferred.push(inbound);
        Vec::new()
    }

    fn view_changed(&mut self, now: u64) -> Vec<EngineOutput> {
        if self.view.failed().contains(&self.local) {
            return self.split(SplitReason::LocalSiteEvicted);
        }

        self.last_change = now;
        if matches!(self.state, AgreementState::Idle | AgreementState::Stable) {
            tracing::info!(
                "Suspecting in epoch {}: failed {:?}",
                self.epoch,
                self.view.failed()
            );
            self.state = AgreementState::Suspecting;
        }
        self.broadcast(now)
    }

    fn evaluate(&mut self, now: u64) -> Vec<EngineOutput> {
        let ambiguous: Vec<SiteId> = self
            .live_peers()
            .into_iter()
            .filter(|peer| !self.confirms(*peer))
            .collect();
        if !ambiguous.is_empty() {
            return self.escalate(ambiguous, now);
        }
        if !self.has_quorum() {
            return self.split(SplitReason::MinorityPartition);
        }
        self.decide(now)
    }

    fn escalate(&mut self, ambiguous: Vec<SiteId>, now: u64) -> Vec<EngineOutput> {
        self.escalations += 1;
        if self.escalations > self.max_escalations {
            return self.split(SplitReason::EscalationsExhausted);
        }

        self.round_timeout_ms = self.round_timeout_ms.saturating_mul(2);
        self.state = AgreementState::Suspecting;
        self.last_change = now;
        tracing::warn!(
            "No confirmation from {:?}; escalation {} with round timeout {}ms",
            ambiguous,
            self.escalations,
            self.round_timeout_ms
        );

        let mut outputs = vec![EngineOutput::Ambiguous(
            AgreementError::AmbiguousMembership {
                escalations: self.escalations,
                ambiguous,
            },
        )];
        outputs.extend(self.broadcast(now));
        outputs
    }

    fn decide(&mut self, now: u64) -> Vec<EngineOutput> {
        let decision = Decision::from_view(self.epoch + 1, &self.view);
        let mut last = self.view.belief().clone();
        last.decided.insert(self.local);
        self.view.replace(last);
        self.state = AgreementState::Decided;
        self.decision = Some(decision.clone());
        tracing::info!(
            "Decided epoch {}: failed {:?}, survivors {:?}",
            decision.epoch,
            decision.failed,
            decision.survivors
        );

        let mut outputs = vec![EngineOutput::Decided(decision)];
        outputs.extend(self.broadcast(now));
        outputs
    }

    fn split(&mut self, reason: SplitReason) -> Vec<EngineOutput> {
        self.halt(FatalCondition::SplitClusterDetected {
            reason,
            reachable: self.view.survivors().iter().copied().collect(),
            total: self.members.len(),
        })
    }

    fn halt(&mut self, condition: FatalCondition) -> Vec<EngineOutput> {
        tracing::error!("Agreement halted in epoch {}: {}", self.epoch, condition);
        self.state = AgreementState::Halted;
        vec![EngineOutput::Fatal(condition)]
    }

    // ==========================================
    // Helpers
    // ==========================================

    fn broadcast(&mut self, now: u64) -> Vec<EngineOutput> {
        let live = self.live_peers();
        self.gossip
            .broadcast(self.view.belief(), &live, now)
            .into_iter()
            .map(EngineOutput::Send)
            .collect()
    }

    fn remember(&mut self, belief: &FailureBelief) {
        self.peer_beliefs
            .entry(belief.proposer)
            .and_modify(|known| *known = merge(known, belief))
            .or_insert_with(|| belief.clone());
    }

    /// `peer` has told us everything we know, about every member.
    fn confirms(&self, peer: SiteId) -> bool {
        self.peer_beliefs.get(&peer).is_some_and(|belief| {
            belief.covers(&self.members) && belief.same_knowledge(self.view.belief())
        })
    }

    /// Strict majority, or exactly half including the lowest member.
    fn has_quorum(&self) -> bool {
        let doubled = self.view.survivors().len() * 2;
        let total = self.members.len();
        doubled > total
            || (doubled == total
                && self
                    .members
                    .first()
                    .is_some_and(|lowest| self.view.survivors().contains(lowest)))
    }

    /// Folds this site's safe points for failed sites into `belief` and freezes them.
    fn with_local_safe_points(&mut self, mut belief: FailureBelief) -> FailureBelief {
        for site in &belief.failed {
            self.ledger.freeze(*site);
        }
        for (site, txn) in self.ledger.safe_points(belief.failed.iter()) {
            let entry = belief.safe_txn_ids.entry(site).or_insert(NO_SAFE_TXN);
            if txn > *entry {
                *entry = txn;
            }
        }
        belief
    }

    fn rebuild_view(&mut self) -> FailureBelief {
        let mut belief = FailureBelief::all_alive(self.local, &self.members);
        for peer in self.peer_beliefs.values() {
            belief = merge(&belief, peer);
        }
        for site in &self.local_suspicions {
            belief.survivors.remove(site);
            belief.failed.insert(*site);
        }
        self.with_local_safe_points(belief)
    }

    // ==========================================
    // Accessors
    // ==========================================

    /// Sites the view still lists as alive, excluding this one.
    pub fn live_peers(&self) -> BTreeSet<SiteId> {
        self.view
            .survivors()
            .iter()
            .filter(|site| **site != self.local)
            .copied()
            .collect()
    }

    pub fn local(&self) -> SiteId {
        self.local
    }

    pub fn state(&self) -> AgreementState {
        self.state
    }

    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    pub fn members(&self) -> &BTreeSet<SiteId> {
        &self.members
    }

    pub fn view(&self) -> &ClusterView {
        &self.view
    }

    pub fn decision(&self) -> Option<&Decision> {
        self.decision.as_ref()
    }

    pub fn escalations(&self) -> u32 {
        self.escalations
    }

    pub fn round_timeout_ms(&self) -> u64 {
        self.round_timeout_ms
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn monitor(&self) -> &HeartbeatMonitor {
        &self.monitor
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            local_site: self.local,
            epoch: self.epoch,
            state: self.state,
            view_version: self.view.version(),
            failed: self.view.failed().iter().copied().collect(),
            survivors: self.view.survivors().iter().copied().collect(),
            escalations: self.escalations,
            round_timeout_ms: self.round_timeout_ms,
            decided_epoch: self.decision.as_ref().map(|decision| decision.epoch),
        }
    }
}
