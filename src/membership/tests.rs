//! Membership Module Tests
//!
//! ## Test Scopes
//! - **Site identity**: packing of host/index and ordering.
//! - **Heartbeat monitor**: stale timestamps, suspicion, retraction, peer bookkeeping.
//! - **Safety ledger**: monotonic safe points and freezing.

#[cfg(test)]
mod tests {
    use crate::membership::ledger::SafetyLedger;
    use crate::membership::monitor::HeartbeatMonitor;
    use crate::membership::types::{HeartbeatEvent, PeerState, SiteId};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn monitor_with_peers(peers: &[i64]) -> HeartbeatMonitor {
        let mut monitor = HeartbeatMonitor::new(SiteId(1), Duration::from_millis(1000));
        for peer in peers {
            monitor.add_peer(SiteId(*peer), 0);
        }
        monitor
    }

    // ============================================================
    // SITE ID TESTS
    // ============================================================

    #[test]
    fn test_site_id_parts_roundtrip() {
        let site = SiteId::from_parts(7, 3);

        assert_eq!(site.host_id(), 7);
        assert_eq!(site.local_index(), 3);
        assert_eq!(site.to_string(), "7:3");
    }

    #[test]
    fn test_site_id_orders_by_host_first() {
        let a = SiteId::from_parts(1, 9);
        let b = SiteId::from_parts(2, 0);

        assert!(a < b, "host id dominates local index in ordering");
    }

    // ============================================================
    // HEARTBEAT MONITOR TESTS
    // ============================================================

    #[test]
    fn test_local_site_is_never_tracked() {
        let mut monitor = HeartbeatMonitor::new(SiteId(1), Duration::from_millis(1000));
        monitor.add_peer(SiteId(1), 0);

        assert_eq!(monitor.peer_count(), 0);
    }

    #[test]
    fn test_silent_peer_is_suspected_once() {
        let mut monitor = monitor_with_peers(&[2, 3]);

        assert!(monitor.tick(1000).is_empty(), "exactly at the timeout is still alive");

        monitor.on_heartbeat(SiteId(2), 900, 900);
        let suspected = monitor.tick(1001);
        assert_eq!(suspected, vec![SiteId(3)]);

        // Second tick must not report it again
        assert!(monitor.tick(1500).is_empty());
        assert_eq!(monitor.state_of(SiteId(3)), Some(PeerState::Suspect));
    }

    #[test]
    fn test_stale_heartbeat_is_ignored() {
        let mut monitor = monitor_with_peers(&[2]);

        monitor.on_heartbeat(SiteId(2), 500, 500);
        monitor.on_heartbeat(SiteId(2), 400, 1400);

        let peer = monitor.peer(SiteId(2)).unwrap();
        assert_eq!(peer.last_contact, 500);

        // The stale heartbeat did not refresh the receive time either
        assert_eq!(monitor.tick(1501), vec![SiteId(2)]);
    }

    #[test]
    fn test_heartbeat_from_suspect_retracts() {
        let mut monitor = monitor_with_peers(&[2]);
        assert_eq!(monitor.tick(1200), vec![SiteId(2)]);

        let event = monitor.on_heartbeat(SiteId(2), 1250, 1250);
        assert_eq!(event, Some(HeartbeatEvent::Retracted(SiteId(2))));
        assert_eq!(monitor.state_of(SiteId(2)), Some(PeerState::Alive));

        // Never both suspected and alive
        assert!(monitor.suspected_peers().is_empty());
        assert_eq!(monitor.alive_peers(), vec![SiteId(2)]);
    }

    #[test]
    fn test_heartbeat_from_alive_peer_raises_nothing() {
        let mut monitor = monitor_with_peers(&[2]);

        assert_eq!(monitor.on_heartbeat(SiteId(2), 10, 10), None);
        assert_eq!(monitor.on_heartbeat(SiteId(9), 10, 10), None);
    }

    #[test]
    fn test_removed_peer_is_forgotten() {
        let mut monitor = monitor_with_peers(&[2, 3]);
        monitor.remove_peer(SiteId(3));

        assert_eq!(monitor.peer_count(), 1);
        assert!(monitor.tick(5000).iter().all(|site| *site != SiteId(3)));
    }

    // ============================================================
    // SAFETY LEDGER TESTS
    // ============================================================

    #[test]
    fn test_ledger_keeps_newest() {
        let mut ledger = SafetyLedger::new();

        assert!(ledger.note(SiteId(2), 10));
        assert!(!ledger.note(SiteId(2), 7));
        assert!(ledger.note(SiteId(2), 12));
        assert_eq!(ledger.newest(SiteId(2)), Some(12));
    }

    #[test]
    fn test_frozen_ledger_entry_does_not_move() {
        let mut ledger = SafetyLedger::new();
        ledger.note(SiteId(3), 40);
        ledger.freeze(SiteId(3));

        assert!(!ledger.note(SiteId(3), 90));
        assert_eq!(ledger.newest(SiteId(3)), Some(40));
    }

    #[test]
    fn test_thawed_ledger_entry_moves_again() {
        let mut ledger = SafetyLedger::new();
        ledger.note(SiteId(3), 40);
        ledger.freeze(SiteId(3));
        assert!(ledger.is_frozen(SiteId(3)));

        ledger.thaw(SiteId(3));

        assert!(!ledger.is_frozen(SiteId(3)));
        assert!(ledger.note(SiteId(3), 90));
        assert_eq!(ledger.newest(SiteId(3)), Some(90));
    }

    #[test]
    fn test_ledger_safe_points_skip_unknown_sites() {
        let mut ledger = SafetyLedger::new();
        ledger.note(SiteId(3), 40);

        let sites: BTreeSet<SiteId> = [SiteId(3), SiteId(4)].into_iter().collect();
        let points = ledger.safe_points(&sites);

        assert_eq!(points.len(), 1);
        assert_eq!(points.get(&SiteId(3)), Some(&40));
    }

    #[test]
    fn test_ledger_retain_drops_departed_sites() {
        let mut ledger = SafetyLedger::new();
        ledger.note(SiteId(2), 1);
        ledger.note(SiteId(3), 2);

        let members: BTreeSet<SiteId> = [SiteId(2)].into_iter().collect();
        ledger.retain(&members);

        assert_eq!(ledger.newest(SiteId(3)), None);
        assert_eq!(ledger.newest(SiteId(2)), Some(1));
    }
}
