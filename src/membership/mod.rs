//! Membership & Liveness Module
//!
//! Tracks which peer sites are still talking to us. Every site sends periodic heartbeats to
//! every other site; a peer that stays silent for longer than the suspect timeout becomes a
//! suspect and is handed to the agreement engine.
//!
//! ## Core Mechanisms
//! - **Heartbeat Monitor**: Last-contact bookkeeping with stale-timestamp rejection and
//!   suspicion/retraction events.
//! - **Safety Ledger**: Newest safe transaction id advertised by each peer, frozen once the
//!   peer is declared failed.

pub mod ledger;
pub mod monitor;
pub mod types;

#[cfg(test)]
mod tests;
