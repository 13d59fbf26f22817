//! Site-Failure Agreement Library
//!
//! Detects that partition-replica sites of a replicated database stopped responding, makes
//! every survivor agree on exactly which sites failed and up to which transaction their state
//! is safe, and publishes the resulting partition mastership as a new durable topology epoch.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`membership`**: Heartbeat liveness tracking and the per-peer safe-point ledger.
//! - **`agreement`**: Failure beliefs, gossip dissemination, the wire protocol and the
//!   per-site agreement state machine.
//! - **`topology`**: Recomputation of partition masters from a decision and its
//!   compare-and-set publication.
//! - **`coordination`**: The versioned key-value store holding the topology record, in
//!   memory or over HTTP.
//! - **`node`**: The runtime loop tying the above to a UDP transport, timers and listeners.
//! - **`config`**: TOML configuration of a site.
//! - **`retry`**: Exponential backoff with jitter.

pub mod agreement;
pub mod config;
pub mod coordination;
pub mod membership;
pub mod node;
pub mod retry;
pub mod topology;
