//! Site-Failure Agreement Module
//!
//! Turns local suspicions into a cluster-wide verdict on which sites failed and up to which
//! transaction each of them is safe. Every survivor that decides an epoch produces the same
//! [`belief::Decision`].
//!
//! ## Core Mechanisms
//! - **Failure Beliefs**: Grow-only opinions joined with a semilattice merge.
//! - **Gossip**: Flooding with one-hop loop suppression, a time-windowed dedup cache and
//!   anti-entropy replies.
//! - **Engine**: Quiescence detection over two quiet rounds, confirmation from every live
//!   peer, escalation, majority rule and fatal split detection.
//! - **Wire Protocol**: Length-prefixed bincode frames with strict validation on decode.

pub mod belief;
pub mod engine;
pub mod error;
pub mod gossip;
pub mod protocol;

#[cfg(test)]
mod simulation;
