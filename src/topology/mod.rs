//! Topology Module
//!
//! Maps an agreed [`crate::agreement::belief::Decision`] onto partition mastership and
//! persists the result as the next durable topology epoch.
//!
//! ## Core Mechanisms
//! - **Recompute**: Deterministic promotion along each partition's configured replica order.
//! - **Publish**: Compare-and-set against the coordination store, bounded by a timeout and
//!   retried with exponential backoff and jitter; lost races are re-read and resolved.

pub mod publisher;
pub mod recompute;
pub mod types;

#[cfg(test)]
mod tests;
