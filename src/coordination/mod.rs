//! Coordination Store Module
//!
//! The one piece of cross-site mutable state: a small versioned key-value record holding the
//! topology epoch. Writers race through compare-and-set on the record's version, so at most
//! one recomputation of a given epoch wins.
//!
//! ## Components
//! - **Store trait**: `read` / `compare_and_set`, implemented in memory and over HTTP.
//! - **HTTP front-end**: axum handlers exposing an in-memory store to the other sites.
//! - **HTTP client**: reqwest-based store with per-request timeout and retry with jitter.

pub mod client;
pub mod handlers;
pub mod protocol;
pub mod store;
