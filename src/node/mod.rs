//! Site Runtime Module
//!
//! Wires one site's agreement engine to the outside world: a UDP transport for heartbeats and
//! beliefs, a timer, the topology publisher and the execution-side listeners.
//!
//! ## Components
//! - **Service**: Single-threaded event loop owning the engine; everything else hands off
//!   through its queue.
//! - **Transport**: Fire-and-forget UDP datagrams, one frame each.
//! - **Listeners**: Topology change notifications (logging and watch channel).
//! - **Handlers**: HTTP status endpoints.

pub mod handlers;
pub mod listener;
pub mod service;
pub mod transport;
