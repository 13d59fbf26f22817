//! Coordination Store Protocol
//!
//! Endpoints and DTOs of the HTTP front-end. Values travel as JSON text so the store never
//! needs to know what it holds.

use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Read of a single record; the key follows as a path segment.
pub const ENDPOINT_READ: &str = "/store/get";
/// Compare-and-set write.
pub const ENDPOINT_CAS: &str = "/store/cas";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    /// `None` when the record was never written.
    pub value: Option<String>,
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CasRequest {
    pub key: String,
    /// Version the writer read; 0 creates the record.
    pub expected_version: u64,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CasResponse {
    pub applied: bool,
}
