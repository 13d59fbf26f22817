//! Agreement Wire Protocol
//!
//! Messages exchanged between sites over the heartbeat transport. Field order is fixed and
//! every set travels as a count followed by a sorted array of 64-bit ids, so two sites
//! holding the same belief put identical bytes on the wire.
//!
//! Frame layout: `u32` big-endian payload length, then the bincode encoding (fixed-width
//! little-endian integers) of a [`WireMessage`].

use std::collections::{BTreeMap, BTreeSet};

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::belief::{FailureBelief, ForwardedBelief};
use super::error::AgreementError;
use crate::membership::types::SiteId;

/// Upper bound for a single frame payload.
pub const MAX_FRAME_BYTES: usize = 1 << 20;
/// Size of the length prefix.
pub const FRAME_HEADER_BYTES: usize = 4;

// --- Messages ---

/// A site's own belief, sent directly by its proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFailureMessage {
    pub source_site_id: i64,
    pub failed: Vec<i64>,
    pub survivors: Vec<i64>,
    pub decided: Vec<i64>,
    pub safe_txn_ids: Vec<(i64, i64)>,
}

/// Relay of another site's belief.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFailureForwardMessage {
    pub forwarder_id: i64,
    pub inner: SiteFailureMessage,
}

/// Liveness beacon; also advertises the sender's newest safe transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub source_site_id: i64,
    pub timestamp_ms: u64,
    pub last_safe_txn_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Heartbeat(HeartbeatMessage),
    SiteFailure(SiteFailureMessage),
    SiteFailureForward(SiteFailureForwardMessage),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame shorter than its length header")]
    Truncated,
    #[error("frame announces {announced} bytes but carries {actual}")]
    LengthMismatch { announced: usize, actual: usize },
    #[error("frame of {0} bytes exceeds the frame size limit")]
    TooLarge(usize),
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
    #[error(transparent)]
    Invalid(#[from] AgreementError),
}

impl From<CodecError> for AgreementError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Invalid(inner) => inner,
            other => AgreementError::MalformedMessage(other.to_string()),
        }
    }
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
        .with_limit(MAX_FRAME_BYTES as u64)
}

/// Encodes `message` into a length-prefixed frame.
pub fn encode(message: &WireMessage) -> Result<Vec<u8>, CodecError> {
    let payload = wire_options().serialize(message)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(CodecError::TooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes one complete frame. Belief payloads are validated before they are returned.
pub fn decode(frame: &[u8]) -> Result<WireMessage, CodecError> {
    if frame.len() < FRAME_HEADER_BYTES {
        return Err(CodecError::Truncated);
    }
    let mut header = [0u8; FRAME_HEADER_BYTES];
    header.copy_from_slice(&frame[..FRAME_HEADER_BYTES]);
    let announced = u32::from_be_bytes(header) as usize;
    if announced > MAX_FRAME_BYTES {
        return Err(CodecError::TooLarge(announced));
    }
    let payload = &frame[FRAME_HEADER_BYTES..];
    if payload.len() != announced {
        return Err(CodecError::LengthMismatch {
            announced,
            actual: payload.len(),
        });
    }

    let message: WireMessage = wire_options().deserialize(payload)?;
    match &message {
        WireMessage::SiteFailure(msg) => {
            FailureBelief::try_from(msg)?;
        }
        WireMessage::SiteFailureForward(msg) => {
            ForwardedBelief::try_from(msg)?;
        }
        WireMessage::Heartbeat(_) => {}
    }
    Ok(message)
}

// --- Conversions ---

fn sorted_ids(sites: &BTreeSet<SiteId>) -> Vec<i64> {
    sites.iter().map(|site| site.0).collect()
}

fn strictly_sorted(field: &str, ids: &[i64]) -> Result<BTreeSet<SiteId>, AgreementError> {
    if ids.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(AgreementError::MalformedMessage(format!(
            "{} is not strictly sorted",
            field
        )));
    }
    Ok(ids.iter().map(|id| SiteId(*id)).collect())
}

impl From<&FailureBelief> for SiteFailureMessage {
    fn from(belief: &FailureBelief) -> Self {
        Self {
            source_site_id: belief.proposer.0,
            failed: sorted_ids(&belief.failed),
            survivors: sorted_ids(&belief.survivors),
            decided: sorted_ids(&belief.decided),
            safe_txn_ids: belief
                .safe_txn_ids
                .iter()
                .map(|(site, txn)| (site.0, *txn))
                .collect(),
        }
    }
}

impl TryFrom<&SiteFailureMessage> for FailureBelief {
    type Error = AgreementError;

    fn try_from(msg: &SiteFailureMessage) -> Result<Self, Self::Error> {
        let failed = strictly_sorted("failed", &msg.failed)?;
        let survivors = strictly_sorted("survivors", &msg.survivors)?;
        let decided = strictly_sorted("decided", &msg.decided)?;
        let keys: Vec<i64> = msg.safe_txn_ids.iter().map(|(site, _)| *site).collect();
        strictly_sorted("safe_txn_ids", &keys)?;

        let safe_txn_ids: BTreeMap<SiteId, i64> = msg
            .safe_txn_ids
            .iter()
            .map(|(site, txn)| (SiteId(*site), *txn))
            .collect();

        let belief = FailureBelief {
            proposer: SiteId(msg.source_site_id),
            failed,
            survivors,
            decided,
            safe_txn_ids,
        };
        belief.validate()?;
        Ok(belief)
    }
}

impl From<&ForwardedBelief> for SiteFailureForwardMessage {
    fn from(forwarded: &ForwardedBelief) -> Self {
        Self {
            forwarder_id: forwarded.forwarder.0,
            inner: SiteFailureMessage::from(&forwarded.inner),
        }
    }
}

impl TryFrom<&SiteFailureForwardMessage> for ForwardedBelief {
    type Error = AgreementError;

    fn try_from(msg: &SiteFailureForwardMessage) -> Result<Self, Self::Error> {
        let forwarder = SiteId(msg.forwarder_id);
        let inner = FailureBelief::try_from(&msg.inner)?;
        if forwarder == inner.proposer {
            return Err(AgreementError::MalformedMessage(format!(
                "site {} forwarded its own belief",
                forwarder
            )));
        }
        Ok(Self { forwarder, inner })
    }
}
