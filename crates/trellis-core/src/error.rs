//! Core coordination errors

use std::sync::Arc;

use thiserror::Error;

use crate::host::HostInfo;

/// Decision signals from the promotion and index-allocation paths.
///
/// Most of these are not failures: they tell the caller which tunnel won a
/// race so it can tear the loser down or keep its own attempt going. The
/// variants that carry a [`HostInfo`] point at the entry that prevailed.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The main table already holds this exact handshake packet
    #[error("handshake packet already seen")]
    AlreadySeen(Arc<HostInfo>),

    /// The main table holds a newer tunnel for this address
    #[error("existing tunnel is newer")]
    ExistingHostInfo(Arc<HostInfo>),

    /// Another HostInfo already claimed this local index
    #[error("local index collision")]
    LocalIndexCollision(Arc<HostInfo>),

    /// Our in-flight outbound handshake wins over the inbound one
    #[error("existing pending handshake")]
    ExistingHandshake(Arc<HostInfo>),

    /// Could not find an unused local index within the attempt budget
    #[error("failed to generate a unique local index")]
    UniqueIndexExhausted,
}

/// Wire decoding errors for headers and control messages
#[derive(Debug, Error)]
pub enum WireError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("control message decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoordinationError>;
