//! Client error types.

use std::io;

use linemq_core::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the public client methods.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client has been disconnected. Terminal.
    #[error("client closed")]
    Closed,

    /// The peer violated MQTT 3.1.1; the connection was dropped and the read
    /// loop reconnects.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server refused the CONNECT handshake.
    #[error("connect refused: {0}")]
    Refused(linemq_core::ConnectReturn),

    /// Transport failure that could not be retried in place.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// The persistence store failed; for outbound publishes this aborts the
    /// operation before anything reaches the wire.
    #[error("persistence malfunction: {0}")]
    Persistence(#[source] io::Error),

    /// The server rejected some of the requested topic filters. Carries the
    /// zero-based indexes of the rejected filters; the remaining filters are
    /// active.
    #[error("subscribe rejected for topic filter indexes {0:?}")]
    SubscribeRejected(Vec<usize>),
}

impl ClientError {
    /// Whether the error is the terminal closed state.
    pub fn is_closed(&self) -> bool {
        matches!(self, ClientError::Closed)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
