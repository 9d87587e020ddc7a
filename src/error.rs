//! Error types for the Tor client core
//!
//! One crate-wide error enum, grouped the way failures propagate:
//! transient network errors are retried by the proxy with another guard,
//! protocol errors kill the link, cryptographic errors kill the circuit,
//! remote teardown surfaces the peer's reason byte, and user errors go
//! straight back to the caller.

use crate::protocol::cell::{DestroyReason, EndReason};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Main error type for the Tor client core
#[derive(Error, Debug)]
pub enum TorError {
    // ===== Transient link errors =====
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    // ===== Protocol errors =====
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no link protocol version in common with peer")]
    LinkProtocolUnsupported,

    #[error("variable cell length {0} exceeds limit")]
    OversizedVariable(usize),

    #[error("certificate rejected: {0}")]
    Certificate(String),

    #[error("link connection closed")]
    LinkClosed,

    // ===== Cryptographic errors =====
    #[error("ntor handshake authentication mismatch")]
    NtorAuthMismatch,

    #[error("relay cell not recognized at any hop")]
    DigestMismatch,

    #[error("circuit failed at hop {hop_index}: {reason}")]
    CircuitFailure { hop_index: usize, reason: String },

    #[error("stream id space exhausted on circuit")]
    StreamIdExhausted,

    // ===== Remote teardown =====
    #[error("circuit destroyed by peer: {0}")]
    CircuitDestroyed(DestroyReason),

    #[error("stream closed by peer: {0}")]
    StreamClosed(EndReason),

    #[error("circuit is closed")]
    CircuitClosed,

    // ===== User errors =====
    #[error("invalid host: {0}")]
    InvalidHost(String),

    #[error("invalid relay descriptor: {0}")]
    InvalidDescriptor(String),

    // ===== Internal =====
    #[error("internal error: {0}")]
    Internal(String),
}

impl TorError {
    /// True for failures the proxy recovers from by re-selecting a guard.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TorError::Io(_) | TorError::Tls(_) | TorError::Timeout(_)
        )
    }

    /// True for failures that must kill the whole link, not just a circuit.
    pub fn kills_link(&self) -> bool {
        matches!(
            self,
            TorError::Protocol(_)
                | TorError::LinkProtocolUnsupported
                | TorError::OversizedVariable(_)
                | TorError::Certificate(_)
        )
    }
}
