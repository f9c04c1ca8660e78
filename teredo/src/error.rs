use std::io;

use thiserror::Error;

/// Error categories surfaced to callers of the tunnel engine.
///
/// The engine never lets a packet-processing error escape a callback or
/// cross a thread boundary: everything that can go wrong while classifying
/// a datagram degrades to a drop (plus, where it applies, an ICMPv6
/// unreachable callback). `TeredoError` is only returned from the
/// configuration-time and `transmit` entry points.
#[derive(Error, Debug)]
pub enum TeredoError {
    #[error("tunnel setter called after run_async() or transmit()")]
    ConfigurationRefused,

    #[error("failed to bind Teredo UDP socket")]
    BindFailed(#[source] io::Error),

    #[error("failed to create Teredo UDP socket")]
    SocketCreate(#[source] io::Error),

    #[error("peer list or tunnel allocation exhausted")]
    ResourceExhausted,

    #[error("persistent UDP send failure")]
    NetworkError(#[source] io::Error),

    /// Internal only: never returned from a public API, only used to decide
    /// whether `transmit` should emit an ICMPv6 unreachable callback.
    #[error("tunnel is not qualified")]
    NotQualified,
}

pub type Result<T> = std::result::Result<T, TeredoError>;
