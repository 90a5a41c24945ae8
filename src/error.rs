//! Error types for the transaction-server connection layer.

use thiserror::Error;

/// Errors surfaced by the connection layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranServerError {
    /// A `host:port` entry in the page-server hosts configuration is
    /// malformed (missing colon, empty host, or port outside `[1, 65535]`).
    #[error("malformed page server host entry: {0:?}")]
    HostPortParameter(String),

    /// The page-server hosts configuration is empty while remote storage
    /// is required.
    #[error("page server hosts configuration is empty while remote storage is required")]
    EmptyPageServerHostsConfig,

    /// A single TCP connect or type-echo handshake attempt failed.
    #[error("could not establish a connection to page server {0}")]
    NetPageServerConnection(String),

    /// No page server accepted a connection during boot although remote
    /// storage is required.
    #[error("no page server could be reached during boot")]
    NoPageServerConnection,

    /// No connected page server exists right now; main-connection rotation
    /// found no candidate.
    #[error("no page server is currently available")]
    NoPageServerAvailable,

    /// A request could not be delivered: the handler is not connected or
    /// the round-trip failed.
    #[error("page server cannot be reached")]
    PageServerCannotBeReached,

    /// A wire payload could not be encoded or decoded.
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

/// Convenience result type for connection-layer operations.
pub type Result<T> = std::result::Result<T, TranServerError>;

/// Channel-level error codes fed to the send/recv error callbacks of a
/// [`Conn`](crate::conn::Conn).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommError {
    /// The underlying socket was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// A read from the channel failed.
    #[error("channel read failed")]
    ReadFailed,

    /// A write to the channel failed.
    #[error("channel write failed")]
    WriteFailed,

    /// Communication was stopped locally while the operation was in flight.
    #[error("communication aborted")]
    Aborted,
}
