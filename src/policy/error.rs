use thiserror::Error;

/// Why a peer or connection was refused admission.
///
/// The error text doubles as the reason string handed to
/// `PeerConnection::disconnect` when a live connection is being refused.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The endpoint has a zero address or port.
    #[error("invalid peer endpoint")]
    InvalidEndpoint,

    /// The session's port filter blocks the peer's port.
    #[error("peer port blocked by port filter")]
    PortBlocked,

    /// The session's IP filter blocks the peer's address.
    #[error("peer banned by IP filter")]
    IpBlocked,

    /// The peer record is marked banned.
    #[error("ip address banned, closing")]
    Banned,

    /// Swarm and session connection caps are both exhausted.
    #[error("too many connections, refusing incoming connection")]
    TooManyConnections,

    /// The remote endpoint turned out to be our own listen socket.
    #[error("connected to ourselves")]
    SelfConnection,

    /// A connection to this peer already exists and wins the tie-break.
    #[error("duplicate connection, closing")]
    DuplicateConnection,

    /// The peer directory is at its configured maximum.
    #[error("peer list size exceeded, refusing incoming connection")]
    PeerListFull,

    /// Querying a socket endpoint failed; fatal to that connection only.
    #[error("socket endpoint error: {0}")]
    Endpoint(#[from] std::io::Error),
}
