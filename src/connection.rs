//! Interface to a live peer connection.
//!
//! Connections are owned by the session; the policy engine refers to them by
//! [`ConnectionId`] and reaches them through [`SwarmContext`].
//!
//! [`SwarmContext`]: crate::swarm::SwarmContext

use std::io;
use std::net::SocketAddr;

use crate::bitfield::Bitfield;
use crate::picker::PieceBlock;
use crate::policy::PeerKey;

/// Handle to a live peer connection.
///
/// The engine never owns the connection behind a handle; a stale handle
/// simply resolves to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(usize);

impl ConnectionId {
    pub fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> usize {
        self.0
    }
}

/// Download-rate class of a peer, as measured by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSpeed {
    Slow,
    Medium,
    Fast,
}

/// The slice of a peer connection the policy engine talks to.
///
/// All operations are non-blocking; `disconnect` and the `send_*` calls only
/// queue work, and completion is reported back through the session event
/// loop (`Policy::connection_closed` and friends).
pub trait PeerConnection {
    /// The remote endpoint this connection was opened to or accepted from.
    fn remote(&self) -> SocketAddr;

    /// The socket's local endpoint. Fails if the socket is already gone.
    fn socket_local_endpoint(&self) -> io::Result<SocketAddr>;

    /// The socket's remote endpoint. Fails if the socket is already gone.
    fn socket_remote_endpoint(&self) -> io::Result<SocketAddr>;

    /// Starts closing the connection, with a human-readable reason.
    fn disconnect(&mut self, reason: &str);

    /// True if we are choking the peer.
    fn is_choked(&self) -> bool;

    /// True if the peer is choking us.
    fn has_peer_choked(&self) -> bool;

    /// True if the peer is interested in our pieces.
    fn is_peer_interested(&self) -> bool;

    /// True if we are interested in the peer's pieces.
    fn is_interesting(&self) -> bool;

    /// True if we initiated this connection.
    fn is_local(&self) -> bool;

    /// True if the peer has the complete torrent.
    fn is_seed(&self) -> bool {
        false
    }

    /// True while the outbound TCP connect is still in flight.
    fn is_connecting(&self) -> bool {
        false
    }

    /// True if the connection ended in an error rather than a clean close.
    fn failed(&self) -> bool {
        false
    }

    /// True if this is a reconnect soon enough after a drop that it must not
    /// reset the reconnect backoff timer.
    fn fast_reconnect(&self) -> bool {
        false
    }

    /// True until the wire handshake has completed.
    fn in_handshake(&self) -> bool {
        false
    }

    /// True if this connection is exempt from the session's upload-slot
    /// accounting.
    fn ignore_unchoke_slots(&self) -> bool {
        false
    }

    /// True if this connection is configured to never download.
    fn no_download(&self) -> bool {
        false
    }

    fn peer_speed(&self) -> PeerSpeed {
        PeerSpeed::Slow
    }

    /// Number of outstanding requests this connection wants to keep.
    fn desired_queue_size(&self) -> usize;

    /// Blocks requested and on the wire.
    fn download_queue(&self) -> &[PieceBlock];

    /// Blocks queued locally but not yet sent.
    fn request_queue(&self) -> &[PieceBlock];

    /// Pieces the peer allows us to request while it has us choked.
    fn allowed_fast(&self) -> &[u32];

    /// Pieces the peer has suggested we download.
    fn suggested_pieces(&self) -> &[u32] {
        &[]
    }

    /// The peer's piece availability.
    fn bitfield(&self) -> &Bitfield;

    /// Explicit whole-piece override; zero means let the policy decide.
    fn prefer_whole_pieces(&self) -> u32 {
        0
    }

    /// Opaque option bits passed through to the piece picker.
    fn picker_options(&self) -> u32 {
        0
    }

    /// Measured payload download rate, bytes per second.
    fn download_payload_rate(&self) -> u32;

    /// Payload bytes received over the lifetime of this connection.
    fn total_payload_download(&self) -> u64;

    /// Payload bytes sent over the lifetime of this connection.
    fn total_payload_upload(&self) -> u64;

    /// Signed payload balance: bytes we sent minus bytes we received.
    fn share_diff(&self) -> i64;

    /// Adjusts the peer's free-upload credit bucket.
    fn add_free_upload(&mut self, delta: i64);

    /// Seeds the connection's byte counters from a previous connection to
    /// the same peer.
    fn add_stat(&mut self, downloaded: u64, uploaded: u64);

    /// Queues an `interested` message.
    fn send_interested(&mut self);

    /// Flushes the request queue onto the wire.
    fn send_block_requests(&mut self);

    /// Appends a block to the request queue.
    fn add_request(&mut self, block: PieceBlock);

    /// The peer record this connection is attached to, if any.
    fn record(&self) -> Option<PeerKey>;

    /// Attaches or detaches the peer record back-reference.
    fn set_record(&mut self, key: Option<PeerKey>);
}
