//! Interface to the torrent and the session.
//!
//! The policy engine runs on the session event loop and owns nothing but its
//! peer directory. Everything else — the torrent's state, the session's
//! filters and caps, the piece picker, and the live connections — is reached
//! through this trait, passed into each operation by the caller.

use std::net::{IpAddr, SocketAddr};

use crate::config::PolicySettings;
use crate::connection::{ConnectionId, PeerConnection};
use crate::picker::PiecePicker;
use crate::policy::PeerKey;

/// The merged torrent + session surface the policy engine calls into.
///
/// All operations are non-blocking; anything that does I/O (dialing,
/// DHT pings, alert posts) is queued by the implementation and completes
/// later via events delivered on the same thread.
pub trait SwarmContext {
    /// The torrent's policy tunables.
    fn settings(&self) -> &PolicySettings;

    fn is_paused(&self) -> bool;

    /// True once the torrent has every piece it wants.
    fn is_finished(&self) -> bool;

    /// True once the torrent has every piece.
    fn is_seed(&self) -> bool;

    /// The torrent's share-ratio target. Zero means infinite: free-upload
    /// accounting is bypassed entirely.
    fn ratio(&self) -> f32;

    /// Piece size of the torrent, in bytes.
    fn piece_length(&self) -> u32;

    /// The piece picker, present while the torrent is downloading.
    fn picker(&self) -> Option<&dyn PiecePicker>;

    fn picker_mut(&mut self) -> Option<&mut dyn PiecePicker>;

    /// Number of live connections in this torrent's swarm.
    fn num_swarm_connections(&self) -> usize;

    /// This torrent's connection cap.
    fn max_swarm_connections(&self) -> usize;

    /// True if the torrent wants another outbound connection slot filled.
    fn want_more_peers(&self) -> bool;

    /// Dials the peer behind `peer`. Returns the handle of the new
    /// connection, or `None` if the dial was refused outright.
    fn connect_to_peer(&mut self, peer: PeerKey) -> Option<ConnectionId>;

    /// Address of the tracker currently in use, for the NAT-check override.
    fn current_tracker(&self) -> Option<SocketAddr> {
        None
    }

    /// Number of connections across the whole session.
    fn num_session_connections(&self) -> usize;

    /// The session-wide connection cap.
    fn max_session_connections(&self) -> usize;

    /// Number of unchoked peers across the whole session.
    fn num_uploads(&self) -> usize;

    /// The session-wide unchoke-slot cap.
    fn max_uploads(&self) -> usize;

    /// Asks the session's unchoke scheduler to unchoke `conn`.
    fn unchoke_peer(&mut self, conn: ConnectionId);

    /// Our external address as learned from peers and trackers, if any.
    fn external_address(&self) -> Option<IpAddr> {
        None
    }

    /// True if the session's IP filter blocks `addr`.
    fn ip_blocked(&self, addr: IpAddr) -> bool;

    /// True if the session's port filter blocks `port`.
    fn port_blocked(&self, port: u16) -> bool;

    /// Posts a peer-blocked observation to the session's alert stream.
    fn post_peer_blocked(&mut self, addr: IpAddr) {
        let _ = addr;
    }

    fn dht_enabled(&self) -> bool {
        false
    }

    /// Queues a DHT bootstrap ping to `node`.
    fn add_dht_node(&mut self, node: SocketAddr) {
        let _ = node;
    }

    /// True if an autonomous-system database is loaded.
    fn has_as_db(&self) -> bool {
        false
    }

    /// Autonomous-system number for `addr`, if the database knows it.
    fn as_for_ip(&self, addr: IpAddr) -> Option<u32> {
        let _ = addr;
        None
    }

    /// Resolves a connection handle. Stale handles resolve to `None`.
    fn connection(&self, id: ConnectionId) -> Option<&dyn PeerConnection>;

    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut dyn PeerConnection>;

    /// Handles of the live connections in this torrent's swarm.
    fn connections(&self) -> Vec<ConnectionId>;
}
