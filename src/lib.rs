//! rpeer - Peer policy engine for a BitTorrent client
//!
//! This library implements the per-torrent peer policy: the bounded
//! directory of known peers, outbound connect-candidate selection, incoming
//! connection admission, block-request scheduling, and free-upload
//! accounting for share-ratio enforcement.
//!
//! The engine is a library with no wire protocol of its own. The torrent,
//! the session, the piece picker, and the live peer connections are
//! collaborators reached through traits; the session event loop drives the
//! engine and everything is non-blocking.
//!
//! # Modules
//!
//! - [`policy`] - The policy engine, peer records, and rankings
//! - [`bitfield`] - Piece-availability bitfield
//! - [`config`] - Tunables
//! - [`connection`] - Peer-connection collaborator interface
//! - [`picker`] - Piece-picker collaborator interface
//! - [`swarm`] - Torrent/session collaborator interface

pub mod bitfield;
pub mod config;
pub mod connection;
pub mod picker;
pub mod policy;
pub mod swarm;

pub use bitfield::Bitfield;
pub use config::{PolicySettings, FREE_UPLOAD_AMOUNT};
pub use connection::{ConnectionId, PeerConnection, PeerSpeed};
pub use picker::{PieceBlock, PiecePicker, PieceState};
pub use policy::{
    source_rank, AddPeerFlags, PeerKey, PeerRecord, PeerSource, Policy, PolicyError,
};
pub use swarm::SwarmContext;
