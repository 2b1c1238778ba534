use std::net::{IpAddr, SocketAddr};

use crate::connection::ConnectionId;

/// Bitmask over the mechanisms that reported a peer to us.
///
/// A record accumulates a bit per source that mentioned the peer; the
/// combination feeds [`source_rank`] when choosing whom to dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerSource(u8);

impl PeerSource {
    pub const TRACKER: PeerSource = PeerSource(0x1);
    pub const DHT: PeerSource = PeerSource(0x2);
    pub const PEX: PeerSource = PeerSource(0x4);
    pub const LSD: PeerSource = PeerSource(0x8);
    pub const RESUME_DATA: PeerSource = PeerSource(0x10);
    pub const INCOMING: PeerSource = PeerSource(0x20);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: PeerSource) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PeerSource) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for PeerSource {
    type Output = PeerSource;

    fn bitor(self, rhs: PeerSource) -> PeerSource {
        PeerSource(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PeerSource {
    fn bitor_assign(&mut self, rhs: PeerSource) {
        self.0 |= rhs.0;
    }
}

/// Trust score for a peer's discovery sources.
///
/// We have an affinity for peers with higher rank, to keep the candidate
/// pool from being diluted by stale entries (resume data in particular).
pub fn source_rank(source: PeerSource) -> u32 {
    let mut rank = 0;
    if source.contains(PeerSource::TRACKER) {
        rank |= 1 << 5;
    }
    if source.contains(PeerSource::LSD) {
        rank |= 1 << 4;
    }
    if source.contains(PeerSource::DHT) {
        rank |= 1 << 3;
    }
    if source.contains(PeerSource::PEX) {
        rank |= 1 << 2;
    }
    rank
}

/// Caller-provided knowledge about a peer handed to `add_peer`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddPeerFlags {
    /// The peer is known to support protocol encryption.
    pub encryption: bool,
    /// The peer is known to have the complete torrent.
    pub seed: bool,
}

impl AddPeerFlags {
    /// Decodes flags from the wire byte (bit 0 encryption, bit 1 seed).
    pub fn from_byte(b: u8) -> Self {
        Self {
            encryption: b & 0x01 != 0,
            seed: b & 0x02 != 0,
        }
    }
}

/// One entry in the peer directory.
///
/// Records are owned by the [`Policy`] and referred to by stable
/// [`PeerKey`] handles. The `connection` field is a non-owning handle to a
/// connection owned by the session; `connection_closed` clears it and folds
/// the connection's byte counters into `prev_amount_*`.
///
/// [`Policy`]: crate::policy::Policy
/// [`PeerKey`]: crate::policy::PeerKey
#[derive(Debug, Clone)]
pub struct PeerRecord {
    addr: IpAddr,
    pub port: u16,

    /// Live connection, when one is attached. While set, the
    /// `prev_amount_*` counters are zero and the connection carries the
    /// running totals.
    pub connection: Option<ConnectionId>,

    /// Payload bytes sent to this peer over previous connections.
    pub prev_amount_upload: u64,
    /// Payload bytes received from this peer over previous connections.
    pub prev_amount_download: u64,

    /// Session time (seconds) of the last connect attempt or connect.
    /// Zero means never tried.
    pub last_connected: u32,
    /// Session time the session unchoker last picked this peer
    /// optimistically.
    pub last_optimistically_unchoked: u32,

    /// Consecutive failed connect attempts. Saturates at 31.
    pub failcount: u8,
    /// Piece-hash failures attributed to this peer.
    pub hashfails: u8,
    /// Reserved for future peer scoring; carried for resume-data
    /// compatibility.
    pub trust_points: i8,
    /// Reconnects soon enough after a drop that the backoff timer was not
    /// reset. Maintained by the connection layer.
    pub fast_reconnects: u8,

    pub source: PeerSource,

    /// Autonomous-system number, when a database is loaded.
    pub inet_as: Option<u32>,

    /// True iff we know an address we can dial. Pure-inbound peers stay
    /// unconnectable until they tell us their listen port.
    pub connectable: bool,
    /// True iff the peer has the complete torrent.
    pub seed: bool,
    /// Never dial, refuse inbound.
    pub banned: bool,
    /// Stricter block-level admission after hash failures.
    pub on_parole: bool,
    /// Owned by the session unchoker.
    pub optimistically_unchoked: bool,
    /// The peer supports protocol encryption.
    pub pe_support: bool,
    /// A DHT bootstrap ping has been issued for this peer.
    pub added_to_dht: bool,
    /// Storage-variant tag: the address is IPv6.
    pub is_v6_addr: bool,
}

impl PeerRecord {
    pub fn new(remote: SocketAddr, connectable: bool, source: PeerSource) -> Self {
        Self {
            addr: remote.ip(),
            port: remote.port(),
            connection: None,
            prev_amount_upload: 0,
            prev_amount_download: 0,
            last_connected: 0,
            last_optimistically_unchoked: 0,
            failcount: 0,
            hashfails: 0,
            trust_points: 0,
            fast_reconnects: 0,
            source,
            inet_as: None,
            connectable,
            seed: false,
            banned: false,
            on_parole: false,
            optimistically_unchoked: false,
            pe_support: true,
            added_to_dht: false,
            is_v6_addr: remote.is_ipv6(),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.addr
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}
