//! Policy tunables.

/// Free-upload credit a peer may run down before an interest-triggered
/// unchoke request is withheld: four 16 KiB blocks.
pub const FREE_UPLOAD_AMOUNT: i64 = 4 * 16 * 1024;

/// Per-torrent tunables read by the policy engine.
#[derive(Debug, Clone)]
pub struct PolicySettings {
    /// Upper bound on the peer directory. Zero means unbounded.
    pub max_peerlist_size: usize,

    /// Directory bound applied while the torrent is paused.
    pub max_paused_peerlist_size: usize,

    /// Consecutive failed connect attempts after which a peer stops being a
    /// connect candidate.
    pub max_failcount: u8,

    /// Base reconnect backoff in seconds, scaled by `failcount + 1`.
    pub min_reconnect_time: u32,

    /// Seconds-worth of a peer's download rate that must exceed the piece
    /// length before requests to it prefer whole pieces.
    pub whole_pieces_threshold: u32,

    /// Keep one record per `(address, port)` instead of one per address.
    pub allow_multiple_connections_per_ip: bool,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            max_peerlist_size: 4000,
            max_paused_peerlist_size: 4000,
            max_failcount: 3,
            min_reconnect_time: 60,
            whole_pieces_threshold: 20,
            allow_multiple_connections_per_ip: false,
        }
    }
}
