//! Interface to the piece picker.
//!
//! The picker itself lives with the torrent; the policy engine only asks it
//! for candidate blocks and tells it when a peer record goes away.

use crate::bitfield::Bitfield;
use crate::policy::PeerKey;

/// One block of a piece, the unit of request on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceBlock {
    pub piece: u32,
    pub block: u32,
}

impl PieceBlock {
    pub fn new(piece: u32, block: u32) -> Self {
        Self { piece, block }
    }
}

/// The picker's notion of how fast a downloading piece's peers are.
///
/// The picker groups partially-downloaded pieces by this state so that fast
/// peers finish what fast peers started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Slow,
    Medium,
    Fast,
}

/// The slice of the piece picker the policy engine talks to.
pub trait PiecePicker {
    /// Fills `out` with blocks to request from a peer whose availability is
    /// `mask`.
    ///
    /// At least `num_blocks` blocks are returned when that many are
    /// available. With `prefer_whole_pieces > 0` the picker may overshoot so
    /// the picked blocks come from whole pieces. `suggested` pieces are
    /// considered first.
    #[allow(clippy::too_many_arguments)]
    fn pick_pieces(
        &self,
        mask: &Bitfield,
        out: &mut Vec<PieceBlock>,
        num_blocks: usize,
        prefer_whole_pieces: u32,
        peer: Option<PeerKey>,
        state: PieceState,
        options: u32,
        suggested: &[u32],
    );

    /// Returns true if `block` is currently requested from any peer.
    fn is_requested(&self, block: PieceBlock) -> bool;

    /// Number of peers `block` is currently requested from.
    fn num_peers(&self, block: PieceBlock) -> usize;

    /// Drops every block-to-peer reference the picker holds for `peer`.
    ///
    /// Must be called before the record behind `peer` is destroyed.
    fn clear_peer(&mut self, peer: PeerKey);
}
