use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::trace;

use crate::bitfield::Bitfield;
use crate::connection::{ConnectionId, PeerSpeed};
use crate::picker::{PieceBlock, PieceState};
use crate::swarm::SwarmContext;

/// Picks blocks for an unchoked peer with room in its request window and
/// queues them on the connection.
///
/// Candidates come from the piece picker, restricted to the peer's
/// allowed-fast set while it has us choked. Blocks some other peer is
/// already downloading are set aside as "busy"; if the request window still
/// has room after the fresh picks, the busy block with the fewest peers on
/// it is requested once more to race the slowest holder. The case this
/// matters for is two peers needing the same last piece: without the race
/// they fight over who requests it and the tail of the torrent stalls on
/// the slower one.
pub(crate) fn request_a_block(rng: &mut StdRng, ctx: &mut dyn SwarmContext, conn: ConnectionId) {
    if ctx.is_seed() {
        return;
    }
    let Some(c) = ctx.connection(conn) else {
        return;
    };
    if c.no_download() {
        return;
    }

    let mut num_requests = c.desired_queue_size() as i64
        - c.download_queue().len() as i64
        - c.request_queue().len() as i64;

    trace!(num_requests, "picking blocks");

    // if our request queue is already full, we
    // don't have to make any new requests yet
    if num_requests <= 0 {
        return;
    }

    let mut prefer_whole_pieces = c.prefer_whole_pieces();
    if prefer_whole_pieces == 0 {
        let rate = c.download_payload_rate() as u64;
        let threshold = ctx.settings().whole_pieces_threshold as u64;
        prefer_whole_pieces = u32::from(rate * threshold > ctx.piece_length() as u64);
    }

    let state = match c.peer_speed() {
        PeerSpeed::Fast => PieceState::Fast,
        PeerSpeed::Medium => PieceState::Medium,
        PeerSpeed::Slow => PieceState::Slow,
    };

    let bits = c.bitfield().clone();
    let choked = c.has_peer_choked();
    let allowed_fast = c.allowed_fast().to_vec();
    let suggested = c.suggested_pieces().to_vec();
    let download_queue = c.download_queue().to_vec();
    let request_queue = c.request_queue().to_vec();
    let options = c.picker_options();
    let peer = c.record();

    // while choked we can only pick from the allowed fast set
    let mask = if choked {
        let mut mask = Bitfield::new(bits.len());
        for &piece in &allowed_fast {
            if bits.has(piece as usize) {
                mask.set(piece as usize);
            }
        }
        mask
    } else {
        bits
    };

    let Some(picker) = ctx.picker() else {
        return;
    };

    // with prefer_whole_pieces set the picker will pick at least the number
    // of blocks we ask for, but may overshoot to complete whole pieces
    let mut interesting_pieces = Vec::with_capacity(100);
    picker.pick_pieces(
        &mask,
        &mut interesting_pieces,
        num_requests as usize,
        prefer_whole_pieces,
        peer,
        state,
        options,
        &suggested,
    );

    trace!(
        prefer_whole_pieces,
        picked = interesting_pieces.len(),
        "picker returned"
    );

    // blocks some other peer is currently downloading; kept aside in case
    // we end up with spare window to race one of them
    let mut busy_pieces: Vec<PieceBlock> = Vec::with_capacity(num_requests as usize);
    let mut to_request: Vec<PieceBlock> = Vec::new();

    let queued = |b: &PieceBlock, extra: &[PieceBlock]| {
        download_queue.contains(b) || request_queue.contains(b) || extra.contains(b)
    };

    for block in &interesting_pieces {
        if prefer_whole_pieces == 0 && num_requests <= 0 {
            break;
        }

        if picker.is_requested(*block) {
            if num_requests <= 0 {
                break;
            }
            // don't request blocks we already have in our queues
            if queued(block, &to_request) {
                continue;
            }
            busy_pieces.push(*block);
            continue;
        }

        if queued(block, &to_request) {
            continue;
        }

        // a block nobody else is downloading; take it
        to_request.push(*block);
        num_requests -= 1;
    }

    let race = if !busy_pieces.is_empty() && num_requests > 0 {
        // all blocks with the same number of peers on them are equally
        // good, so shuffle before taking the minimum to pick a random one
        busy_pieces.shuffle(rng);
        busy_pieces
            .iter()
            .copied()
            .min_by_key(|b| picker.num_peers(*b))
    } else {
        None
    };

    let Some(c) = ctx.connection_mut(conn) else {
        return;
    };
    for block in to_request {
        c.add_request(block);
    }
    if let Some(block) = race {
        trace!(piece = block.piece, block = block.block, "racing busy block");
        c.add_request(block);
    }
}
