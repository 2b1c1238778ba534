use crate::swarm::SwarmContext;

/// Collects surplus upload credit from peers we over-served and don't need
/// to reward.
///
/// A peer that is interested in us may yet trade its surplus back, so only
/// uninterested peers with a positive share diff are collected from. Returns
/// the collected total.
pub(crate) fn collect_free_download(ctx: &mut dyn SwarmContext) -> i64 {
    let mut accumulator = 0;
    for id in ctx.connections() {
        let Some(conn) = ctx.connection(id) else {
            continue;
        };
        let diff = conn.share_diff();
        if conn.is_peer_interested() || diff <= 0 {
            continue;
        }
        if let Some(conn) = ctx.connection_mut(id) {
            conn.add_free_upload(-diff);
            accumulator += diff;
        }
    }
    accumulator
}

/// Spreads `free_upload` across the peers that are net senders to us,
/// returning whatever credit is left over.
///
/// Eligible peers are those interested in us with a negative share diff.
/// The per-peer share shrinks when the swarm as a whole owes us
/// (`total_diff` negative), so the pool is not exhausted rewarding peers the
/// ratio math will reward anyway.
pub(crate) fn distribute_free_upload(ctx: &mut dyn SwarmContext, mut free_upload: i64) -> i64 {
    if free_upload <= 0 {
        return free_upload;
    }

    let mut num_peers = 0i64;
    let mut total_diff = 0i64;
    for id in ctx.connections() {
        let Some(conn) = ctx.connection(id) else {
            continue;
        };
        let diff = conn.share_diff();
        total_diff += diff;
        if !conn.is_peer_interested() || diff >= 0 {
            continue;
        }
        num_peers += 1;
    }

    if num_peers == 0 {
        return free_upload;
    }

    let upload_share = if total_diff >= 0 {
        free_upload.min(total_diff) / num_peers
    } else {
        (free_upload + total_diff) / num_peers
    };
    if upload_share < 0 {
        return free_upload;
    }

    for id in ctx.connections() {
        let Some(conn) = ctx.connection(id) else {
            continue;
        };
        if !conn.is_peer_interested() || conn.share_diff() >= 0 {
            continue;
        }
        if let Some(conn) = ctx.connection_mut(id) {
            conn.add_free_upload(upload_share);
            free_upload -= upload_share;
        }
    }
    free_upload
}
