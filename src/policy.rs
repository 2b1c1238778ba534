//! Per-torrent peer policy.
//!
//! One [`Policy`] per torrent keeps the directory of known peers, decides
//! which of them to dial and which incoming connections to accept, picks
//! blocks to request from unchoked peers, and shuffles free upload credit
//! around to hold the torrent's share ratio.
//!
//! The engine runs on the session event loop and is not thread-safe. It
//! owns nothing but its peer records; the torrent, the session, the piece
//! picker, and the live connections are reached through the
//! [`SwarmContext`] passed into every operation. Nothing here blocks:
//! dialing, DHT pings, and alert posts are queued by the context and
//! complete later as events on the same thread.
//!
//! Peer records are handed out as stable [`PeerKey`] handles. A record and
//! its live connection reference each other through handles, never
//! ownership: the session owns connections, the policy owns records, and
//! [`Policy::connection_closed`] severs the link from both sides.

mod error;
mod pool;
mod rank;
mod record;
mod request;
mod upload;

pub use error::PolicyError;
pub use pool::PeerKey;
pub use record::{source_rank, AddPeerFlags, PeerRecord, PeerSource};


use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::FREE_UPLOAD_AMOUNT;
use crate::connection::ConnectionId;
use crate::swarm::SwarmContext;
use pool::PeerPool;

/// `failcount` is persisted as a 5-bit field.
const FAILCOUNT_CAP: u8 = 31;

/// Most records one eviction or candidate sweep will look at, so a tick
/// stays cheap no matter how large the directory grows.
const MAX_SWEEP: usize = 300;

/// The peer policy engine for one torrent.
///
/// The directory is kept sorted by address. With
/// `allow_multiple_connections_per_ip` records sharing an address sit
/// adjacent and `(address, port)` is unique; otherwise the address alone is
/// unique.
pub struct Policy {
    pool: PeerPool,
    peers: Vec<PeerKey>,
    round_robin: usize,
    available_free_upload: i64,
    num_connect_candidates: usize,
    num_seeds: usize,
    finished: bool,
    rng: StdRng,
}

impl Policy {
    pub fn new() -> Self {
        Self::with_rng(StdRng::seed_from_u64(rand::rng().random()))
    }

    /// Creates an engine with a seeded RNG, so eviction sweeps, external-IP
    /// substitution, and busy-block races are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            pool: PeerPool::new(),
            peers: Vec::new(),
            round_robin: 0,
            available_free_upload: 0,
            num_connect_candidates: 0,
            num_seeds: 0,
            finished: false,
            rng,
        }
    }

    /// Number of records in the directory.
    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    /// Number of records we would dial right now given a slot.
    pub fn num_connect_candidates(&self) -> usize {
        self.num_connect_candidates
    }

    /// Number of records known to have the complete torrent.
    pub fn num_seeds(&self) -> usize {
        self.num_seeds
    }

    /// Upload credit collected from over-served peers and not yet
    /// redistributed.
    pub fn available_free_upload(&self) -> i64 {
        self.available_free_upload
    }

    pub fn peer(&self, key: PeerKey) -> Option<&PeerRecord> {
        self.pool.get(key)
    }

    /// Keys of every record, in directory (address) order.
    pub fn peers(&self) -> impl Iterator<Item = PeerKey> + '_ {
        self.peers.iter().copied()
    }

    /// The records with exactly this address: one when multiple connections
    /// per IP are off, otherwise a contiguous run.
    pub fn find_peers(&self, addr: IpAddr) -> &[PeerKey] {
        let lo = self.lower_bound(addr);
        let hi = self.upper_bound(addr);
        &self.peers[lo..hi]
    }

    /// Total payload received from this peer, over the live connection if
    /// one is attached.
    pub fn total_download(&self, ctx: &dyn SwarmContext, key: PeerKey) -> u64 {
        let Some(rec) = self.pool.get(key) else {
            return 0;
        };
        match rec.connection.and_then(|id| ctx.connection(id)) {
            Some(conn) => conn.total_payload_download(),
            None => rec.prev_amount_download,
        }
    }

    /// Total payload sent to this peer, over the live connection if one is
    /// attached.
    pub fn total_upload(&self, ctx: &dyn SwarmContext, key: PeerKey) -> u64 {
        let Some(rec) = self.pool.get(key) else {
            return 0;
        };
        match rec.connection.and_then(|id| ctx.connection(id)) {
            Some(conn) => conn.total_payload_upload(),
            None => rec.prev_amount_upload,
        }
    }

    /// Marks a record as (not) having the complete torrent, keeping the
    /// seed and connect-candidate counters exact.
    pub fn set_seed(&mut self, ctx: &dyn SwarmContext, key: PeerKey, seed: bool) {
        let Some(rec) = self.pool.get(key) else {
            return;
        };
        if rec.seed == seed {
            return;
        }
        let was_candidate = self.is_connect_candidate(rec, ctx);
        if let Some(rec) = self.pool.get_mut(key) {
            rec.seed = seed;
        }
        if seed {
            self.num_seeds += 1;
        } else {
            self.num_seeds -= 1;
        }
        self.adjust_candidate_count(ctx, key, was_candidate);
    }

    /// Marks a record banned or unbanned, keeping the connect-candidate
    /// counter exact. Banning does not disconnect by itself.
    pub fn set_banned(&mut self, ctx: &dyn SwarmContext, key: PeerKey, banned: bool) {
        let Some(rec) = self.pool.get(key) else {
            return;
        };
        let was_candidate = self.is_connect_candidate(rec, ctx);
        if let Some(rec) = self.pool.get_mut(key) {
            rec.banned = banned;
        }
        self.adjust_candidate_count(ctx, key, was_candidate);
    }

    /// Records the session unchoker's optimistic pick. The flag and the
    /// timestamp belong to the unchoker; the policy only clears the flag
    /// when the connection goes away.
    pub fn set_optimistically_unchoked(&mut self, key: PeerKey, value: bool, session_time: u32) {
        if let Some(rec) = self.pool.get_mut(key) {
            rec.optimistically_unchoked = value;
            if value {
                rec.last_optimistically_unchoked = session_time;
            }
        }
    }

    /// Adds or refreshes a record from an external peer source.
    ///
    /// An existing record is marked connectable, has its port refreshed and
    /// the source bit OR'd in; a tracker re-add forgives one connect
    /// failure, and a seed flag promotes the record when no live connection
    /// knows better. A new record may first trigger an eviction sweep when
    /// the directory is full; resume-data peers are never worth evicting
    /// for.
    pub fn add_peer(
        &mut self,
        ctx: &mut dyn SwarmContext,
        remote: SocketAddr,
        source: PeerSource,
        flags: AddPeerFlags,
    ) -> Result<PeerKey, PolicyError> {
        self.check_invariant(ctx);

        // ignore the obviously invalid entries
        if remote.ip().is_unspecified() || remote.port() == 0 {
            return Err(PolicyError::InvalidEndpoint);
        }
        if ctx.port_blocked(remote.port()) {
            ctx.post_peer_blocked(remote.ip());
            return Err(PolicyError::PortBlocked);
        }
        if ctx.ip_blocked(remote.ip()) {
            ctx.post_peer_blocked(remote.ip());
            return Err(PolicyError::IpBlocked);
        }

        let multi = ctx.settings().allow_multiple_connections_per_ip;

        let key = match self.find_index(remote, multi) {
            None => {
                let max = self.max_peerlist(ctx);
                if max != 0 && self.peers.len() >= max {
                    if source == PeerSource::RESUME_DATA {
                        return Err(PolicyError::PeerListFull);
                    }
                    self.erase_peers(ctx);
                    if self.peers.len() >= max {
                        return Err(PolicyError::PeerListFull);
                    }
                }

                let index = if multi {
                    self.upper_bound(remote.ip())
                } else {
                    self.lower_bound(remote.ip())
                };
                if self.round_robin > index {
                    self.round_robin += 1;
                }

                let mut rec = PeerRecord::new(remote, true, source);
                if flags.encryption {
                    rec.pe_support = true;
                }
                if flags.seed {
                    rec.seed = true;
                }
                rec.inet_as = ctx.as_for_ip(remote.ip());

                let key = self.pool.insert(rec);
                self.peers.insert(index, key);

                if flags.seed {
                    self.num_seeds += 1;
                }
                if self
                    .pool
                    .get(key)
                    .is_some_and(|r| self.is_connect_candidate(r, ctx))
                {
                    self.num_connect_candidates += 1;
                }
                key
            }
            Some(index) => {
                let key = self.peers[index];
                let was_candidate = self
                    .pool
                    .get(key)
                    .is_some_and(|r| self.is_connect_candidate(r, ctx));

                let mut promote_seed = false;
                if let Some(rec) = self.pool.get_mut(key) {
                    rec.connectable = true;
                    rec.port = remote.port();
                    rec.source |= source;

                    // somebody else can apparently connect to this peer, so
                    // give it another chance ourselves. Only the tracker is
                    // trusted this far.
                    if rec.failcount > 0 && source == PeerSource::TRACKER {
                        rec.failcount -= 1;
                    }

                    // with a live connection we already know whether the
                    // peer is a seed and don't need to trust this source
                    if flags.seed && rec.connection.is_none() {
                        promote_seed = !rec.seed;
                        rec.seed = true;
                    }

                    if rec.connection.is_some() {
                        debug!(peer = %rec.endpoint(), "already connected to peer");
                    }
                }
                if promote_seed {
                    self.num_seeds += 1;
                }
                self.adjust_candidate_count(ctx, key, was_candidate);
                key
            }
        };

        self.check_invariant(ctx);
        Ok(key)
    }

    /// Removes a record, clearing the piece picker's references to it.
    pub fn erase_peer(&mut self, ctx: &mut dyn SwarmContext, key: PeerKey) {
        self.check_invariant(ctx);
        let Some(rec) = self.pool.get(key) else {
            return;
        };
        let addr = rec.address();
        let lo = self.lower_bound(addr);
        let hi = self.upper_bound(addr);
        let Some(index) = (lo..hi).find(|&i| self.peers[i] == key) else {
            return;
        };
        self.erase_at(ctx, index);
        self.check_invariant(ctx);
    }

    /// Eviction sweep: while the directory sits at 95% of its bound or
    /// above, scan up to 300 records from a random offset and drop the
    /// worst eraseable one. Failed resume-data peers are dropped on sight.
    pub fn erase_peers(&mut self, ctx: &mut dyn SwarmContext) {
        self.check_invariant(ctx);

        let max = self.max_peerlist(ctx);
        if max == 0 || self.peers.is_empty() {
            return;
        }

        debug_assert_eq!(self.finished, ctx.is_finished());

        let mut erase_candidate: Option<usize> = None;
        let mut cursor = self.rng.random_range(0..self.peers.len());

        for _ in 0..self.peers.len().min(MAX_SWEEP) {
            if (self.peers.len() as f64) < max as f64 * 0.95 {
                break;
            }
            if cursor >= self.peers.len() {
                cursor = 0;
            }
            let current = cursor;

            self.update_erase_candidate(ctx, current, &mut erase_candidate, None);
            cursor += 1;
        }

        if let Some(index) = erase_candidate {
            self.erase_at(ctx, index);
        }
        self.check_invariant(ctx);
    }

    /// Disconnects and removes every record the updated IP filter now
    /// blocks.
    pub fn ip_filter_updated(&mut self, ctx: &mut dyn SwarmContext) {
        self.check_invariant(ctx);
        let mut index = 0;
        while index < self.peers.len() {
            let Some(rec) = self.pool.get(self.peers[index]) else {
                index += 1;
                continue;
            };
            let addr = rec.address();
            if !ctx.ip_blocked(addr) {
                index += 1;
                continue;
            }
            let conn = rec.connection;
            if let Some(c) = conn.and_then(|id| ctx.connection_mut(id)) {
                c.disconnect(&PolicyError::IpBlocked.to_string());
            }
            ctx.post_peer_blocked(addr);
            // the next record shifts into this slot
            self.erase_at(ctx, index);
        }
        self.check_invariant(ctx);
    }

    /// Picks the best record to dial right now, or `None`.
    ///
    /// Advances the round-robin cursor up to 300 steps, sending at most one
    /// DHT bootstrap ping per call, opportunistically evicting under memory
    /// pressure, skipping records still in reconnect backoff, and keeping
    /// the best record under the connect ordering.
    pub fn find_connect_candidate(
        &mut self,
        ctx: &mut dyn SwarmContext,
        session_time: u32,
    ) -> Option<PeerKey> {
        self.check_invariant(ctx);
        debug_assert_eq!(self.finished, ctx.is_finished());

        if self.peers.is_empty() {
            return None;
        }

        let min_reconnect_time = ctx.settings().min_reconnect_time;
        let max = self.max_peerlist(ctx);
        let has_as_db = ctx.has_as_db();

        // when seeding, or before we've learned our external address,
        // substitute a random one so the CIDR tiebreak doesn't pile
        // connections onto one subnet
        let external_ip = match ctx.external_address() {
            Some(addr) if !self.finished => addr,
            _ => IpAddr::V4(Ipv4Addr::from(self.rng.random::<[u8; 4]>())),
        };

        let mut candidate: Option<usize> = None;
        let mut erase_candidate: Option<usize> = None;
        let mut pinged = false;

        for _ in 0..self.peers.len().min(MAX_SWEEP) {
            if self.peers.is_empty() {
                break;
            }
            if self.round_robin >= self.peers.len() {
                self.round_robin = 0;
            }
            let current = self.round_robin;
            let key = self.peers[current];

            // send one DHT ping per call, to probe for peers that support
            // DHT without advertising it
            if ctx.dht_enabled() && !pinged {
                if let Some(rec) = self.pool.get_mut(key) {
                    if !rec.added_to_dht {
                        ctx.add_dht_node(rec.endpoint());
                        rec.added_to_dht = true;
                        pinged = true;
                    }
                }
            }

            // if the directory is growing large, start weeding as we scan
            if max != 0 && self.peers.len() as f64 >= max as f64 * 0.95 {
                if self.update_erase_candidate(ctx, current, &mut erase_candidate, Some(&mut candidate))
                {
                    self.round_robin += 1;
                    continue;
                }
            }

            self.round_robin += 1;

            let Some(rec) = self.pool.get(key) else {
                continue;
            };
            if !self.is_connect_candidate(rec, ctx) {
                continue;
            }

            if rec.last_connected != 0
                && session_time.saturating_sub(rec.last_connected)
                    < (rec.failcount as u32 + 1) * min_reconnect_time
            {
                continue;
            }

            let better = match candidate {
                Some(best) => match self.pool.get(self.peers[best]) {
                    // keep the running best unless this record beats it
                    Some(best) => !rank::compare_peer(best, rec, external_ip, self.finished, has_as_db),
                    None => true,
                },
                None => true,
            };
            if better {
                candidate = Some(current);
            }
        }

        if let Some(index) = erase_candidate {
            if let Some(chosen) = candidate.as_mut() {
                if *chosen > index {
                    *chosen -= 1;
                }
            }
            self.erase_at(ctx, index);
        }

        let key = candidate.map(|i| self.peers[i]);
        if let Some(rec) = key.and_then(|k| self.pool.get(k)) {
            debug!(
                peer = %rec.endpoint(),
                distance = rank::cidr_distance(external_ip, rec.address()),
                since_last = session_time.saturating_sub(rec.last_connected),
                "found connect candidate"
            );
        }
        self.check_invariant(ctx);
        key
    }

    /// Dials the best connect candidate. Returns true if a dial was
    /// started.
    pub fn connect_one_peer(&mut self, ctx: &mut dyn SwarmContext, session_time: u32) -> bool {
        self.check_invariant(ctx);
        debug_assert!(ctx.want_more_peers());

        let Some(key) = self.find_connect_candidate(ctx, session_time) else {
            return false;
        };

        match ctx.connect_to_peer(key) {
            None => {
                if let Some(rec) = self.pool.get_mut(key) {
                    if rec.failcount < FAILCOUNT_CAP {
                        rec.failcount += 1;
                    }
                }
                // the bump may have pushed the record past max_failcount
                self.adjust_candidate_count(ctx, key, true);
                self.check_invariant(ctx);
                false
            }
            Some(conn) => {
                self.attach_connection(ctx, key, conn, session_time);
                // it was a candidate; with a live connection it no longer is
                self.num_connect_candidates = self.num_connect_candidates.saturating_sub(1);
                self.check_invariant(ctx);
                true
            }
        }
    }

    /// Admits or refuses an incoming connection.
    ///
    /// A refused connection is disconnected with the reason carried by the
    /// returned error. On success the connection is attached to a matching
    /// or freshly inserted record.
    pub fn new_connection(
        &mut self,
        ctx: &mut dyn SwarmContext,
        conn: ConnectionId,
        session_time: u32,
    ) -> Result<(), PolicyError> {
        self.check_invariant(ctx);
        debug_assert!(!ctx.is_paused());

        let Some(c) = ctx.connection(conn) else {
            return Err(PolicyError::InvalidEndpoint);
        };
        let remote = c.remote();

        // if the connection comes from the tracker it's probably just a
        // NAT check, so the connection caps don't apply to it
        if ctx.num_swarm_connections() >= ctx.max_swarm_connections()
            && ctx.num_session_connections() >= ctx.max_session_connections()
        {
            if ctx.current_tracker().map(|t| t.ip()) == Some(remote.ip()) {
                debug!(peer = %remote, "overriding connection limit for tracker NAT-check");
            } else {
                return Err(self.refuse(ctx, conn, PolicyError::TooManyConnections));
            }
        }

        let multi = ctx.settings().allow_multiple_connections_per_ip;

        let key = match self.find_index(remote, multi) {
            Some(index) => {
                let key = self.peers[index];
                if self.pool.get(key).is_some_and(|r| r.banned) {
                    return Err(self.refuse(ctx, conn, PolicyError::Banned));
                }

                let was_candidate = self
                    .pool
                    .get(key)
                    .is_some_and(|r| self.is_connect_candidate(r, ctx));

                if let Some(existing) = self.pool.get(key).and_then(|r| r.connection) {
                    self.resolve_duplicate(ctx, existing, conn)?;
                    // the losing connection is detached right away so its
                    // close event can't touch the record
                    if let Some(c) = ctx.connection_mut(existing) {
                        c.set_record(None);
                    }
                    if let Some(rec) = self.pool.get_mut(key) {
                        rec.connection = None;
                    }
                }

                if was_candidate {
                    self.num_connect_candidates -= 1;
                }
                key
            }
            None => {
                let max = ctx.settings().max_peerlist_size;
                if max != 0 && self.peers.len() >= max {
                    return Err(self.refuse(ctx, conn, PolicyError::PeerListFull));
                }

                let index = if multi {
                    self.upper_bound(remote.ip())
                } else {
                    self.lower_bound(remote.ip())
                };
                if self.round_robin > index {
                    self.round_robin += 1;
                }

                // all we know about this peer is its inbound endpoint;
                // it stays unconnectable until it tells us its listen port
                let mut rec = PeerRecord::new(remote, false, PeerSource::INCOMING);
                rec.inet_as = ctx.as_for_ip(remote.ip());
                let key = self.pool.insert(rec);
                self.peers.insert(index, key);
                key
            }
        };

        self.attach_connection(ctx, key, conn, session_time);
        self.check_invariant(ctx);
        Ok(())
    }

    /// Relocates a record once the peer reveals its real listen port.
    ///
    /// With multiple connections per IP, an idle record already sitting at
    /// the new endpoint is absorbed; a connected one makes this connection
    /// the duplicate.
    pub fn update_peer_port(
        &mut self,
        ctx: &mut dyn SwarmContext,
        conn: ConnectionId,
        port: u16,
        source: PeerSource,
    ) -> Result<(), PolicyError> {
        self.check_invariant(ctx);

        let Some(key) = ctx.connection(conn).and_then(|c| c.record()) else {
            return Ok(());
        };
        let Some(rec) = self.pool.get(key) else {
            return Ok(());
        };
        if rec.port == port {
            return Ok(());
        }
        let addr = rec.address();

        if ctx.settings().allow_multiple_connections_per_ip {
            let moved_to = SocketAddr::new(addr, port);
            if let Some(index) = self.find_index(moved_to, true) {
                if self.peers[index] != key {
                    let occupied = self
                        .pool
                        .get(self.peers[index])
                        .is_some_and(|r| r.connection.is_some());
                    if occupied {
                        return Err(self.refuse(ctx, conn, PolicyError::DuplicateConnection));
                    }
                    self.erase_at(ctx, index);
                }
            }
        }

        let was_candidate = self
            .pool
            .get(key)
            .is_some_and(|r| self.is_connect_candidate(r, ctx));
        if let Some(rec) = self.pool.get_mut(key) {
            rec.port = port;
            rec.source |= source;
        }
        self.adjust_candidate_count(ctx, key, was_candidate);

        self.check_invariant(ctx);
        Ok(())
    }

    /// The peer unchoked us: start requesting if it has anything we want.
    pub fn unchoked(&mut self, ctx: &mut dyn SwarmContext, conn: ConnectionId) {
        if !ctx.connection(conn).is_some_and(|c| c.is_interesting()) {
            return;
        }
        self.request_a_block(ctx, conn);
        if let Some(c) = ctx.connection_mut(conn) {
            c.send_block_requests();
        }
    }

    /// The peer became interested in us: ask the session to unchoke it if
    /// an upload slot is free and the peer hasn't run down its credit.
    pub fn interested(&mut self, ctx: &mut dyn SwarmContext, conn: ConnectionId) {
        let Some(c) = ctx.connection(conn) else {
            return;
        };
        if !c.is_choked() {
            return;
        }
        let share = c.share_diff();
        let ignores_slots = c.ignore_unchoke_slots();

        if ctx.num_uploads() < ctx.max_uploads()
            && !ignores_slots
            && (ctx.ratio() == 0.0 || share >= -FREE_UPLOAD_AMOUNT || ctx.is_finished())
        {
            ctx.unchoke_peer(conn);
        } else if ctx.num_uploads() >= ctx.max_uploads() {
            debug!(
                uploads = ctx.num_uploads(),
                limit = ctx.max_uploads(),
                "did not unchoke: no upload slots"
            );
        } else {
            debug!(
                share_diff = share,
                "did not unchoke: peer has run down its free upload"
            );
        }
    }

    /// The peer lost interest in us. A seed that took more than it gave is
    /// treated as a gift: its surplus moves into the free-upload pool.
    pub fn not_interested(&mut self, ctx: &mut dyn SwarmContext, conn: ConnectionId) {
        if ctx.ratio() == 0.0 {
            return;
        }
        let Some(c) = ctx.connection(conn) else {
            return;
        };
        let diff = c.share_diff();
        if diff > 0 && c.is_seed() {
            if let Some(c) = ctx.connection_mut(conn) {
                c.add_free_upload(-diff);
            }
            self.available_free_upload += diff;
        }
    }

    /// We became interested in the peer: announce it and start requesting
    /// unless choked without allowed-fast pieces.
    pub fn peer_is_interesting(&mut self, ctx: &mut dyn SwarmContext, conn: ConnectionId) {
        if ctx.is_finished() {
            return;
        }
        let Some(c) = ctx.connection(conn) else {
            return;
        };
        if c.in_handshake() {
            return;
        }
        let choked = c.has_peer_choked();
        let no_fast_pieces = c.allowed_fast().is_empty();

        if let Some(c) = ctx.connection_mut(conn) {
            c.send_interested();
        }
        if choked && no_fast_pieces {
            return;
        }
        self.request_a_block(ctx, conn);
        if let Some(c) = ctx.connection_mut(conn) {
            c.send_block_requests();
        }
    }

    /// Selects blocks for an unchoked peer with room in its request window
    /// and queues them on the connection.
    pub fn request_a_block(&mut self, ctx: &mut dyn SwarmContext, conn: ConnectionId) {
        request::request_a_block(&mut self.rng, ctx, conn);
    }

    /// A connection attached to one of our records has closed.
    ///
    /// Clears the back-references, folds the connection's byte counters
    /// into the record, applies the failure count, and drops resume-data
    /// records we no longer care to keep.
    pub fn connection_closed(
        &mut self,
        ctx: &mut dyn SwarmContext,
        conn: ConnectionId,
        session_time: u32,
    ) {
        self.check_invariant(ctx);

        let Some(c) = ctx.connection(conn) else {
            return;
        };
        // connections we never attached are ignored
        let Some(key) = c.record() else {
            return;
        };
        let fast_reconnect = c.fast_reconnect();
        let failed = c.failed();
        let share = c.share_diff();
        let downloaded = c.total_payload_download();
        let uploaded = c.total_payload_upload();

        {
            let Some(rec) = self.pool.get_mut(key) else {
                return;
            };
            debug_assert_eq!(rec.connection, Some(conn));
            rec.connection = None;
            rec.optimistically_unchoked = false;

            // a fast reconnect keeps the timestamp of the original attempt
            // so the backoff window isn't reset
            if !fast_reconnect {
                rec.last_connected = session_time;
            }
            if failed && rec.failcount < FAILCOUNT_CAP {
                rec.failcount += 1;
            }

            debug_assert_eq!(rec.prev_amount_download, 0);
            debug_assert_eq!(rec.prev_amount_upload, 0);
            rec.prev_amount_download = downloaded;
            rec.prev_amount_upload = uploaded;
        }
        if let Some(c) = ctx.connection_mut(conn) {
            c.set_record(None);
        }

        if self
            .pool
            .get(key)
            .is_some_and(|r| self.is_connect_candidate(r, ctx))
        {
            self.num_connect_candidates += 1;
        }

        if ctx.ratio() != 0.0 {
            self.available_free_upload += share;
        }

        // once we seed, or when the directory is nearly full, peers we only
        // know from resume data aren't worth keeping around
        let max = ctx.settings().max_peerlist_size;
        let crowded = max != 0 && self.peers.len() as f64 >= max as f64 * 0.9;
        if (ctx.is_seed() || crowded)
            && self
                .pool
                .get(key)
                .is_some_and(|r| r.source == PeerSource::RESUME_DATA)
        {
            self.erase_peer(ctx, key);
        }

        self.check_invariant(ctx);
    }

    /// Recomputes the connect-candidate count after `is_finished()`
    /// changed, since finishing strips every seed of its candidacy.
    pub fn recalculate_connect_candidates(&mut self, ctx: &dyn SwarmContext) {
        self.finished = ctx.is_finished();
        let count = self
            .peers
            .iter()
            .filter_map(|&k| self.pool.get(k))
            .filter(|r| self.is_connect_candidate(r, ctx))
            .count();
        self.num_connect_candidates = count;
    }

    /// Once-per-tick housekeeping: shift free upload credit around (unless
    /// the ratio is infinite) and run the eviction sweep.
    pub fn pulse(&mut self, ctx: &mut dyn SwarmContext) {
        self.check_invariant(ctx);

        if ctx.ratio() != 0.0 {
            self.available_free_upload += upload::collect_free_download(ctx);
            self.available_free_upload =
                upload::distribute_free_upload(ctx, self.available_free_upload);
        }

        self.erase_peers(ctx);
    }

    fn is_connect_candidate(&self, rec: &PeerRecord, ctx: &dyn SwarmContext) -> bool {
        if rec.connection.is_some()
            || rec.banned
            || !rec.connectable
            || (rec.seed && self.finished)
            || rec.failcount >= ctx.settings().max_failcount
        {
            return false;
        }
        !ctx.port_blocked(rec.port)
    }

    fn is_erase_candidate(&self, rec: &PeerRecord, ctx: &dyn SwarmContext) -> bool {
        rec.connection.is_none()
            && rec.last_connected != 0
            && !rec.banned
            && !self.is_connect_candidate(rec, ctx)
    }

    fn should_erase_immediately(rec: &PeerRecord) -> bool {
        rec.source == PeerSource::RESUME_DATA && rec.failcount > 0 && !rec.banned
    }

    /// Evaluates the record at `current` for eviction during a sweep.
    /// Immediate-erase records are dropped on the spot (adjusting the saved
    /// indices) and true is returned; otherwise the remembered worst
    /// candidate is updated.
    fn update_erase_candidate(
        &mut self,
        ctx: &mut dyn SwarmContext,
        current: usize,
        erase_candidate: &mut Option<usize>,
        mut connect_candidate: Option<&mut Option<usize>>,
    ) -> bool {
        let key = self.peers[current];
        let Some(rec) = self.pool.get(key) else {
            return false;
        };
        if !self.is_erase_candidate(rec, ctx) {
            return false;
        }
        let worse = match erase_candidate.and_then(|i| self.pool.get(self.peers[i])) {
            Some(best) => !rank::compare_peer_erase(best, rec),
            None => true,
        };
        if !worse {
            return false;
        }
        if Self::should_erase_immediately(rec) {
            if let Some(saved) = erase_candidate.as_mut() {
                if *saved > current {
                    *saved -= 1;
                }
            }
            if let Some(saved) = connect_candidate.as_deref_mut().and_then(|c| c.as_mut()) {
                if *saved > current {
                    *saved -= 1;
                }
            }
            self.erase_at(ctx, current);
            return true;
        }
        *erase_candidate = Some(current);
        false
    }

    /// Clears picker and connection references, fixes the counters and the
    /// cursor, and returns the record's storage to the pool.
    fn erase_at(&mut self, ctx: &mut dyn SwarmContext, index: usize) {
        let key = self.peers[index];
        if let Some(picker) = ctx.picker_mut() {
            picker.clear_peer(key);
        }
        let (was_seed, was_candidate, conn) = match self.pool.get(key) {
            Some(rec) => (
                rec.seed,
                self.is_connect_candidate(rec, ctx),
                rec.connection,
            ),
            None => (false, false, None),
        };
        if was_seed {
            self.num_seeds -= 1;
        }
        if was_candidate {
            self.num_connect_candidates -= 1;
        }
        if let Some(c) = conn.and_then(|id| ctx.connection_mut(id)) {
            c.set_record(None);
        }
        if self.round_robin > index {
            self.round_robin -= 1;
        }
        self.pool.remove(key);
        self.peers.remove(index);
    }

    /// Folds the record's previous byte counters into the connection and
    /// wires the two together.
    fn attach_connection(
        &mut self,
        ctx: &mut dyn SwarmContext,
        key: PeerKey,
        conn: ConnectionId,
        session_time: u32,
    ) {
        let (downloaded, uploaded) = match self.pool.get_mut(key) {
            Some(rec) => {
                debug_assert!(rec.connection.is_none());
                rec.connection = Some(conn);
                let carried = (rec.prev_amount_download, rec.prev_amount_upload);
                rec.prev_amount_download = 0;
                rec.prev_amount_upload = 0;
                carried
            }
            None => return,
        };
        let fast_reconnect = match ctx.connection_mut(conn) {
            Some(c) => {
                c.set_record(Some(key));
                c.add_stat(downloaded, uploaded);
                c.fast_reconnect()
            }
            None => false,
        };
        if !fast_reconnect {
            if let Some(rec) = self.pool.get_mut(key) {
                rec.last_connected = session_time;
            }
        }
    }

    /// Settles a second connection to a peer that already has one.
    ///
    /// A crossed pair of endpoints means we connected to ourselves: both
    /// sides go. Otherwise the established (or outbound) connection wins,
    /// and only a still-connecting outbound loses to an incoming one.
    fn resolve_duplicate(
        &mut self,
        ctx: &mut dyn SwarmContext,
        existing: ConnectionId,
        conn: ConnectionId,
    ) -> Result<(), PolicyError> {
        debug_assert_ne!(existing, conn);

        let endpoints = ctx
            .connection(conn)
            .map(|c| (c.socket_local_endpoint(), c.socket_remote_endpoint()));
        let (this_local, this_remote) = match endpoints {
            Some((Ok(local), Ok(remote))) => (local, remote),
            Some((local, remote)) => {
                let err = PolicyError::from(local.err().or(remote.err()).unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotConnected, "socket gone")
                }));
                return Err(self.refuse(ctx, conn, err));
            }
            None => return Err(PolicyError::InvalidEndpoint),
        };

        let other_endpoints = ctx
            .connection(existing)
            .map(|c| (c.socket_local_endpoint(), c.socket_remote_endpoint()));
        match other_endpoints {
            Some((Ok(other_local), Ok(other_remote))) => {
                if other_remote == this_local || other_local == this_remote {
                    if let Some(c) = ctx.connection_mut(conn) {
                        c.disconnect(&PolicyError::SelfConnection.to_string());
                    }
                    if let Some(c) = ctx.connection_mut(existing) {
                        c.disconnect(&PolicyError::SelfConnection.to_string());
                    }
                    return Err(PolicyError::SelfConnection);
                }

                let existing_connecting =
                    ctx.connection(existing).is_some_and(|c| c.is_connecting());
                let new_outbound = ctx.connection(conn).is_some_and(|c| c.is_local());
                if !existing_connecting || new_outbound {
                    return Err(self.refuse(ctx, conn, PolicyError::DuplicateConnection));
                }

                debug!("dropping connecting duplicate in favour of incoming connection");
                if let Some(c) = ctx.connection_mut(existing) {
                    c.disconnect("incoming duplicate connection with higher priority, closing");
                }
                Ok(())
            }
            Some((local, remote)) => {
                // the existing socket is already dead; close it and let the
                // new connection take over
                let reason = local
                    .err()
                    .or(remote.err())
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                if let Some(c) = ctx.connection_mut(existing) {
                    c.disconnect(&reason);
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Disconnects `conn` with the error's reason string and hands the
    /// error back for returning.
    fn refuse(
        &mut self,
        ctx: &mut dyn SwarmContext,
        conn: ConnectionId,
        err: PolicyError,
    ) -> PolicyError {
        if let Some(c) = ctx.connection_mut(conn) {
            c.disconnect(&err.to_string());
        }
        err
    }

    /// Re-evaluates one record's candidacy after a mutation, given whether
    /// it was a candidate before.
    fn adjust_candidate_count(&mut self, ctx: &dyn SwarmContext, key: PeerKey, was: bool) {
        let now = self
            .pool
            .get(key)
            .is_some_and(|r| self.is_connect_candidate(r, ctx));
        if was == now {
            return;
        }
        if now {
            self.num_connect_candidates += 1;
        } else {
            self.num_connect_candidates = self.num_connect_candidates.saturating_sub(1);
        }
    }

    fn max_peerlist(&self, ctx: &dyn SwarmContext) -> usize {
        if ctx.is_paused() {
            ctx.settings().max_paused_peerlist_size
        } else {
            ctx.settings().max_peerlist_size
        }
    }

    fn lower_bound(&self, addr: IpAddr) -> usize {
        self.peers
            .partition_point(|&k| self.pool.get(k).is_some_and(|r| r.address() < addr))
    }

    fn upper_bound(&self, addr: IpAddr) -> usize {
        self.peers
            .partition_point(|&k| self.pool.get(k).is_some_and(|r| r.address() <= addr))
    }

    fn find_index(&self, remote: SocketAddr, multi: bool) -> Option<usize> {
        let lo = self.lower_bound(remote.ip());
        let hi = self.upper_bound(remote.ip());
        if multi {
            (lo..hi).find(|&i| {
                self.pool
                    .get(self.peers[i])
                    .is_some_and(|r| r.port == remote.port())
            })
        } else {
            (lo < hi).then_some(lo)
        }
    }

    #[cfg(test)]
    pub(crate) fn record_mut(&mut self, key: PeerKey) -> Option<&mut PeerRecord> {
        self.pool.get_mut(key)
    }

    /// Directory and counter consistency checks; no-ops in release builds.
    fn check_invariant(&self, ctx: &dyn SwarmContext) {
        if !cfg!(debug_assertions) {
            return;
        }
        debug_assert!(self.round_robin <= self.peers.len());
        debug_assert!(self.num_connect_candidates <= self.peers.len());

        let multi = ctx.settings().allow_multiple_connections_per_ip;
        let mut seeds = 0;
        let mut candidates = 0;
        let mut seen = std::collections::HashSet::new();
        let mut prev: Option<IpAddr> = None;

        for &key in &self.peers {
            let Some(rec) = self.pool.get(key) else {
                debug_assert!(false, "directory entry without a record");
                continue;
            };
            if let Some(prev) = prev {
                if multi {
                    debug_assert!(prev <= rec.address(), "directory out of order");
                } else {
                    debug_assert!(prev < rec.address(), "directory out of order");
                }
            }
            if multi {
                debug_assert!(seen.insert(rec.endpoint()), "duplicate endpoint");
            }
            prev = Some(rec.address());

            if rec.seed {
                seeds += 1;
            }
            if self.is_connect_candidate(rec, ctx) {
                candidates += 1;
            }
            if rec.connection.is_some() {
                debug_assert_eq!(rec.prev_amount_download, 0);
                debug_assert_eq!(rec.prev_amount_upload, 0);
            }
            debug_assert!(rec.failcount <= FAILCOUNT_CAP);
            debug_assert_eq!(rec.source.bits() & 0x3f, rec.source.bits());
        }

        debug_assert_eq!(seeds, self.num_seeds);
        debug_assert_eq!(candidates, self.num_connect_candidates);
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::new()
    }
}
