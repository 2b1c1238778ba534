use std::net::IpAddr;

use super::record::{source_rank, PeerRecord, PeerSource};

/// Returns true if `lhs` is a better eviction victim than `rhs`.
///
/// Peers known only from resume data go first; among equals, the peer with
/// more consecutive connect failures goes first.
pub(crate) fn compare_peer_erase(lhs: &PeerRecord, rhs: &PeerRecord) -> bool {
    let lhs_resume = lhs.source == PeerSource::RESUME_DATA;
    let rhs_resume = rhs.source == PeerSource::RESUME_DATA;
    if lhs_resume != rhs_resume {
        return lhs_resume;
    }
    lhs.failcount > rhs.failcount
}

/// Returns true if `lhs` is a better connect candidate than `rhs`.
///
/// Lexicographic tie-break: fewer failures, then local-network addresses,
/// then the longest-untried peer, then the more trusted discovery sources,
/// then (while still downloading, with an AS database loaded) a higher AS
/// number, then the peer nearest `external_ip` by CIDR distance.
pub(crate) fn compare_peer(
    lhs: &PeerRecord,
    rhs: &PeerRecord,
    external_ip: IpAddr,
    finished: bool,
    has_as_db: bool,
) -> bool {
    if lhs.failcount != rhs.failcount {
        return lhs.failcount < rhs.failcount;
    }

    let lhs_local = is_local_addr(lhs.address());
    let rhs_local = is_local_addr(rhs.address());
    if lhs_local != rhs_local {
        return lhs_local;
    }

    if lhs.last_connected != rhs.last_connected {
        return lhs.last_connected < rhs.last_connected;
    }

    let lhs_rank = source_rank(lhs.source);
    let rhs_rank = source_rank(rhs.source);
    if lhs_rank != rhs_rank {
        return lhs_rank > rhs_rank;
    }

    // don't bias fast peers when seeding
    if !finished && has_as_db {
        let lhs_as = lhs.inet_as.unwrap_or(0);
        let rhs_as = rhs.inet_as.unwrap_or(0);
        if lhs_as != rhs_as {
            return lhs_as > rhs_as;
        }
    }

    cidr_distance(external_ip, lhs.address()) < cidr_distance(external_ip, rhs.address())
}

/// Number of address bits past the common prefix of `a` and `b`.
///
/// Zero means equal addresses; the smaller the distance, the nearer the
/// peers are in CIDR terms. A v4 and a v6 address are compared through the
/// v4-mapped representation.
pub(crate) fn cidr_distance(a: IpAddr, b: IpAddr) -> u32 {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => 32 - common_bits(&a.octets(), &b.octets()),
        (a, b) => 128 - common_bits(&to_v6_octets(a), &to_v6_octets(b)),
    }
}

/// True for addresses on the local network (RFC 1918 ranges, v6
/// link-local).
pub(crate) fn is_local_addr(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 == 0xfe80,
    }
}

fn common_bits(a: &[u8], b: &[u8]) -> u32 {
    let mut bits = 0;
    for (x, y) in a.iter().zip(b) {
        let diff = x ^ y;
        bits += diff.leading_zeros();
        if diff != 0 {
            break;
        }
    }
    bits
}

fn to_v6_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}
