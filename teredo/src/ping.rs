//! Authenticated ICMPv6 Echo Request/Reply used to validate a peer's
//! mapping when its destination doesn't itself carry a Teredo address
//! (§4.5 "non-Teredo destination" ping path), and to authenticate the
//! reply that comes back (§4.6 Case 2).
//!
//! The echo's 4-byte identifier+sequence field carries a magic/sequence
//! prefix; the payload that follows carries the remaining
//! `HMAC_LEN - 4` bytes of the truncated MAC over `(src, dst)`. A peer
//! that echoes the exact same bytes back (as any compliant IPv6 stack
//! does for an Echo Request it doesn't recognise as anything else) lets
//! us recompute and verify the tag on the reply.

use std::net::Ipv6Addr;

use crate::hmac::{HmacKey, HMAC_LEN};
use crate::ipv6::{self, IPPROTO_ICMPV6};

pub const ICMP6_ECHO_REQUEST: u8 = 128;
pub const ICMP6_ECHO_REPLY: u8 = 129;

/// Bytes of the truncated MAC carried in the echo payload, after the
/// 4-byte identifier+sequence prefix.
pub const PING_PAYLOAD_LEN: usize = HMAC_LEN - 4;

const ICMP6_HEADER_LEN: usize = 4;

/// Builds a full IPv6 packet carrying an authenticated ICMPv6 Echo
/// Request from `src` to `dst`. The checksum field is left at zero; the
/// external ICMPv6 callback computes it, per the wire codec's scope.
pub fn build_echo_request(hmac: &HmacKey, src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
    let mut tag = [0u8; HMAC_LEN];
    hmac.generate_tag(&src, &dst, &mut tag);

    let mut body = Vec::with_capacity(ICMP6_HEADER_LEN + HMAC_LEN);
    body.push(ICMP6_ECHO_REQUEST);
    body.push(0); // code
    body.extend_from_slice(&[0, 0]); // checksum
    body.extend_from_slice(&tag[..4]); // identifier+sequence: magic/sequence prefix
    body.extend_from_slice(&tag[4..]); // payload: remaining PING_PAYLOAD_LEN bytes of the tag

    ipv6::encode(IPPROTO_ICMPV6, 64, src, dst, &body)
}

/// Verifies an ICMPv6 message body (whatever followed the IPv6 header) as
/// an authenticated reply to a ping we sent from `src` to `dst`. `src`/
/// `dst` must be given in the same order used at `build_echo_request` time
/// — a reply swaps which address sent the IP packet, but the MAC is over
/// the original pairing, which is recovered from peer-table context, not
/// from the reply's own IPv6 header.
pub fn verify_echo_reply(hmac: &HmacKey, src: Ipv6Addr, dst: Ipv6Addr, icmp_body: &[u8]) -> bool {
    verify_tag_in_body(hmac, src, dst, icmp_body, ICMP6_ECHO_REPLY)
}

/// As [`verify_echo_reply`], but checks for an echoed Echo *Request* —
/// used by the ICMPv6-Destination-Unreachable kludge path (§4.6 Case 2),
/// where a server or middlebox returns our own original request verbatim
/// rather than a reply.
pub fn verify_echo_request(hmac: &HmacKey, src: Ipv6Addr, dst: Ipv6Addr, icmp_body: &[u8]) -> bool {
    verify_tag_in_body(hmac, src, dst, icmp_body, ICMP6_ECHO_REQUEST)
}

fn verify_tag_in_body(
    hmac: &HmacKey,
    src: Ipv6Addr,
    dst: Ipv6Addr,
    icmp_body: &[u8],
    expect_type: u8,
) -> bool {
    if icmp_body.len() != ICMP6_HEADER_LEN + HMAC_LEN {
        return false;
    }
    if icmp_body[0] != expect_type {
        return false;
    }

    let mut candidate = [0u8; HMAC_LEN];
    candidate[..4].copy_from_slice(&icmp_body[4..8]);
    candidate[4..].copy_from_slice(&icmp_body[8..8 + PING_PAYLOAD_LEN]);
    hmac.verify(&src, &dst, &candidate)
}

#[cfg(test)]
mod test {
    use super::*;

    fn addrs() -> (Ipv6Addr, Ipv6Addr) {
        (
            Ipv6Addr::new(0x2001, 0, 0x338c, 0x24f4, 0x43b, 0x30e3, 0xd2f3, 0xc93d),
            Ipv6Addr::new(0x2a00, 0x1450, 0x4001, 0, 0, 0, 0, 1),
        )
    }

    #[test]
    fn request_then_reply_verifies() {
        let hmac = HmacKey::generate();
        let (src, dst) = addrs();
        let request = build_echo_request(&hmac, src, dst);

        // Echoed reply: same body, type flipped from request to reply.
        let mut reply_body = request[40..].to_vec();
        reply_body[0] = ICMP6_ECHO_REPLY;

        assert!(verify_echo_reply(&hmac, src, dst, &reply_body));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let hmac = HmacKey::generate();
        let (src, dst) = addrs();
        let request = build_echo_request(&hmac, src, dst);

        let mut reply_body = request[40..].to_vec();
        reply_body[0] = ICMP6_ECHO_REPLY;
        reply_body[8] ^= 0x01;

        assert!(!verify_echo_reply(&hmac, src, dst, &reply_body));
    }

    #[test]
    fn wrong_address_pair_fails_verification() {
        let hmac = HmacKey::generate();
        let (src, dst) = addrs();
        let request = build_echo_request(&hmac, src, dst);

        let mut reply_body = request[40..].to_vec();
        reply_body[0] = ICMP6_ECHO_REPLY;

        assert!(!verify_echo_reply(&hmac, dst, src, &reply_body));
    }
}
