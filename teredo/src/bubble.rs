//! Bubbles: zero-payload IPv6 packets (`next_header = IPPROTO_NONE`, empty
//! payload) used purely to punch and probe NAT state. A bubble is never
//! delivered to the receive callback; it only ever updates peer-table
//! state.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::address;
use crate::hmac::HmacKey;
use crate::ipv6::{self, Ipv6HeaderView, IPPROTO_NONE};
use crate::wire::ParsedPacket;

/// Encodes a bare unicast/indirect/discovery bubble from `src` to `dst`.
/// Direct, indirect, and local-discovery bubbles share this exact wire
/// shape; what differs between them is only where the datagram is sent.
pub fn encode(src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
    ipv6::encode(IPPROTO_NONE, 64, src, dst, &[])
}

/// Whether a local-discovery bubble's *source* endpoint plausibly belongs
/// to the same LAN segment: a Teredo-prefixed address whose obfuscated
/// client IPv4 is itself a private-network address, as seen from the UDP
/// source the datagram actually arrived from. This is the gate the
/// receive classifier applies before accepting a peer as `local`.
pub fn is_local_source(ip6: &Ipv6HeaderView<'_>, configured_prefix: u32, source_ipv4: Ipv4Addr) -> bool {
    let src = ip6.source();
    if !address::is_destination_teredo(&src, configured_prefix) {
        return false;
    }
    let teredo_src = address::TeredoAddress::from(src);
    teredo_src.client_ipv4() == source_ipv4 && is_private_ipv4(source_ipv4)
}

fn is_private_ipv4(addr: Ipv4Addr) -> bool {
    addr.is_private() || addr.is_link_local() || addr.is_loopback()
}

/// Authenticates a bubble per the receive classifier's `CheckBubble`: a
/// bubble carrying a Teredo authentication header is verified against our
/// HMAC secret; one carrying only an origin indication is trusted if the
/// server-reported origin is a plausible (globally routable) public
/// endpoint — the server itself vouches for that mapping by construction.
pub fn check_bubble(hmac: &HmacKey, ip6: &Ipv6HeaderView<'_>, parsed: &ParsedPacket<'_>) -> bool {
    if let Some(nonce) = parsed.auth_nonce {
        let mut tag = [0u8; crate::hmac::HMAC_LEN];
        hmac.generate_tag(&ip6.source(), &ip6.destination(), &mut tag);
        return tag[..nonce.len()] == nonce;
    }
    if let Some(orig_ipv4) = parsed.orig_ipv4 {
        return address::is_global_ipv4(orig_ipv4);
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encodes_zero_payload_bubble() {
        let src = Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 1);
        let dst = Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 2);
        let packet = encode(src, dst);
        let view = Ipv6HeaderView::parse(&packet).unwrap();
        assert!(view.is_bubble());
    }

    #[test]
    fn local_source_requires_private_client_ipv4() {
        let server = Ipv4Addr::new(65, 54, 227, 120);
        let client_private = Ipv4Addr::new(192, 168, 1, 50);
        let addr = address::TeredoAddress::compose(
            address::TEREDO_PREFIX,
            server,
            0,
            client_private,
            4000,
        );
        let packet = encode(addr.as_ipv6(), Ipv6Addr::LOCALHOST);
        let view = Ipv6HeaderView::parse(&packet).unwrap();
        assert!(is_local_source(&view, address::TEREDO_PREFIX, client_private));

        let client_public = Ipv4Addr::new(203, 0, 113, 5);
        assert!(!is_local_source(&view, address::TEREDO_PREFIX, client_public));
    }

    #[test]
    fn check_bubble_trusts_global_origin_indication() {
        let hmac = HmacKey::generate();
        let src = Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 1);
        let dst = Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 2);
        let packet = encode(src, dst);
        let view = Ipv6HeaderView::parse(&packet).unwrap();

        let parsed = ParsedPacket {
            source_ipv4: Ipv4Addr::new(1, 1, 1, 1),
            source_port: 1,
            auth_nonce: None,
            auth_confirm: None,
            orig_ipv4: Some(Ipv4Addr::new(65, 54, 227, 120)),
            orig_port: Some(4000),
            ip6: &packet,
        };
        assert!(check_bubble(&hmac, &view, &parsed));

        let parsed_bogus = ParsedPacket {
            orig_ipv4: Some(Ipv4Addr::new(127, 0, 0, 1)),
            ..parsed
        };
        assert!(!check_bubble(&hmac, &view, &parsed_bogus));
    }
}
