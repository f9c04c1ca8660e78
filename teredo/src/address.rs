//! RFC 4380 Teredo address codec.
//!
//! Teredo addresses are composed of 5 components:
//!
//! ```text
//! +-------------+-------------+-------+------+-------------+
//! | Prefix      | Server IPv4 | Flags | Port | Client IPv4 |
//! +-------------+-------------+-------+------+-------------+
//!      32             32          16     16        32
//! ```
//!
//! Both the client UDP port and client IPv4 address are carried
//! one's-complement obfuscated: each bit is flipped, which is a plain XOR
//! of the 16-bit port with `0xFFFF` and of the 32-bit address with
//! `0xFFFFFFFF`. The operation is its own inverse.

use std::convert::TryInto;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Default Teredo service prefix, `2001:0000::/32`.
pub const TEREDO_PREFIX: u32 = 0x2001_0000;

/// Cone bit within the 16-bit flags word (RFC 4380 §5.2.1).
pub const TEREDO_FLAG_CONE: u16 = 0x8000;

/// Link-local source address used by a client that believes itself behind
/// a restricted-cone (or unknown) NAT while unqualified.
pub const RESTRICT_SOURCE: Ipv6Addr = Ipv6Addr::new(
    0xfe80, 0, 0, 0, 0, 0, 0xffff, 0xffff,
);

/// Link-local source address used while unqualified and believed to be
/// behind a cone NAT. The low 48 bits spell out the ASCII bytes
/// `T E R E D O` behind the cone bit.
pub const CONE_SOURCE: Ipv6Addr = Ipv6Addr::new(
    0xfe80, 0, 0, 0, 0x8000, 0x5445, 0x5245, 0x444f,
);

/// One's-complement obfuscation of a 16-bit field. Self-inverse.
#[inline]
pub fn obfuscate_port(port: u16) -> u16 {
    port ^ 0xFFFF
}

/// One's-complement obfuscation of a 32-bit field. Self-inverse.
#[inline]
pub fn obfuscate_ipv4(addr: u32) -> u32 {
    addr ^ 0xFFFF_FFFF
}

/// A Teredo IPv6 address, with accessors for each of its five components.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct TeredoAddress(Ipv6Addr);

impl TeredoAddress {
    /// Builds a Teredo address from its components. `client_ipv4` and
    /// `client_port` are given in cleartext; this function obfuscates them
    /// on the wire as required.
    pub fn compose(
        prefix: u32,
        server_ipv4: Ipv4Addr,
        flags: u16,
        client_ipv4: Ipv4Addr,
        client_port: u16,
    ) -> Self {
        let mut octets = [0u8; 16];
        octets[0..4].copy_from_slice(&prefix.to_be_bytes());
        octets[4..8].copy_from_slice(&u32::from(server_ipv4).to_be_bytes());
        octets[8..10].copy_from_slice(&flags.to_be_bytes());
        octets[10..12].copy_from_slice(&obfuscate_port(client_port).to_be_bytes());
        octets[12..16].copy_from_slice(&obfuscate_ipv4(u32::from(client_ipv4)).to_be_bytes());
        TeredoAddress(Ipv6Addr::from(octets))
    }

    /// Splits the address back into its five components. The inverse of
    /// [`TeredoAddress::compose`].
    pub fn decompose(&self) -> (u32, Ipv4Addr, u16, Ipv4Addr, u16) {
        (
            self.prefix(),
            self.server_ipv4(),
            self.flags(),
            self.client_ipv4(),
            self.client_port(),
        )
    }

    pub fn prefix(&self) -> u32 {
        u32::from_be_bytes(self.0.octets()[0..4].try_into().unwrap())
    }

    pub fn server_ipv4(&self) -> Ipv4Addr {
        u32::from_be_bytes(self.0.octets()[4..8].try_into().unwrap()).into()
    }

    pub fn flags(&self) -> u16 {
        u16::from_be_bytes(self.0.octets()[8..10].try_into().unwrap())
    }

    pub fn client_port(&self) -> u16 {
        let raw = u16::from_be_bytes(self.0.octets()[10..12].try_into().unwrap());
        obfuscate_port(raw)
    }

    pub fn client_ipv4(&self) -> Ipv4Addr {
        let raw = u32::from_be_bytes(self.0.octets()[12..16].try_into().unwrap());
        obfuscate_ipv4(raw).into()
    }

    /// Whether the client believed it sat behind a cone NAT when this
    /// address was obtained.
    pub fn is_cone(&self) -> bool {
        self.flags() & TEREDO_FLAG_CONE != 0
    }

    pub fn as_ipv6(&self) -> Ipv6Addr {
        self.0
    }
}

impl From<TeredoAddress> for Ipv6Addr {
    fn from(addr: TeredoAddress) -> Ipv6Addr {
        addr.0
    }
}

impl From<Ipv6Addr> for TeredoAddress {
    fn from(addr: Ipv6Addr) -> TeredoAddress {
        TeredoAddress(addr)
    }
}

/// Any prefix word a Teredo server may legitimately advertise. The
/// specification reserves `2001:0000::/32`, but several deployments
/// (including the experimental `3ffe:831f::/32`) are still seen in the
/// wild, so prefix validation checks against the tunnel's configured/learned
/// prefix rather than hard-coding the default.
pub fn is_valid_teredo_prefix(prefix: u32) -> bool {
    prefix == TEREDO_PREFIX || prefix == 0x3ffe_831f
}

/// Tests whether an IPv6 address falls within a given Teredo prefix.
pub fn is_teredo_address(addr: &Ipv6Addr, prefix: u32) -> bool {
    u32::from_be_bytes(addr.octets()[0..4].try_into().unwrap()) == prefix
}

/// The leading 32 bits of an IPv6 address, interpreted as a Teredo prefix
/// candidate.
pub fn teredo_prefix_of(addr: &Ipv6Addr) -> u32 {
    u32::from_be_bytes(addr.octets()[0..4].try_into().unwrap())
}

/// Whether `addr` carries a Teredo prefix: either the tunnel's
/// configured/learned prefix, or another prefix a Teredo server may
/// legitimately advertise (see [`is_valid_teredo_prefix`]).
pub fn is_destination_teredo(addr: &Ipv6Addr, configured_prefix: u32) -> bool {
    let prefix = teredo_prefix_of(addr);
    prefix == configured_prefix || is_valid_teredo_prefix(prefix)
}

/// Whether `addr` is a globally routable IPv4 unicast address, i.e. a
/// plausible Teredo server or NAT-mapped client address. Excludes private,
/// loopback, link-local, documentation, broadcast, unspecified, multicast,
/// carrier-grade-NAT (`100.64.0.0/10`), and IETF-protocol (`192.0.0.0/24`)
/// ranges. `std::net::Ipv4Addr::is_global` is unstable, so this reassembles
/// the check from the stable building blocks it would otherwise use.
pub fn is_global_ipv4(addr: Ipv4Addr) -> bool {
    if addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_documentation()
        || addr.is_unspecified()
        || addr.is_multicast()
    {
        return false;
    }
    let o = addr.octets();
    if o[0] == 100 && (o[1] & 0xc0) == 64 {
        return false; // 100.64.0.0/10, carrier-grade NAT
    }
    if o[0] == 192 && o[1] == 0 && o[2] == 0 {
        return false; // 192.0.0.0/24, IETF protocol assignments
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn decompose_matches_known_vector() {
        let addr = Ipv6Addr::from_str("2001:0:338c:24f4:43b:30e3:d2f3:c93d").unwrap();
        let teredo = TeredoAddress::from(addr);

        assert_eq!(teredo.prefix(), 0x2001_0000);
        assert_eq!(teredo.server_ipv4(), Ipv4Addr::from_str("51.140.36.244").unwrap());
        assert_eq!(teredo.client_ipv4(), Ipv4Addr::from_str("45.12.54.194").unwrap());
        assert_eq!(teredo.client_port(), 53020);
    }

    #[test]
    fn compose_decompose_roundtrips() {
        let server = Ipv4Addr::new(65, 54, 227, 120);
        let client = Ipv4Addr::new(192, 0, 2, 10);
        let composed = TeredoAddress::compose(TEREDO_PREFIX, server, 0, client, 40000);
        let (prefix, server_out, flags, client_out, port_out) = composed.decompose();

        assert_eq!(prefix, TEREDO_PREFIX);
        assert_eq!(server_out, server);
        assert_eq!(flags, 0);
        assert_eq!(client_out, client);
        assert_eq!(port_out, 40000);
    }

    #[test]
    fn cone_flag_roundtrips() {
        let addr = TeredoAddress::compose(
            TEREDO_PREFIX,
            Ipv4Addr::new(1, 2, 3, 4),
            TEREDO_FLAG_CONE,
            Ipv4Addr::new(5, 6, 7, 8),
            1234,
        );
        assert!(addr.is_cone());

        let addr2 = TeredoAddress::compose(
            TEREDO_PREFIX,
            Ipv4Addr::new(1, 2, 3, 4),
            0,
            Ipv4Addr::new(5, 6, 7, 8),
            1234,
        );
        assert!(!addr2.is_cone());
    }

    #[test]
    fn obfuscation_is_self_inverse() {
        assert_eq!(obfuscate_port(obfuscate_port(53020)), 53020);
        assert_eq!(obfuscate_ipv4(obfuscate_ipv4(0x12345678)), 0x12345678);
    }

    #[test]
    fn rejects_local_server_origin() {
        assert!(!is_global_ipv4(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!is_global_ipv4(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!is_global_ipv4(Ipv4Addr::new(100, 64, 0, 1)));
    }

    #[test]
    fn accepts_global_server() {
        assert!(is_global_ipv4(Ipv4Addr::new(65, 54, 227, 120)));
    }

    #[test]
    fn destination_teredo_accepts_experimental_prefix() {
        let addr = Ipv6Addr::from_str("3ffe:831f::1").unwrap();
        assert!(is_destination_teredo(&addr, TEREDO_PREFIX));
    }
}
