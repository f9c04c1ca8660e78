//! Keyed hash over `(source, destination)` used to authenticate echoed
//! bubbles and pings.
//!
//! Built on the `hmac`/`sha2` crates already in this crate's dependency
//! graph for MAC-adjacent work, rather than adding a new crypto dependency.
//! There is no secrecy requirement here (payloads travel in the clear);
//! the MAC only lets a reply be recognised as ours.

use std::net::Ipv6Addr;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

/// Truncated MAC length embedded in an ICMPv6 echo identifier+sequence
/// field. Must stay >= 12 so `PING_PAYLOAD = HMAC_LEN - 4` leaves at least
/// 8 bytes of entropy once the 4-byte magic/sequence prefix is stripped.
pub const HMAC_LEN: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// A tunnel-scoped HMAC secret.
///
/// Each `Tunnel` owns its own `Arc<HmacKey>`, generated fresh at
/// construction, rather than sharing one process-wide secret — this keeps
/// the key's lifetime tied to the tunnel that uses it instead of to the
/// process (see DESIGN.md).
pub struct HmacKey {
    secret: [u8; 32],
}

impl HmacKey {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        HmacKey { secret }
    }

    #[cfg(test)]
    fn from_secret(secret: [u8; 32]) -> Self {
        HmacKey { secret }
    }

    fn mac(&self, src: &Ipv6Addr, dst: &Ipv6Addr) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts key of any length");
        mac.update(&src.octets());
        mac.update(&dst.octets());
        mac
    }

    /// Computes the truncated MAC over `(src, dst)`, writing `HMAC_LEN`
    /// bytes into `out`.
    pub fn generate_tag(&self, src: &Ipv6Addr, dst: &Ipv6Addr, out: &mut [u8; HMAC_LEN]) {
        let full = self.mac(src, dst).finalize().into_bytes();
        out.copy_from_slice(&full[..HMAC_LEN]);
    }

    /// Verifies a candidate tag. `Mac::verify_truncated_left` already
    /// compares in constant time, so no hand-rolled comparison is needed
    /// here.
    pub fn verify(&self, src: &Ipv6Addr, dst: &Ipv6Addr, candidate: &[u8; HMAC_LEN]) -> bool {
        self.mac(src, dst).verify_truncated_left(candidate).is_ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv6Addr;

    fn addrs() -> (Ipv6Addr, Ipv6Addr) {
        (
            Ipv6Addr::new(0x2001, 0, 0x338c, 0x24f4, 0x43b, 0x30e3, 0xd2f3, 0xc93d),
            Ipv6Addr::new(0x2a00, 0x1450, 0x4001, 0, 0, 0, 0, 1),
        )
    }

    #[test]
    fn generate_then_verify_succeeds() {
        let key = HmacKey::from_secret([7u8; 32]);
        let (src, dst) = addrs();
        let mut tag = [0u8; HMAC_LEN];
        key.generate_tag(&src, &dst, &mut tag);

        assert!(key.verify(&src, &dst, &tag));
    }

    #[test]
    fn bit_flip_in_tag_breaks_verification() {
        let key = HmacKey::from_secret([7u8; 32]);
        let (src, dst) = addrs();
        let mut tag = [0u8; HMAC_LEN];
        key.generate_tag(&src, &dst, &mut tag);
        tag[0] ^= 0x01;

        assert!(!key.verify(&src, &dst, &tag));
    }

    #[test]
    fn bit_flip_in_addresses_breaks_verification() {
        let key = HmacKey::from_secret([7u8; 32]);
        let (src, dst) = addrs();
        let mut tag = [0u8; HMAC_LEN];
        key.generate_tag(&src, &dst, &mut tag);

        let other_src = Ipv6Addr::new(0x2001, 0, 0x338c, 0x24f4, 0x43b, 0x30e3, 0xd2f3, 0xc93e);
        assert!(!key.verify(&other_src, &dst, &tag));
    }

    #[test]
    fn different_secret_breaks_verification() {
        let key_a = HmacKey::from_secret([7u8; 32]);
        let key_b = HmacKey::from_secret([8u8; 32]);
        let (src, dst) = addrs();
        let mut tag = [0u8; HMAC_LEN];
        key_a.generate_tag(&src, &dst, &mut tag);

        assert!(!key_b.verify(&src, &dst, &tag));
    }
}
