//! Teredo UDP wire framing.
//!
//! A Teredo UDP payload is an optional authentication header, followed by
//! an optional origin indication header, followed by the encapsulated
//! IPv6 packet:
//!
//! ```text
//! [ auth_hdr? ] [ origin_indication? ] [ ipv6_packet ]
//!
//! auth_hdr:      00 01 <id_len:1> <au_len:1> <id[id_len]>
//!                <au[au_len]> <nonce:8> <confirm:1>
//! origin_ind:    00 00 <~port:2> <~ipv4:4>
//! ```
//!
//! Either optional header may be absent. Both start with a `0x00` marker
//! byte, which can never collide with the start of an IPv6 packet (whose
//! first nibble is always `0x6`).

use std::convert::TryInto;
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::address::{obfuscate_ipv4, obfuscate_port};

const AUTH_MARKER: u8 = 0x00;
const AUTH_TYPE: u8 = 0x01;
const ORIGIN_MARKER: u8 = 0x00;
const ORIGIN_TYPE: u8 = 0x00;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("Teredo datagram truncated or header length overruns the buffer")]
    Malformed,
}

/// A parsed Teredo datagram. Borrows the encapsulated IPv6 slice from the
/// input buffer — no copy is made of the (potentially large) inner packet.
#[derive(Debug)]
pub struct ParsedPacket<'a> {
    pub source_ipv4: Ipv4Addr,
    pub source_port: u16,
    pub auth_nonce: Option<[u8; 8]>,
    pub auth_confirm: Option<u8>,
    pub orig_ipv4: Option<Ipv4Addr>,
    pub orig_port: Option<u16>,
    pub ip6: &'a [u8],
}

/// Parses a Teredo UDP payload received from `(source_ipv4, source_port)`.
///
/// Never reads past the end of `datagram`: any announced header length
/// that would run off the end of the buffer is rejected as
/// [`WireError::Malformed`].
pub fn parse(
    datagram: &[u8],
    source_ipv4: Ipv4Addr,
    source_port: u16,
) -> Result<ParsedPacket<'_>, WireError> {
    let mut offset = 0usize;
    let mut auth_nonce = None;
    let mut auth_confirm = None;
    let mut orig_ipv4 = None;
    let mut orig_port = None;

    if datagram.len() >= offset + 2
        && datagram[offset] == AUTH_MARKER
        && datagram[offset + 1] == AUTH_TYPE
    {
        if datagram.len() < offset + 4 {
            return Err(WireError::Malformed);
        }
        let id_len = datagram[offset + 2] as usize;
        let au_len = datagram[offset + 3] as usize;
        let header_len = 4usize
            .checked_add(id_len)
            .and_then(|n| n.checked_add(au_len))
            .and_then(|n| n.checked_add(9))
            .ok_or(WireError::Malformed)?;

        if datagram.len() < offset + header_len {
            return Err(WireError::Malformed);
        }

        let nonce_start = offset + 4 + id_len + au_len;
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&datagram[nonce_start..nonce_start + 8]);
        auth_nonce = Some(nonce);
        auth_confirm = Some(datagram[nonce_start + 8]);
        offset += header_len;
    }

    if datagram.len() >= offset + 2
        && datagram[offset] == ORIGIN_MARKER
        && datagram[offset + 1] == ORIGIN_TYPE
    {
        if datagram.len() < offset + 8 {
            return Err(WireError::Malformed);
        }
        let port_raw = u16::from_be_bytes(datagram[offset + 2..offset + 4].try_into().unwrap());
        let ip_raw = u32::from_be_bytes(datagram[offset + 4..offset + 8].try_into().unwrap());
        orig_port = Some(obfuscate_port(port_raw));
        orig_ipv4 = Some(Ipv4Addr::from(obfuscate_ipv4(ip_raw)));
        offset += 8;
    }

    Ok(ParsedPacket {
        source_ipv4,
        source_port,
        auth_nonce,
        auth_confirm,
        orig_ipv4,
        orig_port,
        ip6: &datagram[offset..],
    })
}

/// Encodes a Teredo authentication header (used only during qualification,
/// where `id`/`au` are typically empty — secure qualification is out of
/// scope here).
pub fn encode_auth_header(id: &[u8], au: &[u8], nonce: &[u8; 8], confirm: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + id.len() + au.len() + 9);
    out.push(AUTH_MARKER);
    out.push(AUTH_TYPE);
    out.push(id.len() as u8);
    out.push(au.len() as u8);
    out.extend_from_slice(id);
    out.extend_from_slice(au);
    out.extend_from_slice(nonce);
    out.push(confirm);
    out
}

/// Encodes a Teredo origin indication header.
pub fn encode_origin_indication(port: u16, ipv4: Ipv4Addr) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = ORIGIN_MARKER;
    out[1] = ORIGIN_TYPE;
    out[2..4].copy_from_slice(&obfuscate_port(port).to_be_bytes());
    out[4..8].copy_from_slice(&obfuscate_ipv4(u32::from(ipv4)).to_be_bytes());
    out
}

/// Builds a Teredo datagram out of independently-constructed segments
/// (authentication header, origin indication, encapsulated packet),
/// joining them once instead of serializing into one shared buffer field
/// by field.
#[derive(Default)]
pub struct Datagram {
    segments: Vec<Vec<u8>>,
}

impl Datagram {
    pub fn new() -> Self {
        Datagram { segments: Vec::new() }
    }

    pub fn push(&mut self, segment: Vec<u8>) -> &mut Self {
        self.segments.push(segment);
        self
    }

    pub fn push_slice(&mut self, segment: &[u8]) -> &mut Self {
        self.segments.push(segment.to_vec());
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total: usize = self.segments.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for seg in self.segments {
            out.extend_from_slice(&seg);
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrips_origin_indication() {
        let port = 53020u16;
        let ip = Ipv4Addr::new(192, 0, 2, 10);
        let header = encode_origin_indication(port, ip);

        let parsed = parse(&header, Ipv4Addr::new(1, 1, 1, 1), 1).unwrap();
        assert_eq!(parsed.orig_port, Some(port));
        assert_eq!(parsed.orig_ipv4, Some(ip));
        assert!(parsed.ip6.is_empty());
    }

    #[test]
    fn roundtrips_auth_header_then_ip6() {
        let nonce = [1, 2, 3, 4, 5, 6, 7, 8];
        let auth = encode_auth_header(&[], &[], &nonce, 0);
        let ip6 = vec![0x60u8; 40];

        let mut datagram = Vec::new();
        datagram.extend_from_slice(&auth);
        datagram.extend_from_slice(&ip6);

        let parsed = parse(&datagram, Ipv4Addr::new(1, 1, 1, 1), 1).unwrap();
        assert_eq!(parsed.auth_nonce, Some(nonce));
        assert_eq!(parsed.auth_confirm, Some(0));
        assert_eq!(parsed.ip6, &ip6[..]);
    }

    #[test]
    fn rejects_truncated_auth_header() {
        // Declares id_len/au_len that run past the buffer.
        let datagram = [0x00, 0x01, 0xff, 0xff, 0, 0];
        assert_eq!(
            parse(&datagram, Ipv4Addr::new(1, 1, 1, 1), 1).unwrap_err(),
            WireError::Malformed
        );
    }

    #[test]
    fn no_optional_headers_is_just_ip6() {
        let ip6 = vec![0x60u8; 40];
        let parsed = parse(&ip6, Ipv4Addr::new(1, 1, 1, 1), 1).unwrap();
        assert_eq!(parsed.auth_nonce, None);
        assert_eq!(parsed.orig_ipv4, None);
        assert_eq!(parsed.ip6, &ip6[..]);
    }

    #[test]
    fn datagram_builder_concatenates() {
        let mut d = Datagram::new();
        d.push_slice(&[1, 2]).push_slice(&[3, 4]);
        assert_eq!(d.build(), vec![1, 2, 3, 4]);
    }
}
