//! Qualification (router solicitation/advertisement) collaborator.
//!
//! This module defines the interface the tunnel engine calls into to decide
//! whether an inbound datagram is maintenance traffic, plus a reference
//! implementation that parses real router advertisements. It intentionally
//! does not implement secure qualification, retry back-off tuning, or
//! anything beyond the handshake needed to flip a tunnel up/down — treating
//! maintenance as a pluggable collaborator rather than a product in itself.

use std::convert::TryInto;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

use crate::address::{TeredoAddress, RESTRICT_SOURCE, CONE_SOURCE};
use crate::ipv6::{Ipv6HeaderView, IPPROTO_ICMPV6};
use crate::wire::ParsedPacket;

pub const IPPORT_TEREDO: u16 = 3544;

const ND_ROUTER_ADVERT: u8 = 134;
const ND_OPT_PREFIX_INFORMATION: u8 = 3;
const ND_OPT_MTU: u8 = 5;

/// A successfully parsed router advertisement.
#[derive(Debug, Clone, Copy)]
pub struct QualificationUpdate {
    pub prefix: u32,
    pub server_ipv4: Ipv4Addr,
    pub flags: u16,
    pub mapped_ipv4: Ipv4Addr,
    pub mapped_port: u16,
    pub mtu: u16,
}

impl QualificationUpdate {
    pub fn teredo_addr(&self) -> TeredoAddress {
        TeredoAddress::compose(
            self.prefix,
            self.server_ipv4,
            self.flags,
            self.mapped_ipv4,
            self.mapped_port,
        )
    }
}

/// Outcome of handing an inbound datagram to a [`MaintenanceDriver`].
#[derive(Debug)]
pub enum MaintenanceOutcome {
    /// Not maintenance traffic at all; fall through to normal receive handling.
    NotMine,
    /// Consumed as maintenance traffic; nothing new to report.
    Pending,
    /// A fresh, valid router advertisement: the tunnel should transition up
    /// (or refresh its existing mapping) with this state.
    Qualified(QualificationUpdate),
}

/// Drives the qualification handshake for a client tunnel.
pub trait MaintenanceDriver: Send + Sync {
    /// Inspects an inbound (already wire-parsed) datagram. Implementations
    /// must not block.
    fn process(&self, packet: &ParsedPacket<'_>) -> MaintenanceOutcome;

    /// Returns an encoded router solicitation to (re)send, if one is due.
    fn poll_solicit(&self, now: u64) -> Option<Vec<u8>>;
}

struct Retry {
    attempts: u32,
    last_sent: u64,
}

/// Minimal RFC 4380 §5.2.1-ish qualification driver: sends router
/// solicitations toward a known server and parses its router advertisements.
pub struct QualificationMaintenance {
    server_ipv4: Ipv4Addr,
    cone: bool,
    nonce: [u8; 8],
    retry: Mutex<Retry>,
}

impl QualificationMaintenance {
    pub fn new(server_ipv4: Ipv4Addr, cone: bool, nonce: [u8; 8]) -> Self {
        QualificationMaintenance {
            server_ipv4,
            cone,
            nonce,
            retry: Mutex::new(Retry { attempts: 0, last_sent: 0 }),
        }
    }

    fn source_address(&self) -> Ipv6Addr {
        if self.cone {
            CONE_SOURCE
        } else {
            RESTRICT_SOURCE
        }
    }
}

impl MaintenanceDriver for QualificationMaintenance {
    fn process(&self, packet: &ParsedPacket<'_>) -> MaintenanceOutcome {
        if packet.source_ipv4 != self.server_ipv4 || packet.source_port != IPPORT_TEREDO {
            return MaintenanceOutcome::NotMine;
        }

        match parse_router_advertisement(packet.ip6, self.source_address()) {
            Some(mut update) => {
                update.server_ipv4 = self.server_ipv4;
                let mut retry = self.retry.lock().unwrap();
                retry.attempts = 0;
                MaintenanceOutcome::Qualified(update)
            }
            None => MaintenanceOutcome::Pending,
        }
    }

    fn poll_solicit(&self, now: u64) -> Option<Vec<u8>> {
        let mut retry = self.retry.lock().unwrap();
        if retry.attempts >= 3 {
            return None;
        }
        if retry.attempts > 0 && now.saturating_sub(retry.last_sent) < 4 {
            return None;
        }
        retry.attempts += 1;
        retry.last_sent = now;
        Some(encode_router_solicitation(self.nonce, self.source_address()))
    }
}

/// Builds a minimal router solicitation body (authentication header plus an
/// ICMPv6 Router Solicitation over an IPv6 header) addressed to
/// `ff02::2`, as sent toward `IPPORT_TEREDO` on the server.
pub fn encode_router_solicitation(nonce: [u8; 8], source: Ipv6Addr) -> Vec<u8> {
    let mut auth = crate::wire::encode_auth_header(&[], &[], &nonce, 0);

    let all_routers = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);
    let mut ip6 = Vec::with_capacity(40 + 8);
    ip6.push(0x60);
    ip6.extend_from_slice(&[0, 0, 0]);
    let plen: u16 = 8;
    ip6.extend_from_slice(&plen.to_be_bytes());
    ip6.push(IPPROTO_ICMPV6);
    ip6.push(255); // hop limit
    ip6.extend_from_slice(&source.octets());
    ip6.extend_from_slice(&all_routers.octets());
    ip6.extend_from_slice(&[133, 0, 0, 0, 0, 0, 0, 0]); // ND_ROUTER_SOLICIT, reserved

    auth.append(&mut ip6);
    auth
}

/// Parses a router advertisement per RFC 4380 §5.2.1/RFC 4861, extracting
/// the advertised prefix/server/flags/mapping from its prefix-information
/// option and the link MTU from its MTU option, if present.
///
/// `expected_dst` must match the address we solicited from (cone vs.
/// restricted), matching the original's requirement that the RA be
/// addressed back to the address that sent the solicitation.
pub fn parse_router_advertisement(data: &[u8], expected_dst: Ipv6Addr) -> Option<QualificationUpdate> {
    let ip6 = Ipv6HeaderView::parse(data)?;
    if ip6.destination() != expected_dst {
        return None;
    }
    if ip6.next_header() != IPPROTO_ICMPV6 {
        return None;
    }

    let payload = ip6.payload();
    if payload.len() < 16 {
        return None;
    }
    if payload[0] != ND_ROUTER_ADVERT || payload[1] != 0 {
        return None;
    }

    let mut prefix = None;
    let mut server_ipv4 = None;
    let mut mtu = 1280u16;

    let mut offset = 16usize; // past the fixed RA header
    while offset + 8 <= payload.len() {
        let opt_type = payload[offset];
        let opt_len_units = payload[offset + 1] as usize;
        if opt_len_units == 0 {
            return None;
        }
        let opt_len = opt_len_units * 8;
        if offset + opt_len > payload.len() {
            return None;
        }

        match opt_type {
            ND_OPT_PREFIX_INFORMATION if opt_len >= 32 => {
                if prefix.is_some() {
                    return None; // multiple prefixes are excluded by the specification
                }
                let pfx = u32::from_be_bytes(payload[offset + 16..offset + 20].try_into().ok()?);
                let server = u32::from_be_bytes(payload[offset + 20..offset + 24].try_into().ok()?);
                prefix = Some(pfx);
                server_ipv4 = Some(Ipv4Addr::from(server));
            }
            ND_OPT_MTU if opt_len >= 8 => {
                mtu = u32::from_be_bytes(payload[offset + 4..offset + 8].try_into().ok()?)
                    .min(u16::MAX as u32) as u16;
            }
            _ => {}
        }

        offset += opt_len;
    }

    let prefix = prefix?;
    let server_ipv4 = server_ipv4?;

    let addr = TeredoAddress::from(ip6.destination());
    let _ = addr; // destination carries our own solicited address, not the mapping

    // The mapped client IPv4/port are only known via the origin indication
    // that should accompany this datagram; callers fill those in separately
    // when an origin indication was present. Here we report a zeroed
    // mapping and let the caller overwrite it.
    Some(QualificationUpdate {
        prefix,
        server_ipv4,
        flags: if expected_dst == CONE_SOURCE { crate::address::TEREDO_FLAG_CONE } else { 0 },
        mapped_ipv4: Ipv4Addr::UNSPECIFIED,
        mapped_port: 0,
        mtu,
    })
}
