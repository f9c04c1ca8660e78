//! Inbound classifier: decides what to do with a UDP datagram handed to
//! [`super::Tunnel::on_datagram`], per RFC 4380 §5.2.7/§5.2.8 ("receiving a
//! Teredo packet"), ported branch-for-branch from `teredo_run` in the
//! original's `relay.c`.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};

use tracing::trace;

use crate::address::{self, TeredoAddress};
use crate::bubble;
use crate::ipv6::{Ipv6HeaderView, IPPROTO_ICMPV6};
use crate::maintenance::{MaintenanceOutcome, IPPORT_TEREDO};
use crate::peer::{count_bubble, count_ping, InboundPacket, RetryDecision};
use crate::ping;
use crate::wire;

use super::Tunnel;

/// Classifies a single inbound UDP datagram. Never blocks, never returns an
/// error: every drop path (malformed input, untrusted source, rate-limited
/// retry) is silent, matching [`super::transmit::transmit`]'s error policy.
pub fn process_datagram(tunnel: &Tunnel, datagram: &[u8], source_ipv4: Ipv4Addr, source_port: u16) {
    let parsed = match wire::parse(datagram, source_ipv4, source_port) {
        Ok(p) => p,
        Err(_) => {
            trace!(%source_ipv4, source_port, "dropping malformed teredo datagram");
            return;
        }
    };

    let ip6 = match Ipv6HeaderView::parse(parsed.ip6) {
        Some(v) => v,
        None => {
            trace!("dropping datagram with missing or malformed inner ipv6 header");
            return;
        }
    };

    let is_client = tunnel.is_client();
    let state = tunnel.state_snapshot();
    let now = tunnel.clock.now();
    let prefix = state.addr().map(|a| a.prefix()).unwrap_or(address::TEREDO_PREFIX);

    if is_client {
        if let Some(maintenance) = tunnel.maintenance() {
            match maintenance.process(&parsed) {
                MaintenanceOutcome::Pending => return,
                MaintenanceOutcome::Qualified(update) => {
                    let (mapped_ipv4, mapped_port) = parsed
                        .orig_ipv4
                        .zip(parsed.orig_port)
                        .unwrap_or((source_ipv4, source_port));
                    tunnel.transition_up(update, mapped_ipv4, mapped_port);
                    return;
                }
                MaintenanceOutcome::NotMine => {
                    if !state.up {
                        // An unqualified client has nothing else to trust yet.
                        return;
                    }
                }
            }
        }
    }

    if is_client && tunnel.is_our_server(source_ipv4) && ip6.is_bubble() {
        let (orig_ipv4, orig_port) = parsed
            .orig_ipv4
            .zip(parsed.orig_port)
            .unwrap_or((source_ipv4, source_port));
        if address::is_global_ipv4(orig_ipv4) {
            let reply = bubble::encode(ip6.destination(), ip6.source());
            let _ = tunnel.send_with_retry(&reply, SocketAddrV4::new(orig_ipv4, orig_port));
        }
        return;
    }

    if is_client && crate::ipv6::is_link_local(&ip6.source()) {
        trace!("dropping link-local-sourced datagram");
        return;
    }

    let src_is_teredo = address::is_destination_teredo(&ip6.source(), prefix);

    if !is_client && !src_is_teredo {
        // A relay only ever speaks Teredo to Teredo-addressed sources.
        return;
    }

    if is_client && ip6.is_bubble() {
        if let Some(handle) = accept_local_discovery_bubble(tunnel, &ip6, source_ipv4, source_port, now) {
            let mut peer = handle.lock();
            if let RetryDecision::Send = count_bubble(&mut peer, now) {
                let target = SocketAddrV4::new(source_ipv4, source_port);
                let reply = bubble::encode(ip6.destination(), ip6.source());
                drop(peer);
                let _ = tunnel.send_with_retry(&reply, target);
            }
            return;
        }
    }

    if crate::ipv6::is_multicast(&ip6.destination()) {
        return;
    }

    let peer = tunnel.peers.lookup(ip6.source());

    // Case 1: a match against an already-trusted mapping.
    if let Some(handle) = &peer {
        let mut p = handle.lock();
        if p.trusted && p.mapped_ipv4 == source_ipv4 && p.mapped_port == source_port {
            p.touch_rx(now);
            p.reset_counters();
            let queued = tunnel.peers.drain_out(&mut p);
            drop(p);
            flush_out(tunnel, queued, source_ipv4, source_port);
            tunnel.emit_recv(ip6.raw());
            return;
        }
    }

    // Case 2 (client only): an authenticated reply to a ping we sent while
    // probing a non-Teredo peer's reachability through our server.
    if is_client {
        if let Some(our_addr) = state.addr().map(|a| a.as_ipv6()) {
            if is_ping_reply(tunnel, our_addr, &ip6) {
                let (handle, _) = tunnel.peers.upsert(ip6.source());
                let mut p = handle.lock();
                p.trusted = true;
                p.set_mapping(source_ipv4, source_port);
                p.touch_rx(now);
                p.reset_counters();
                let queued = tunnel.peers.drain_out(&mut p);
                drop(p);
                flush_out(tunnel, queued, source_ipv4, source_port);
                return;
            }
        }
    }

    // Cases 3/5/6 (local)/bubble: an untrusted Teredo-sourced match that
    // nonetheless clears one of the acceptance checks below.
    let mut accept = false;
    if src_is_teredo {
        let teredo_src = TeredoAddress::from(ip6.source());
        if teredo_src.client_ipv4() == source_ipv4 && teredo_src.client_port() == source_port {
            accept = true; // Case 3: claimed mapping matches the real UDP source.
        }
    }
    if !accept {
        if let Some(handle) = &peer {
            let p = handle.lock();
            if p.local && p.mapped_ipv4 == source_ipv4 && p.mapped_port == source_port {
                accept = true; // Case 5: already-known local peer, endpoint matches.
            }
        }
    }
    if !accept && peer.is_none() && bubble::is_local_source(&ip6, prefix, source_ipv4) {
        accept = true; // Previously-unseen, plausibly local source.
    }
    if !accept && ip6.is_bubble() && bubble::check_bubble(&tunnel.hmac, &ip6, &parsed) {
        accept = true; // Authenticated bubble (HMAC nonce or vouched-for origin).
    }

    if accept {
        let (handle, _) = tunnel.peers.upsert(ip6.source());
        let mut p = handle.lock();
        p.trusted = true;
        p.set_mapping(source_ipv4, source_port);
        p.touch_rx(now);
        p.reset_counters();
        let queued = tunnel.peers.drain_out(&mut p);
        let is_bubble = ip6.is_bubble();
        drop(p);
        flush_out(tunnel, queued, source_ipv4, source_port);
        if !is_bubble {
            tunnel.emit_recv(ip6.raw());
        }
        return;
    }

    // Case 6 (client only): a non-Teredo, wholly unauthenticated source.
    // Queue the packet and probe it with an authenticated ping through our
    // server before ever trusting it.
    if is_client && !src_is_teredo {
        let (handle, _) = tunnel.peers.upsert(ip6.source());
        let mut p = handle.lock();
        tunnel.peers.enqueue_in(
            &mut p,
            InboundPacket {
                data: ip6.raw().to_vec(),
                source_ipv4,
                source_port,
            },
        );
        p.touch_rx(now);
        if let RetryDecision::Send = count_ping(&mut p, now) {
            let our_addr = state.addr().map(|a| a.as_ipv6());
            let server = tunnel.primary_server();
            drop(p);
            if let (Some(our_addr), Some(server)) = (our_addr, server) {
                let request = ping::build_echo_request(&tunnel.hmac, our_addr, ip6.source());
                let _ = tunnel.send_with_retry(&request, SocketAddrV4::new(server, IPPORT_TEREDO));
            }
        }
        return;
    }
}

/// Checks whether a freshly-seen bubble source plausibly belongs to our own
/// LAN segment (§4.6 Case 4) and, if so, upserts and marks the peer local —
/// resetting its bubble counter only on the first transition into `local`,
/// per the asymmetric reset the original implementation applies (repeatedly
/// re-seeing the same local peer must not keep resetting its budget).
fn accept_local_discovery_bubble(
    tunnel: &Tunnel,
    ip6: &Ipv6HeaderView<'_>,
    source_ipv4: Ipv4Addr,
    source_port: u16,
    now: u64,
) -> Option<crate::peer::PeerHandle> {
    let state = tunnel.state_snapshot();
    let prefix = state.addr().map(|a| a.prefix()).unwrap_or(address::TEREDO_PREFIX);
    if !bubble::is_local_source(ip6, prefix, source_ipv4) {
        return None;
    }

    let (handle, created) = tunnel.peers.upsert(ip6.source());
    let mut p = handle.lock();
    if created || !p.local {
        p.reset_counters();
    }
    p.local = true;
    p.set_mapping(source_ipv4, source_port);
    p.touch_rx(now);
    drop(p);
    Some(handle)
}

fn is_ping_reply(tunnel: &Tunnel, our_addr: Ipv6Addr, ip6: &Ipv6HeaderView<'_>) -> bool {
    if ip6.next_header() != IPPROTO_ICMPV6 {
        return false;
    }
    let body = ip6.payload();
    if ping::verify_echo_reply(&tunnel.hmac, our_addr, ip6.source(), body) {
        return true;
    }

    // ICMPv6 Destination Unreachable kludge: some middleboxes/servers return
    // our own original Echo Request, embedded, instead of a proper reply.
    const ICMPV6_DEST_UNREACH: u8 = 1;
    const ICMPV6_ERROR_HEADER_LEN: usize = 8;
    if body.len() > ICMPV6_ERROR_HEADER_LEN && body[0] == ICMPV6_DEST_UNREACH {
        let embedded = &body[ICMPV6_ERROR_HEADER_LEN..];
        if let Some(inner) = Ipv6HeaderView::parse(embedded) {
            if inner.source() == our_addr
                && ping::verify_echo_request(&tunnel.hmac, inner.source(), inner.destination(), inner.payload())
            {
                return true;
            }
        }
    }
    false
}

fn flush_out(tunnel: &Tunnel, queued: Vec<crate::peer::OutboundPacket>, ipv4: Ipv4Addr, port: u16) {
    let target = SocketAddrV4::new(ipv4, port);
    for packet in queued {
        let _ = tunnel.send_with_retry(&packet.data, target);
    }
}
