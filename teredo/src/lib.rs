//! A userspace Teredo (RFC 4380) tunneling engine: IPv6-in-UDP-in-IPv4
//! transition tunneling for hosts behind an IPv4 NAT.
//!
//! This crate implements the protocol engine only — address codec, wire
//! framing, peer-mapping hole-punching, qualification handshake, and the
//! transmit/receive classifiers that decide how a packet crosses the
//! boundary between the local IPv6 stack and the Teredo UDP/IPv4 path. It
//! does not open a TUN/TAP device or otherwise attach itself to the host
//! network stack; callers own that boundary and drive the engine through
//! [`Tunnel::transmit_packet`]/[`Tunnel::on_datagram`] and the callbacks
//! registered on [`TunnelBuilder`].

pub mod address;
pub mod bubble;
pub mod clock;
pub mod discovery;
pub mod error;
pub mod hmac;
pub mod icmp;
pub mod ipv6;
pub mod maintenance;
pub mod peer;
pub mod ping;
pub mod tunnel;
pub mod wire;

pub use address::TeredoAddress;
pub use error::{Result, TeredoError};
pub use tunnel::{Role, Tunnel, TunnelBuilder};
