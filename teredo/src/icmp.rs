//! ICMPv6 Destination Unreachable construction and rate limiting.
//!
//! The checksum is intentionally left at zero: this layer has no way to know
//! which IPv6 source address the caller's network stack will eventually use,
//! so checksum computation is left to the external `icmpv6` callback.

use std::sync::Mutex;

use crate::clock::Clock;
use crate::ipv6::IPPROTO_ICMPV6;

/// ICMPv6 Destination Unreachable codes we emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachCode {
    /// No route / address unreachable.
    Addr,
    /// Administratively prohibited.
    Admin,
}

impl UnreachCode {
    fn as_u8(self) -> u8 {
        match self {
            UnreachCode::Addr => 3,
            UnreachCode::Admin => 1,
        }
    }
}

const ICMP6_DST_UNREACH: u8 = 1;
const ICMP6_HEADER_LEN: usize = 8;
const IPV6_HEADER_LEN: usize = 40;
const MTU: usize = 1280;

/// Builds an ICMPv6 Destination Unreachable message embedding as much of
/// `offending` as fits within a 1280-byte MTU budget.
///
/// Returns `None` (meaning: do not emit anything) if:
/// - `offending` is shorter than a full IPv6 header,
/// - `offending` is itself a non-informational (error) ICMPv6 message,
/// - the offending destination is multicast,
/// - the offending source is multicast or unspecified.
pub fn build_unreach(code: UnreachCode, offending: &[u8]) -> Option<Vec<u8>> {
    if offending.len() < IPV6_HEADER_LEN {
        return None;
    }

    let next_header = offending[6];
    if next_header == IPPROTO_ICMPV6 && offending.len() > IPV6_HEADER_LEN {
        let icmp_type = offending[IPV6_HEADER_LEN];
        // ICMPv6 error messages have type < 128 (high bit clear); we must
        // not generate an error in response to an error.
        if icmp_type & 0x80 == 0 {
            return None;
        }
    }

    let dst = &offending[24..40];
    if dst[0] == 0xff {
        return None; // multicast destination
    }

    let src = &offending[8..24];
    if src[0] == 0xff {
        return None; // multicast source
    }
    if src.iter().all(|&b| b == 0) {
        return None; // unspecified source
    }

    let mut out = Vec::with_capacity(ICMP6_HEADER_LEN + offending.len().min(MTU));
    out.push(ICMP6_DST_UNREACH);
    out.push(code.as_u8());
    out.extend_from_slice(&[0, 0]); // checksum, filled in by the caller
    out.extend_from_slice(&[0, 0, 0, 0]); // unused

    let budget = MTU - IPV6_HEADER_LEN - ICMP6_HEADER_LEN;
    let take = offending.len().min(budget);
    out.extend_from_slice(&offending[..take]);

    Some(out)
}

/// Per-tunnel token bucket limiting ICMPv6 unreachable callback emission.
pub struct RateLimiter {
    rate_limit_ms: u32,
    state: Mutex<(u64, i64)>,
}

impl RateLimiter {
    pub fn new(rate_limit_ms: u32) -> Self {
        RateLimiter { rate_limit_ms, state: Mutex::new((0, 1)) }
    }

    /// Attempts to consume one token for the current second. Returns
    /// `false` if the per-second budget is exhausted.
    pub fn try_acquire(&self, clock: &Clock) -> bool {
        let now = clock.now();
        let mut state = self.state.lock().unwrap();

        if now != state.0 {
            state.0 = now;
            state.1 = if self.rate_limit_ms == 0 {
                -1
            } else {
                (1000 / self.rate_limit_ms) as i64
            };
        }

        if state.1 == 0 {
            return false;
        }
        if state.1 > 0 {
            state.1 -= 1;
        }
        true
    }
}
