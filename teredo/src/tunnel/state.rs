//! Qualification snapshot and the lock-ordering guard around it.

use std::net::Ipv4Addr;

use crate::address::TeredoAddress;

/// A consistent, copyable snapshot of the tunnel's qualification status.
/// Readers take the state lock only long enough to clone this and release
/// it before doing any I/O, per the module's locking discipline.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualificationState {
    pub up: bool,
    pub addr: TeredoAddressOpt,
    pub mapped_ipv4: Ipv4Addr,
    pub mapped_port: u16,
    pub server_ipv4: Ipv4Addr,
    pub mtu: u16,
    pub cone: bool,
}

/// `Option<TeredoAddress>` with a cheap `Default`, so `QualificationState`
/// can derive `Default` for the "not yet qualified" initial value.
#[derive(Debug, Clone, Copy)]
pub struct TeredoAddressOpt(pub Option<TeredoAddress>);

impl Default for TeredoAddressOpt {
    fn default() -> Self {
        TeredoAddressOpt(None)
    }
}

impl QualificationState {
    pub fn addr(&self) -> Option<TeredoAddress> {
        self.addr.0
    }
}

/// Panics in debug/test builds if the current thread holds any peer-entry
/// lock. Call this immediately before acquiring the qualification state's
/// write lock: the two must never nest, on pain of deadlock against a
/// thread that acquired them in the opposite order.
#[cfg(debug_assertions)]
pub fn assert_no_peer_locks_held() {
    let held = crate::peer::peer_locks_held();
    assert_eq!(
        held, 0,
        "attempted to acquire the qualification write lock while holding {} peer-entry lock(s)",
        held
    );
}

#[cfg(not(debug_assertions))]
pub fn assert_no_peer_locks_held() {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peer::PeerList;
    use std::net::Ipv6Addr;

    #[test]
    #[should_panic(expected = "peer-entry lock")]
    fn holding_a_peer_lock_across_state_lock_acquisition_panics() {
        let list = PeerList::new(4, 30);
        let (handle, _) = list.upsert(Ipv6Addr::LOCALHOST);
        let _guard = handle.lock();
        assert_no_peer_locks_held();
    }

    #[test]
    fn no_peer_lock_held_passes() {
        assert_no_peer_locks_held();
    }
}
