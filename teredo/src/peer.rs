//! Bounded peer table: per-peer NAT hole-punching state, with per-entry
//! locking, an expiry policy and LRU eviction at capacity.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::address::TeredoAddress;

/// Entries beyond this count are evicted LRU-first (relay default; the
/// original falls back to a fixed 1024 without a large-map backend, or
/// up to ~1M with one — we only ever use a `HashMap`, so 1024 is the
/// single default here too).
pub const MAX_PEERS_DEFAULT: usize = 1024;

/// Default byte budget shared by every peer's outbound/inbound queues.
pub const MAX_QUEUE_BYTES_DEFAULT: usize = 64 * 1024;

#[cfg(debug_assertions)]
thread_local! {
    pub(crate) static PEER_LOCKS_HELD: std::cell::Cell<u32> = std::cell::Cell::new(0);
}

/// An IPv6 packet awaiting first-contact confirmation of the peer's mapping.
pub struct OutboundPacket {
    pub data: Vec<u8>,
}

/// An inbound IPv6 packet held until the sending peer is authenticated.
pub struct InboundPacket {
    pub data: Vec<u8>,
    pub source_ipv4: Ipv4Addr,
    pub source_port: u16,
}

/// Per-peer hole-punching and trust state.
#[derive(Default)]
pub struct PeerEntry {
    pub mapped_ipv4: Ipv4Addr,
    pub mapped_port: u16,
    pub trusted: bool,
    pub local: bool,
    pub bubbles: u8,
    pub pings: u8,
    pub last_tx: u64,
    pub last_ping: u64,
    pub last_rx: u64,
    pub out_queue: VecDeque<OutboundPacket>,
    pub in_queue: VecDeque<InboundPacket>,
}

impl PeerEntry {
    fn new() -> Self {
        PeerEntry::default()
    }

    pub fn set_mapping(&mut self, ipv4: Ipv4Addr, port: u16) {
        self.mapped_ipv4 = ipv4;
        self.mapped_port = port;
    }

    pub fn set_mapping_from_address(&mut self, addr: &TeredoAddress) {
        self.set_mapping(addr.client_ipv4(), addr.client_port());
    }

    pub fn touch_tx(&mut self, now: u64) {
        self.last_tx = now;
    }

    pub fn touch_rx(&mut self, now: u64) {
        self.last_rx = now;
    }

    pub fn is_valid(&self, now: u64, valid_lifetime: u64) -> bool {
        now.saturating_sub(self.last_rx) <= valid_lifetime
    }

    /// Clears trust-building counters, done on a fresh trusted match.
    pub fn reset_counters(&mut self) {
        self.bubbles = 0;
        self.pings = 0;
    }
}

/// Outcome of [`PeerEntry::count_bubble`]/`count_ping`-style rate gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Caller may send now.
    Send,
    /// A send happened too recently; wait.
    Wait,
    /// The retry budget for this window is exhausted.
    Exhausted,
}

/// Bubble budget: at most 4 per 300-second window (RFC 4380 §5.2.6),
/// resetting once the window elapses after exhaustion.
pub fn count_bubble(peer: &mut PeerEntry, now: u64) -> RetryDecision {
    let decision = if peer.bubbles > 0 {
        if peer.bubbles >= 4 {
            if now.saturating_sub(peer.last_tx) <= 300 {
                RetryDecision::Exhausted
            } else {
                peer.bubbles = 0;
                RetryDecision::Send
            }
        } else if now.saturating_sub(peer.last_tx) <= 2 {
            RetryDecision::Wait
        } else {
            RetryDecision::Send
        }
    } else {
        RetryDecision::Send
    };

    if decision == RetryDecision::Send {
        peer.last_tx = now;
        peer.bubbles += 1;
    }
    decision
}

/// Ping budget: at most 4 attempts (once plus 3 repeats), each separated
/// by at least 2 seconds.
pub fn count_ping(peer: &mut PeerEntry, now: u64) -> RetryDecision {
    let decision = if peer.pings == 0 {
        RetryDecision::Send
    } else if peer.pings >= 4 {
        RetryDecision::Exhausted
    } else if now.saturating_sub(peer.last_ping) <= 2 {
        RetryDecision::Wait
    } else {
        RetryDecision::Send
    };

    if decision == RetryDecision::Send {
        peer.last_ping = now;
        peer.pings += 1;
    }
    decision
}

/// A held, locked reference to a peer entry, returned by
/// [`PeerList::lookup`]/[`PeerList::upsert`]. Call `.lock()` to obtain the
/// guard; dropping the guard is the "release" step the classifiers are
/// specified to perform before any operation that might acquire the
/// tunnel's qualification lock.
#[derive(Clone)]
pub struct PeerHandle {
    entry: Arc<Mutex<PeerEntry>>,
}

impl PeerHandle {
    pub fn lock(&self) -> PeerGuard<'_> {
        PeerGuard::new(self.entry.lock().unwrap())
    }
}

/// RAII guard over a locked [`PeerEntry`]. In debug builds, tracks how many
/// peer-entry locks the current thread holds so the qualification
/// write-lock acquisition path can assert none are held (see
/// [`crate::tunnel::state::assert_no_peer_locks_held`]).
pub struct PeerGuard<'a> {
    guard: MutexGuard<'a, PeerEntry>,
}

impl<'a> PeerGuard<'a> {
    fn new(guard: MutexGuard<'a, PeerEntry>) -> Self {
        #[cfg(debug_assertions)]
        PEER_LOCKS_HELD.with(|c| c.set(c.get() + 1));
        PeerGuard { guard }
    }
}

impl<'a> Drop for PeerGuard<'a> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        PEER_LOCKS_HELD.with(|c| c.set(c.get().saturating_sub(1)));
    }
}

impl<'a> Deref for PeerGuard<'a> {
    type Target = PeerEntry;
    fn deref(&self) -> &PeerEntry {
        &self.guard
    }
}

impl<'a> DerefMut for PeerGuard<'a> {
    fn deref_mut(&mut self) -> &mut PeerEntry {
        &mut self.guard
    }
}

struct Inner {
    map: HashMap<std::net::Ipv6Addr, Arc<Mutex<PeerEntry>>>,
    lru: VecDeque<std::net::Ipv6Addr>,
    capacity: usize,
    valid_lifetime: u64,
}

impl Inner {
    fn touch_lru(&mut self, key: std::net::Ipv6Addr) {
        if let Some(pos) = self.lru.iter().position(|k| *k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_back(key);
    }

    fn evict_one(&mut self) {
        if let Some(victim) = self.lru.pop_front() {
            self.map.remove(&victim);
        }
    }
}

/// Bounded mapping from peer IPv6 address to peer state.
pub struct PeerList {
    inner: Mutex<Inner>,
    queued_bytes: AtomicUsize,
    max_queue_bytes: usize,
}

impl PeerList {
    pub fn new(capacity: usize, valid_lifetime: u64) -> Self {
        PeerList {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                lru: VecDeque::new(),
                capacity,
                valid_lifetime,
            }),
            queued_bytes: AtomicUsize::new(0),
            max_queue_bytes: MAX_QUEUE_BYTES_DEFAULT,
        }
    }

    pub fn valid_lifetime(&self) -> u64 {
        self.inner.lock().unwrap().valid_lifetime
    }

    /// Returns a handle to an existing entry, or `None` if absent. Does not
    /// create an entry and does not affect LRU ordering beyond a touch.
    pub fn lookup(&self, key: std::net::Ipv6Addr) -> Option<PeerHandle> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.map.get(&key).cloned()?;
        inner.touch_lru(key);
        Some(PeerHandle { entry })
    }

    /// Returns a handle to an existing entry, or inserts a zeroed one.
    /// Evicts the least-recently-used entry if at capacity.
    pub fn upsert(&self, key: std::net::Ipv6Addr) -> (PeerHandle, bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.map.get(&key).cloned() {
            inner.touch_lru(key);
            return (PeerHandle { entry }, false);
        }

        if inner.map.len() >= inner.capacity {
            inner.evict_one();
        }

        let entry = Arc::new(Mutex::new(PeerEntry::new()));
        inner.map.insert(key, entry.clone());
        inner.touch_lru(key);
        (PeerHandle { entry }, true)
    }

    /// Drops all entries and resets capacity/expiry, as done on
    /// qualification-up (the client's valid lifetime is wider than a
    /// relay's, to cover local peers).
    pub fn reset(&self, new_capacity: usize, new_valid_lifetime: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.lru.clear();
        inner.capacity = new_capacity;
        inner.valid_lifetime = new_valid_lifetime;
        self.queued_bytes.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    /// Enqueues an outbound packet, evicting this peer's own oldest queued
    /// packets (never another peer's) if the shared byte budget would be
    /// exceeded. Never blocks.
    pub fn enqueue_out(&self, entry: &mut PeerEntry, data: Vec<u8>) {
        let len = data.len();
        entry.out_queue.push_back(OutboundPacket { data });
        self.queued_bytes.fetch_add(len, Ordering::Relaxed);
        while self.queued_bytes.load(Ordering::Relaxed) > self.max_queue_bytes {
            match entry.out_queue.pop_front() {
                Some(evicted) => {
                    self.queued_bytes.fetch_sub(evicted.data.len(), Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    pub fn enqueue_in(&self, entry: &mut PeerEntry, packet: InboundPacket) {
        let len = packet.data.len();
        entry.in_queue.push_back(packet);
        self.queued_bytes.fetch_add(len, Ordering::Relaxed);
        while self.queued_bytes.load(Ordering::Relaxed) > self.max_queue_bytes {
            match entry.in_queue.pop_front() {
                Some(evicted) => {
                    self.queued_bytes.fetch_sub(evicted.data.len(), Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    /// Drains and returns every queued outbound packet for this peer.
    pub fn drain_out(&self, entry: &mut PeerEntry) -> Vec<OutboundPacket> {
        let drained: Vec<_> = entry.out_queue.drain(..).collect();
        let bytes: usize = drained.iter().map(|p| p.data.len()).sum();
        self.queued_bytes.fetch_sub(bytes, Ordering::Relaxed);
        drained
    }

    /// Drains and returns every queued inbound packet for this peer.
    pub fn drain_in(&self, entry: &mut PeerEntry) -> Vec<InboundPacket> {
        let drained: Vec<_> = entry.in_queue.drain(..).collect();
        let bytes: usize = drained.iter().map(|p| p.data.len()).sum();
        self.queued_bytes.fetch_sub(bytes, Ordering::Relaxed);
        drained
    }
}

#[cfg(debug_assertions)]
pub(crate) fn peer_locks_held() -> u32 {
    PEER_LOCKS_HELD.with(|c| c.get())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv6Addr;

    fn addr(n: u16) -> Ipv6Addr {
        Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, n)
    }

    #[test]
    fn upsert_then_lookup_finds_same_entry() {
        let list = PeerList::new(16, 30);
        let (handle, created) = list.upsert(addr(1));
        assert!(created);
        handle.lock().mapped_port = 4242;

        let found = list.lookup(addr(1)).unwrap();
        assert_eq!(found.lock().mapped_port, 4242);
    }

    #[test]
    fn lookup_missing_returns_none() {
        let list = PeerList::new(16, 30);
        assert!(list.lookup(addr(99)).is_none());
    }

    #[test]
    fn evicts_lru_at_capacity() {
        let list = PeerList::new(2, 30);
        list.upsert(addr(1));
        list.upsert(addr(2));
        // touches addr(1) most-recently-used
        list.lookup(addr(1));
        list.upsert(addr(3));

        assert!(list.lookup(addr(2)).is_none());
        assert!(list.lookup(addr(1)).is_some());
        assert!(list.lookup(addr(3)).is_some());
    }

    #[test]
    fn bubble_budget_caps_at_four_per_window() {
        let mut entry = PeerEntry::new();
        assert_eq!(count_bubble(&mut entry, 0), RetryDecision::Send);
        assert_eq!(count_bubble(&mut entry, 3), RetryDecision::Send);
        assert_eq!(count_bubble(&mut entry, 6), RetryDecision::Send);
        assert_eq!(count_bubble(&mut entry, 9), RetryDecision::Send);
        assert_eq!(entry.bubbles, 4);
        assert_eq!(count_bubble(&mut entry, 12), RetryDecision::Exhausted);
        assert_eq!(count_bubble(&mut entry, 310), RetryDecision::Send);
    }

    #[test]
    fn bubble_wait_within_two_seconds() {
        let mut entry = PeerEntry::new();
        assert_eq!(count_bubble(&mut entry, 100), RetryDecision::Send);
        assert_eq!(count_bubble(&mut entry, 101), RetryDecision::Wait);
    }

    #[test]
    fn ping_budget_caps_at_four_attempts() {
        let mut entry = PeerEntry::new();
        assert_eq!(count_ping(&mut entry, 0), RetryDecision::Send);
        assert_eq!(count_ping(&mut entry, 3), RetryDecision::Send);
        assert_eq!(count_ping(&mut entry, 6), RetryDecision::Send);
        assert_eq!(count_ping(&mut entry, 9), RetryDecision::Send);
        assert_eq!(entry.pings, 4);
        assert_eq!(count_ping(&mut entry, 12), RetryDecision::Exhausted);
    }

    #[test]
    fn queue_overflow_evicts_oldest_of_same_peer() {
        let list = PeerList::new(16, 30);
        let (handle, _) = list.upsert(addr(1));
        let mut guard = handle.lock();

        list.enqueue_out(&mut guard, vec![0u8; MAX_QUEUE_BYTES_DEFAULT - 10]);
        list.enqueue_out(&mut guard, vec![0u8; 20]);

        // oldest packet must have been evicted to respect the byte budget
        assert_eq!(guard.out_queue.len(), 1);
        assert_eq!(guard.out_queue[0].data.len(), 20);
    }

    #[test]
    fn peer_is_valid_within_lifetime() {
        let entry = PeerEntry { last_rx: 10, ..PeerEntry::new() };
        assert!(entry.is_valid(35, 30));
        assert!(!entry.is_valid(41, 30));
    }
}
