//! The tunnel engine: binds a UDP socket, owns the peer table and
//! qualification state, and classifies packets crossing the boundary
//! between the local IPv6 stack and the Teredo UDP/IPv4 path.

mod receive;
pub mod state;
mod transmit;

use std::any::Any;
use std::convert::TryFrom;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::clock::Clock;
use crate::discovery::{LocalDiscovery, NullDiscovery};
use crate::error::{Result, TeredoError};
use crate::hmac::HmacKey;
use crate::icmp::RateLimiter;
use crate::maintenance::{MaintenanceDriver, QualificationMaintenance};
use crate::peer::PeerList;
use crate::peer::MAX_PEERS_DEFAULT;

pub use state::QualificationState;
pub use receive::process_datagram;
pub use transmit::transmit;

const ICMP_RATE_LIMIT_MS: u32 = 100;

/// Valid-lifetime window a qualified client applies to its peer table —
/// wider than a relay's default (30s) since a client's peers include
/// slow-to-retry local-discovery neighbours.
const CLIENT_VALID_LIFETIME: u64 = 600;

/// Whether a tunnel acts as a relay (routes for arbitrary Teredo clients)
/// or a client (originates its own Teredo address via qualification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Relay,
    Client,
}

pub type RecvCallback = Box<dyn Fn(&[u8]) + Send + Sync>;
pub type IcmpCallback = Box<dyn Fn(&[u8], std::net::Ipv6Addr) + Send + Sync>;
pub type StateUpCallback = Box<dyn Fn(std::net::Ipv6Addr, u16) + Send + Sync>;
pub type StateDownCallback = Box<dyn Fn() + Send + Sync>;

/// Client-only collaborators and addresses, absent entirely on a relay —
/// the direct analogue of the teacher's `#ifdef MIREDO_TEREDO_CLIENT` block
/// of `struct teredo_tunnel` fields, expressed as an optional field instead
/// of a compile-time flag.
struct ClientState {
    maintenance: Box<dyn MaintenanceDriver>,
    discovery: Mutex<Box<dyn LocalDiscovery>>,
    primary_server: Ipv4Addr,
    #[allow(dead_code)]
    secondary_server: Option<Ipv4Addr>,
}

pub struct Tunnel {
    pub(crate) socket: UdpSocket,
    pub(crate) bind_addr: SocketAddrV4,
    pub(crate) cone: bool,
    client: Option<ClientState>,

    pub(crate) state: RwLock<QualificationState>,
    pub(crate) peers: PeerList,
    pub(crate) hmac: Arc<HmacKey>,
    pub(crate) clock: Clock,
    pub(crate) ratelimit: RateLimiter,

    recv_cb: Mutex<Option<RecvCallback>>,
    icmpv6_cb: Mutex<Option<IcmpCallback>>,
    up_cb: Mutex<Option<StateUpCallback>>,
    down_cb: Mutex<Option<StateDownCallback>>,
    privdata: Mutex<Option<Box<dyn Any + Send>>>,

    running: AtomicBool,
    shutdown: AtomicBool,
}

impl Tunnel {
    pub(crate) fn is_client(&self) -> bool {
        self.client.is_some()
    }

    fn state_snapshot(&self) -> QualificationState {
        *self.state.read().unwrap()
    }

    fn maintenance(&self) -> Option<&dyn MaintenanceDriver> {
        self.client.as_ref().map(|c| c.maintenance.as_ref())
    }

    fn primary_server(&self) -> Option<Ipv4Addr> {
        self.client.as_ref().map(|c| c.primary_server)
    }

    fn is_our_server(&self, addr: Ipv4Addr) -> bool {
        match &self.client {
            Some(c) => c.primary_server == addr || c.secondary_server == Some(addr),
            None => false,
        }
    }

    fn send_discovery_bubbles(&self) {
        if let Some(client) = &self.client {
            client.discovery.lock().unwrap().send_bubbles();
        }
    }

    /// Transitions the tunnel qualification state up (or refreshes the
    /// existing mapping), resets the peer list to the client's wider
    /// valid-lifetime window, and invokes the up-state callback. The
    /// qualification write lock is held across the callback invocation
    /// (§5: "the writer is held across state-change callback invocation
    /// to serialize notifications"); callers must not hold any peer-entry
    /// lock when calling this.
    pub(crate) fn transition_up(&self, mut update: crate::maintenance::QualificationUpdate, mapped_ipv4: Ipv4Addr, mapped_port: u16) {
        state::assert_no_peer_locks_held();
        update.mapped_ipv4 = mapped_ipv4;
        update.mapped_port = mapped_port;
        let addr = update.teredo_addr();

        let mut state = self.state.write().unwrap();
        state.up = true;
        state.addr = state::TeredoAddressOpt(Some(addr));
        state.mapped_ipv4 = mapped_ipv4;
        state.mapped_port = mapped_port;
        state.server_ipv4 = update.server_ipv4;
        state.mtu = update.mtu;
        state.cone = addr.is_cone();

        self.peers.reset(MAX_PEERS_DEFAULT, CLIENT_VALID_LIFETIME);

        if let Some(cb) = self.up_cb.lock().unwrap().as_ref() {
            cb(addr.as_ipv6(), update.mtu);
        }
    }

    /// Transitions the tunnel qualification state down and invokes the
    /// down-state callback, under the same locking discipline as
    /// [`Tunnel::transition_up`].
    pub(crate) fn transition_down(&self) {
        state::assert_no_peer_locks_held();
        let mut state = self.state.write().unwrap();
        if !state.up {
            return;
        }
        *state = QualificationState::default();

        if let Some(cb) = self.down_cb.lock().unwrap().as_ref() {
            cb();
        }
    }

    /// Installs (or replaces) the receive callback. Must be called before
    /// [`Tunnel::run_async`]; calling it afterwards returns
    /// `ConfigurationRefused` since callback slots are not meant to be
    /// reconfigured out from under a running receive thread.
    ///
    /// The callback may be invoked concurrently with `transmit` and must
    /// not call back into this tunnel's `transmit`/`shutdown` re-entrantly
    /// from the same thread that is holding the qualification lock.
    pub fn set_recv_callback<F>(&self, cb: F) -> Result<()>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.guard_not_running()?;
        *self.recv_cb.lock().unwrap() = Some(Box::new(cb));
        Ok(())
    }

    pub fn set_icmpv6_callback<F>(&self, cb: F) -> Result<()>
    where
        F: Fn(&[u8], std::net::Ipv6Addr) + Send + Sync + 'static,
    {
        self.guard_not_running()?;
        *self.icmpv6_cb.lock().unwrap() = Some(Box::new(cb));
        Ok(())
    }

    /// Installs the up/down qualification transition callbacks. No-op on a
    /// relay tunnel, which never transitions (it has no maintenance driver).
    pub fn set_state_callbacks<U, D>(&self, up: U, down: D) -> Result<()>
    where
        U: Fn(std::net::Ipv6Addr, u16) + Send + Sync + 'static,
        D: Fn() + Send + Sync + 'static,
    {
        self.guard_not_running()?;
        *self.up_cb.lock().unwrap() = Some(Box::new(up));
        *self.down_cb.lock().unwrap() = Some(Box::new(down));
        Ok(())
    }

    pub fn set_privdata<T: Send + 'static>(&self, value: T) -> Option<Box<dyn Any + Send>> {
        self.privdata.lock().unwrap().replace(Box::new(value))
    }

    pub fn get_privdata<T: Send + 'static>(&self) -> Option<T>
    where
        T: Clone,
    {
        self.privdata
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|b| b.downcast_ref::<T>())
            .cloned()
    }

    fn guard_not_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Err(TeredoError::ConfigurationRefused)
        } else {
            Ok(())
        }
    }

    /// Encapsulates and transmits an IPv6 packet, per the classifier in
    /// [`transmit::transmit`].
    pub fn transmit_packet(&self, packet: &[u8]) -> Result<()> {
        transmit::transmit(self, packet)
    }

    /// Applies a received UDP datagram from `(source_ipv4, source_port)`.
    /// Never blocks.
    pub fn on_datagram(&self, datagram: &[u8], source_ipv4: Ipv4Addr, source_port: u16) {
        receive::process_datagram(self, datagram, source_ipv4, source_port)
    }

    fn emit_recv(&self, ip6: &[u8]) {
        if let Some(cb) = self.recv_cb.lock().unwrap().as_ref() {
            cb(ip6);
        }
    }

    fn emit_icmpv6(&self, code: crate::icmp::UnreachCode, offending: &[u8]) {
        if !self.ratelimit.try_acquire(&self.clock) {
            return;
        }
        if let Some(packet) = crate::icmp::build_unreach(code, offending) {
            if offending.len() >= 24 {
                let src = std::net::Ipv6Addr::from(<[u8; 16]>::try_from(&offending[8..24]).unwrap());
                if let Some(cb) = self.icmpv6_cb.lock().unwrap().as_ref() {
                    cb(&packet, src);
                }
            }
        }
    }

    /// Sends with up to 10 retries on transient network errors, mirroring
    /// the retry loop a UDP socket to an unreachable peer can legitimately
    /// hit under NAT churn.
    pub(crate) fn send_with_retry(&self, buf: &[u8], dst: SocketAddrV4) -> std::io::Result<usize> {
        const RETRYABLE: &[i32] = &[
            libc::ENETUNREACH,
            libc::EHOSTUNREACH,
            libc::ENOPROTOOPT,
            libc::ECONNREFUSED,
            libc::EOPNOTSUPP,
            libc::EHOSTDOWN,
            #[cfg(target_os = "linux")]
            libc::ENONET,
        ];

        let mut last_err = None;
        for _ in 0..10 {
            match self.socket.send_to(buf, dst) {
                Ok(n) => return Ok(n),
                Err(e) => {
                    let retryable = e.raw_os_error().map_or(false, |code| RETRYABLE.contains(&code));
                    last_err = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::Other)))
    }

    /// Spawns the receive thread and runs until [`Tunnel::shutdown`] is
    /// called. Blocks the calling thread for the lifetime of the tunnel;
    /// callers typically spawn this onto its own `std::thread`.
    pub fn run_async(self: &Arc<Self>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let tunnel = Arc::clone(self);
        let mut buf = vec![0u8; 65536];

        loop {
            if tunnel.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match tunnel.socket.recv_from(&mut buf) {
                Ok((len, addr)) => {
                    if tunnel.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    if let std::net::SocketAddr::V4(v4) = addr {
                        tunnel.on_datagram(&buf[..len], *v4.ip(), v4.port());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    tunnel.poll_maintenance();
                    continue;
                }
                Err(_) => continue,
            }
        }
        Ok(())
    }

    fn poll_maintenance(&self) {
        let Some(client) = self.client.as_ref() else { return };
        if let Some(solicit) = client.maintenance.poll_solicit(self.clock.now()) {
            let dst = SocketAddrV4::new(client.primary_server, crate::maintenance::IPPORT_TEREDO);
            let _ = self.send_with_retry(&solicit, dst);
        }
    }

    /// Requests shutdown and unblocks a blocking `run_async` receive loop
    /// with a zero-length datagram sent to our own bound address.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.socket.send_to(&[], self.bind_addr);
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builds a [`Tunnel`]. Mirrors `teredo_create`'s parameterization
/// (cone/relay-or-client/server addresses) as a fluent builder rather than
/// a parameter struct, matching the teacher's own `Client`/`Smartglass`
/// client-builder style.
pub struct TunnelBuilder {
    bind_addr: SocketAddrV4,
    cone: bool,
    role: Role,
    primary_server: Option<Ipv4Addr>,
    secondary_server: Option<Ipv4Addr>,
    local_discovery: bool,
    discovery_impl: Option<Box<dyn LocalDiscovery>>,
}

impl TunnelBuilder {
    pub fn new(bind_addr: SocketAddrV4) -> Self {
        TunnelBuilder {
            bind_addr,
            cone: false,
            role: Role::Relay,
            primary_server: None,
            secondary_server: None,
            local_discovery: false,
            discovery_impl: None,
        }
    }

    pub fn cone(mut self, cone: bool) -> Self {
        self.cone = cone;
        self
    }

    pub fn relay(mut self) -> Self {
        self.role = Role::Relay;
        self
    }

    pub fn client(mut self, primary: Ipv4Addr, secondary: Option<Ipv4Addr>) -> Self {
        self.role = Role::Client;
        self.primary_server = Some(primary);
        self.secondary_server = secondary;
        self
    }

    pub fn local_discovery(mut self, enabled: bool) -> Self {
        self.local_discovery = enabled;
        self
    }

    /// Plugs in a same-LAN peer announcer/listener. Only takes effect when
    /// combined with [`local_discovery(true)`](Self::local_discovery); a
    /// tunnel with local discovery disabled always gets [`NullDiscovery`]
    /// regardless of this setting.
    pub fn discovery_impl(mut self, discovery: Box<dyn LocalDiscovery>) -> Self {
        self.discovery_impl = Some(discovery);
        self
    }

    pub fn build(self) -> Result<Tunnel> {
        let socket = bind_socket(self.bind_addr, self.role == Role::Client)?;

        let client = if self.role == Role::Client {
            let primary = self
                .primary_server
                .ok_or(TeredoError::ConfigurationRefused)?;
            // The announcer/listener implementation itself is an
            // out-of-scope collaborator (§1); a caller plugs one in via
            // `TunnelBuilder::discovery_impl`, gated on `local_discovery`
            // actually being enabled.
            let discovery: Box<dyn LocalDiscovery> = if self.local_discovery {
                self.discovery_impl.unwrap_or_else(|| Box::new(NullDiscovery))
            } else {
                Box::new(NullDiscovery)
            };
            Some(ClientState {
                maintenance: Box::new(QualificationMaintenance::new(primary, self.cone, [0u8; 8])),
                discovery: Mutex::new(discovery),
                primary_server: primary,
                secondary_server: self.secondary_server,
            })
        } else {
            None
        };

        Ok(Tunnel {
            socket,
            bind_addr: self.bind_addr,
            cone: self.cone,
            client,
            state: RwLock::new(QualificationState::default()),
            peers: PeerList::new(MAX_PEERS_DEFAULT, 30),
            hmac: Arc::new(HmacKey::generate()),
            clock: Clock::new(),
            ratelimit: RateLimiter::new(ICMP_RATE_LIMIT_MS),
            recv_cb: Mutex::new(None),
            icmpv6_cb: Mutex::new(None),
            up_cb: Mutex::new(None),
            down_cb: Mutex::new(None),
            privdata: Mutex::new(None),
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }
}

fn bind_socket(bind_addr: SocketAddrV4, client: bool) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(TeredoError::SocketCreate)?;
    socket.set_reuse_address(true).map_err(TeredoError::SocketCreate)?;
    socket.set_cloexec(true).map_err(TeredoError::SocketCreate)?;
    socket.set_multicast_ttl_v4(1).map_err(TeredoError::SocketCreate)?;

    socket.bind(&bind_addr.into()).map_err(TeredoError::BindFailed)?;
    let std_socket: UdpSocket = socket.into();

    if client {
        std_socket
            .set_read_timeout(Some(Duration::from_secs(1)))
            .map_err(TeredoError::BindFailed)?;
    }

    Ok(std_socket)
}
