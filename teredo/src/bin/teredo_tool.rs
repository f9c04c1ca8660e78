//! Thin demonstration binary exercising the `teredo` tunnel engine end to
//! end: binds a socket, runs either a relay or a client, and prints
//! whatever IPv6 payloads make it up through the receive callback as hex.
//!
//! This is not the daemon the original ships (`src/main.c`'s argument
//! parsing, PID file, privilege drop, syslog setup): those remain the
//! out-of-scope collaborators the engine spec calls out. It only drives
//! the public tunnel API end to end, the way a thin CLI wraps a library
//! crate elsewhere in this corpus.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use structopt::StructOpt;
use tracing::info;

use teredo::tunnel::{Tunnel, TunnelBuilder};

#[derive(Debug, StructOpt)]
#[structopt(name = "teredo-tool", about = "Runs a Teredo relay or client and prints received IPv6 payloads.")]
struct Opt {
    /// Local IPv4 address to bind the UDP socket to.
    #[structopt(long, default_value = "0.0.0.0")]
    bind_addr: Ipv4Addr,

    /// Local UDP port to bind to (3544 is the well-known Teredo port).
    #[structopt(long, default_value = "3544")]
    bind_port: u16,

    /// Run as a qualifying client instead of a relay.
    #[structopt(long)]
    client: bool,

    /// Primary Teredo server IPv4 address (required with --client).
    #[structopt(long)]
    server: Option<Ipv4Addr>,

    /// Secondary Teredo server IPv4 address, used during qualification.
    #[structopt(long)]
    secondary_server: Option<Ipv4Addr>,

    /// Assume we sit behind a cone NAT (relay: enables the cone fast-trust
    /// path; client: sent as the cone bit during qualification).
    #[structopt(long)]
    cone: bool,

    /// Enable same-LAN peer discovery (client only).
    #[structopt(long)]
    local_discovery: bool,
}

fn main() -> teredo::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opt = Opt::from_args();

    let mut builder = TunnelBuilder::new(SocketAddrV4::new(opt.bind_addr, opt.bind_port)).cone(opt.cone);
    builder = if opt.client {
        let server = opt.server.expect("--client requires --server");
        builder
            .client(server, opt.secondary_server)
            .local_discovery(opt.local_discovery)
    } else {
        builder.relay()
    };

    let tunnel = Arc::new(builder.build()?);

    tunnel.set_recv_callback(|ip6: &[u8]| {
        info!(bytes = %hex::encode(ip6), len = ip6.len(), "received ipv6 payload");
    })?;
    tunnel.set_icmpv6_callback(|icmp: &[u8], target| {
        info!(%target, bytes = %hex::encode(icmp), "would emit icmpv6 unreachable");
    })?;
    tunnel.set_state_callbacks(
        |addr, mtu| info!(%addr, mtu, "qualified: tunnel is up"),
        || info!("tunnel is down"),
    )?;

    info!(bind = %SocketAddrV4::new(opt.bind_addr, opt.bind_port), client = opt.client, "starting teredo-tool");
    run(tunnel)
}

fn run(tunnel: Arc<Tunnel>) -> teredo::Result<()> {
    tunnel.run_async()
}
