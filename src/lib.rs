use std::{net::SocketAddr, sync::Arc, time::Duration};

use crate::{
    connection::SshConnection, console::WebConsole, ip::IpFilter, registry::Registry,
    ssh::SshTunnelHandler, tcp::TcpHandler, tcp_alias::TcpAlias,
};

mod config;
mod connection;
mod console;
mod diagnostics;
mod droppable_handle;
mod entrypoint;
mod error;
mod forwarding;
mod ip;
mod registry;
mod ssh;
mod tcp;
mod tcp_alias;

pub use crate::{config::ApplicationConfig, entrypoint::entrypoint};

// An open network listener tracked in the shared registry, keyed by its
// bound address.
pub(crate) struct ListenerEntry {
    // Peer address of the SSH connection owning this listener; the SSH
    // service socket itself has no owner.
    pub(crate) owner: Option<SocketAddr>,
}

// Shared state for the whole server, mutated and iterated concurrently by the
// accept loop, per-connection watchers, diagnostics, and the HTTP front-end.
pub(crate) struct PortholeServer {
    // Live SSH connections, keyed by remote address.
    pub(crate) connections: Registry<SocketAddr, Arc<SshConnection>>,
    // All open listeners, keyed by bound address.
    pub(crate) listeners: Registry<SocketAddr, Arc<ListenerEntry>>,
    // Routable HTTP tunnel endpoints, keyed by host.
    pub(crate) http_tunnels: Registry<String, Arc<SshTunnelHandler>>,
    // TCP alias endpoints, keyed by requested address and assigned port.
    pub(crate) tcp_aliases: Registry<TcpAlias, Arc<SshTunnelHandler>>,
    // Web console metadata.
    pub(crate) console: WebConsole,
    // Service that identifies whether to allow or block a given IP address.
    pub(crate) ip_filter: Arc<IpFilter>,
    // Service creating public sockets for TCP forwardings.
    pub(crate) tcp_handler: TcpHandler,
    pub(crate) http_port: u16,
    pub(crate) https_port: u16,
    pub(crate) cleanup_unbound: bool,
    pub(crate) ping_client: bool,
    pub(crate) ping_interval: Duration,
    pub(crate) idle_timeout: Duration,
}
