use std::{net::SocketAddr, sync::Arc};

use tracing::info;

use crate::{
    ListenerEntry, PortholeServer, connection::SshConnection, droppable_handle::DroppableHandle,
    error::ServerError, ssh::SshTunnelHandler, tcp_alias::TcpAlias,
};

// Shared-registry footprint of one registered forwarding.
#[derive(Clone)]
pub(crate) enum ForwardingKind {
    // Routable HTTP(S) tunnel endpoint.
    Http { host: String },
    // Bound public TCP listener proxying onto the tunnel.
    Tcp {
        alias: TcpAlias,
        bound_address: SocketAddr,
        // Aborts the listener's accept loop once the last reference drops.
        _listener: Arc<DroppableHandle<()>>,
    },
}

#[derive(Clone)]
pub(crate) struct ForwardingEntry {
    pub(crate) kind: ForwardingKind,
}

// Registration of remote forwardings requested over SSH.
pub(crate) struct Forwarder;

impl Forwarder {
    // Handle a tcpip-forward request: register a routable HTTP endpoint for
    // ports 80/443, or bind a public TCP listener for any other port. `port`
    // is updated with the assigned port so the protocol reply carries it.
    pub(crate) async fn remote_forwarding(
        server: &Arc<PortholeServer>,
        connection: &Arc<SshConnection>,
        handle: russh::server::Handle,
        address: &str,
        port: &mut u32,
    ) -> color_eyre::Result<bool> {
        let key = TcpAlias(address.into(), *port as u16);
        if connection.forwardings.contains(&key) {
            return Err(ServerError::ForwardingAlreadyBound(key).into());
        }
        let handler = Arc::new(SshTunnelHandler::new(
            handle,
            connection.sender.clone(),
            connection.peer,
            address.into(),
            *port,
        ));
        match *port {
            80 | 443 => {
                let host = address.to_ascii_lowercase();
                if !server
                    .http_tunnels
                    .try_insert(host.clone(), Arc::clone(&handler))
                {
                    return Err(ServerError::HostAlreadyBound(host).into());
                }
                info!(peer = %connection.peer, %host, "Serving HTTP tunnel.");
                let _ = connection.sender.send(
                    &format!(
                        "Serving HTTP on http://{host}:{} and https://{host}:{}",
                        server.http_port, server.https_port
                    ),
                    true,
                );
                connection.forwardings.insert(
                    key,
                    ForwardingEntry {
                        kind: ForwardingKind::Http { host },
                    },
                );
            }
            _ => {
                let (bound_address, listener_task) = server
                    .tcp_handler
                    .create_port_listener(*port as u16, Arc::clone(&handler))
                    .await?;
                *port = bound_address.port().into();
                let alias = TcpAlias(address.into(), bound_address.port());
                if !server
                    .tcp_aliases
                    .try_insert(alias.clone(), Arc::clone(&handler))
                {
                    return Err(ServerError::AliasAlreadyBound(alias).into());
                }
                server.listeners.insert(
                    bound_address,
                    Arc::new(ListenerEntry {
                        owner: Some(connection.peer),
                    }),
                );
                info!(peer = %connection.peer, %bound_address, "Serving TCP forwarding.");
                let _ = connection.sender.send(
                    &format!("Forwarding TCP connections from {bound_address}"),
                    true,
                );
                // Key by the assigned port, which is what a later
                // cancel-tcpip-forward will reference.
                connection.forwardings.insert(
                    alias.clone(),
                    ForwardingEntry {
                        kind: ForwardingKind::Tcp {
                            alias,
                            bound_address,
                            _listener: Arc::new(listener_task),
                        },
                    },
                );
            }
        }
        Ok(true)
    }

    // Handle a cancel-tcpip-forward request for a forwarding this connection
    // registered earlier.
    pub(crate) fn cancel_remote_forwarding(
        server: &PortholeServer,
        connection: &SshConnection,
        address: &str,
        port: u16,
    ) -> bool {
        let key = TcpAlias(address.into(), port);
        match connection.forwardings.remove(&key) {
            Some(entry) => {
                Forwarder::unregister(server, &entry);
                info!(peer = %connection.peer, %key, "Canceled forwarding.");
                true
            }
            None => false,
        }
    }

    // Remove a forwarding's entries from the shared registries. Dropping the
    // entry afterwards also aborts the TCP listener task, if any.
    pub(crate) fn unregister(server: &PortholeServer, entry: &ForwardingEntry) {
        match &entry.kind {
            ForwardingKind::Http { host } => {
                server.http_tunnels.remove(host);
            }
            ForwardingKind::Tcp {
                alias,
                bound_address,
                ..
            } => {
                server.tcp_aliases.remove(alias);
                server.listeners.remove(bound_address);
            }
        }
    }
}
