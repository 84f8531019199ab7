use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::debug;

use crate::{PortholeServer, droppable_handle::DroppableHandle};

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(2);

// Periodic read-only dump of every registry, for debug mode.
//
// Snapshots are taken with `Registry::data` and may be stale by the time they
// are logged; the reporter never mutates the registries nor blocks their
// writers.
pub(crate) fn spawn_snapshot_reporter(server: Arc<PortholeServer>) -> DroppableHandle<()> {
    DroppableHandle(tokio::spawn(async move {
        loop {
            sleep(SNAPSHOT_INTERVAL).await;
            debug!(
                connections = server.connections.len(),
                listeners = server.listeners.len(),
                http_tunnels = server.http_tunnels.len(),
                tcp_aliases = server.tcp_aliases.len(),
                console_clients = server.console.clients.len(),
                "Registry snapshot."
            );
            for (peer, connection) in server.connections.data() {
                debug!(
                    %peer,
                    user = %connection.user,
                    forwardings = connection.forwardings.len(),
                    "Live SSH connection."
                );
            }
            for (address, listener) in server.listeners.data() {
                debug!(%address, owner = ?listener.owner, "Open listener.");
            }
            for (host, handler) in server.http_tunnels.data() {
                debug!(%host, tunnel = %handler, "HTTP tunnel endpoint.");
            }
            for (alias, handler) in server.tcp_aliases.data() {
                debug!(%alias, tunnel = %handler, "TCP alias endpoint.");
            }
            for (client, _) in server.console.clients.data() {
                debug!(%client, "Web console client.");
            }
            for (route, _) in server.console.route_tokens.data() {
                debug!(%route, "Web console route token.");
            }
        }
    }))
}
