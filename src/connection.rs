use std::{
    future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use russh::Disconnect;
use tokio::{
    sync::watch,
    time::{Instant, sleep, sleep_until, timeout},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::{
    PortholeServer,
    forwarding::{Forwarder, ForwardingEntry},
    registry::Registry,
    ssh::MessageSender,
    tcp_alias::TcpAlias,
};

// Grace period for clients to complete authentication before the accept
// loop's watchdog closes the raw connection.
pub(crate) const LOGIN_GRACE_PERIOD: Duration = Duration::from_secs(5);
// How long an authenticated connection may stay without any forwarding
// before it is evicted.
const UNBOUND_TIMEOUT: Duration = Duration::from_secs(1);
// Bound on waiting for the eviction notice to reach the session channel.
const EVICTION_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

// Supervisor for one authenticated SSH connection.
//
// Shared between the protocol handler, the watcher tasks attached to the
// connection, and the server-wide connections registry. All teardown paths
// funnel into `cleanup`, which runs its side effects at most once.
pub(crate) struct SshConnection {
    pub(crate) peer: SocketAddr,
    pub(crate) user: String,
    // Handle to the underlying SSH transport. Missing only in tests.
    handle: Option<russh::server::Handle>,
    pub(crate) sender: MessageSender,
    // Forwardings owned by this connection, keyed by the requested
    // address and port.
    pub(crate) forwardings: Registry<TcpAlias, ForwardingEntry>,
    // One-shot close signal observed by every watcher.
    close: CancellationToken,
    // Deadline extended by the liveness pinger and enforced by the
    // transport-close watcher.
    deadline: Option<watch::Sender<Instant>>,
    cleaned_up: AtomicBool,
}

impl SshConnection {
    pub(crate) fn new(
        peer: SocketAddr,
        user: String,
        handle: Option<russh::server::Handle>,
        sender: MessageSender,
        close: CancellationToken,
        deadline: Option<watch::Sender<Instant>>,
    ) -> Self {
        SshConnection {
            peer,
            user,
            handle,
            sender,
            forwardings: Registry::new(),
            close,
            deadline,
            cleaned_up: AtomicBool::new(false),
        }
    }

    // Resolves once the close signal has fired.
    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close.cancelled()
    }

    fn extend_deadline(&self, duration: Duration) {
        if let Some(deadline) = self.deadline.as_ref() {
            let _ = deadline.send(Instant::now() + duration);
        }
    }

    // Tear the connection down: fire the close signal, release every registry
    // entry owned by this connection, and disconnect the transport.
    //
    // Any number of watchers may race to call this; only the first invocation
    // performs the side effects. Returns whether this call did the work.
    pub(crate) async fn cleanup(&self, server: &PortholeServer) -> bool {
        if self
            .cleaned_up
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.close.cancel();
        for (alias, entry) in self.forwardings.drain() {
            debug!(peer = %self.peer, %alias, "Removing forwarding.");
            Forwarder::unregister(server, &entry);
        }
        server.connections.remove(&self.peer);
        if let Some(handle) = self.handle.clone() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "".into(), "English".into())
                .await;
        }
        info!(peer = %self.peer, user = %self.user, "SSH connection closed.");
        true
    }

    // Watchdog that evicts connections which never register a forwarding.
    pub(crate) fn spawn_unbound_watchdog(self: &Arc<Self>, server: &Arc<PortholeServer>) {
        let connection = Arc::clone(self);
        let server = Arc::clone(server);
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(UNBOUND_TIMEOUT) => {}
                _ = connection.closed() => return,
            }
            if !connection.forwardings.is_empty() {
                return;
            }
            info!(peer = %connection.peer, "No forwarding requests received. Closing connection.");
            // Give the eviction notice a chance to reach the client, bounded
            // by the flush timeout.
            if let Some(delivered) = connection
                .sender
                .send("No forwarding requests sent. Closing connection.", true)
            {
                let _ = timeout(EVICTION_FLUSH_TIMEOUT, delivered).await;
            }
            connection.cleanup(&server).await;
        });
    }

    // Keepalive pinger. Extends the connection deadline ahead of each probe;
    // a failed probe only ends the pinger, leaving teardown to the
    // transport-close watcher or to deadline expiry.
    pub(crate) fn spawn_pinger(self: &Arc<Self>, server: &Arc<PortholeServer>) {
        let connection = Arc::clone(self);
        let interval = server.ping_interval;
        let idle_timeout = server.idle_timeout;
        tokio::spawn(async move {
            loop {
                connection.extend_deadline(interval + idle_timeout);
                tokio::select! {
                    _ = sleep(interval) => {
                        if !connection.sender.probe() {
                            warn!(peer = %connection.peer, "Error sending keepalive probe.");
                            return;
                        }
                    }
                    _ = connection.closed() => return,
                }
            }
        });
    }
}

// Resolves once the connection deadline has passed. Pends forever when
// pinging is disabled (no deadline is maintained).
pub(crate) async fn deadline_expired(deadline: Option<watch::Receiver<Instant>>) {
    let Some(mut deadline) = deadline else {
        return future::pending().await;
    };
    loop {
        let current = *deadline.borrow_and_update();
        tokio::select! {
            _ = sleep_until(current) => {
                // Re-check in case the pinger extended the deadline while we
                // were waiting on the stale one.
                if *deadline.borrow() <= Instant::now() {
                    return;
                }
            }
            changed = deadline.changed() => {
                if changed.is_err() {
                    return future::pending().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod connection_tests {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use tokio::{
        sync::watch,
        time::{Instant, sleep, timeout},
    };
    use tokio_util::sync::CancellationToken;

    use crate::{
        PortholeServer,
        console::WebConsole,
        forwarding::{ForwardingEntry, ForwardingKind},
        ip::{IpFilter, IpFilterConfig},
        registry::Registry,
        ssh::MessageSender,
        tcp::TcpHandler,
        tcp_alias::TcpAlias,
    };

    use super::{SshConnection, deadline_expired};

    fn test_server() -> Arc<PortholeServer> {
        let ip_filter = Arc::new(
            IpFilter::new(
                IpFilterConfig {
                    allowlist: None,
                    blocklist: None,
                    allowed_countries: None,
                    blocked_countries: None,
                },
                None,
            )
            .unwrap(),
        );
        Arc::new(PortholeServer {
            connections: Registry::new(),
            listeners: Registry::new(),
            http_tunnels: Registry::new(),
            tcp_aliases: Registry::new(),
            console: WebConsole::new(),
            tcp_handler: TcpHandler::builder()
                .listen_address("127.0.0.1".into())
                .ip_filter(Arc::clone(&ip_filter))
                .build(),
            ip_filter,
            http_port: 80,
            https_port: 443,
            cleanup_unbound: true,
            ping_client: true,
            ping_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(5),
        })
    }

    fn test_connection(
        peer: SocketAddr,
        sender: MessageSender,
        deadline: Option<watch::Sender<Instant>>,
    ) -> Arc<SshConnection> {
        Arc::new(SshConnection::new(
            peer,
            "test-user".into(),
            None,
            sender,
            CancellationToken::new(),
            deadline,
        ))
    }

    #[tokio::test]
    async fn cleanup_runs_exactly_once() {
        let server = test_server();
        let peer: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        let (sender, _rx) = MessageSender::new();
        let connection = test_connection(peer, sender, None);
        server.connections.insert(peer, Arc::clone(&connection));
        connection.forwardings.insert(
            TcpAlias("localhost".into(), 80),
            ForwardingEntry {
                kind: ForwardingKind::Http {
                    host: "localhost".into(),
                },
            },
        );
        let (first, second) = tokio::join!(connection.cleanup(&server), connection.cleanup(&server));
        assert!(
            first ^ second,
            "exactly one invocation should perform cleanup"
        );
        assert!(server.connections.is_empty());
        assert!(connection.forwardings.is_empty());
        assert!(
            !connection.cleanup(&server).await,
            "cleanup must stay a no-op afterwards"
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unbound_watchdog_evicts_connection_without_forwardings() {
        let server = test_server();
        let peer: SocketAddr = "127.0.0.1:12346".parse().unwrap();
        let (sender, mut rx) = MessageSender::new();
        let connection = test_connection(peer, sender, None);
        server.connections.insert(peer, Arc::clone(&connection));
        connection.spawn_unbound_watchdog(&server);
        let message = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watchdog should send the eviction notice")
            .unwrap();
        assert!(
            String::from_utf8_lossy(&message.data).contains("No forwarding requests sent"),
            "unexpected eviction notice"
        );
        message.delivered.unwrap().send(()).unwrap();
        timeout(Duration::from_secs(5), connection.closed())
            .await
            .expect("close signal should fire");
        assert!(server.connections.is_empty());
        assert!(
            timeout(Duration::from_secs(5), rx.recv()).await.is_err(),
            "only one eviction notice should ever be sent"
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unbound_watchdog_spares_bound_connections() {
        let server = test_server();
        let peer: SocketAddr = "127.0.0.1:12347".parse().unwrap();
        let (sender, mut rx) = MessageSender::new();
        let connection = test_connection(peer, sender, None);
        server.connections.insert(peer, Arc::clone(&connection));
        connection.forwardings.insert(
            TcpAlias("localhost".into(), 8080),
            ForwardingEntry {
                kind: ForwardingKind::Http {
                    host: "localhost".into(),
                },
            },
        );
        connection.spawn_unbound_watchdog(&server);
        assert!(
            timeout(Duration::from_secs(5), rx.recv()).await.is_err(),
            "bound connection shouldn't be notified"
        );
        assert!(server.connections.get(&peer).is_some());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unbound_watchdog_exits_if_already_closed() {
        let server = test_server();
        let peer: SocketAddr = "127.0.0.1:12348".parse().unwrap();
        let (sender, mut rx) = MessageSender::new();
        let connection = test_connection(peer, sender, None);
        server.connections.insert(peer, Arc::clone(&connection));
        connection.cleanup(&server).await;
        connection.spawn_unbound_watchdog(&server);
        assert!(
            timeout(Duration::from_secs(5), rx.recv()).await.is_err(),
            "watchdog should exit without action once the close signal fired"
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn pinger_extends_deadline_and_exits_on_probe_failure() {
        let server = test_server();
        let peer: SocketAddr = "127.0.0.1:12349".parse().unwrap();
        let start = Instant::now();
        let (deadline_tx, deadline_rx) = watch::channel(start);
        let (sender, rx) = MessageSender::new();
        let connection = test_connection(peer, sender, Some(deadline_tx));
        server.connections.insert(peer, Arc::clone(&connection));
        connection.spawn_pinger(&server);
        sleep(Duration::from_millis(1)).await;
        assert!(
            *deadline_rx.borrow() >= start + server.ping_interval + server.idle_timeout,
            "deadline should be extended past interval + idle timeout"
        );
        // Kill the delivery path; the next probe fails and ends the pinger.
        drop(rx);
        sleep(server.ping_interval + Duration::from_secs(1)).await;
        let last_deadline = *deadline_rx.borrow();
        sleep(server.ping_interval * 2).await;
        assert_eq!(
            *deadline_rx.borrow(),
            last_deadline,
            "pinger should stop extending the deadline after a failed probe"
        );
        assert!(
            server.connections.get(&peer).is_some(),
            "pinger must never tear down the connection itself"
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn deadline_expiry_honors_extensions() {
        let (deadline_tx, deadline_rx) = watch::channel(Instant::now() + Duration::from_secs(5));
        let expiry = tokio::spawn(deadline_expired(Some(deadline_rx)));
        sleep(Duration::from_secs(3)).await;
        assert!(!expiry.is_finished());
        deadline_tx
            .send(Instant::now() + Duration::from_secs(5))
            .unwrap();
        sleep(Duration::from_secs(3)).await;
        assert!(!expiry.is_finished(), "extension should delay expiry");
        sleep(Duration::from_secs(3)).await;
        assert!(expiry.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn no_deadline_never_expires() {
        assert!(
            timeout(Duration::from_secs(3600), deadline_expired(None))
                .await
                .is_err()
        );
    }
}
