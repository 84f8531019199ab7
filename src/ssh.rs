use std::{
    fmt::Display,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use russh::{
    Channel, ChannelId, ChannelStream, MethodKind, MethodSet,
    keys::{HashAlg, PublicKey},
    server::{Auth, Handler, Msg, Session},
};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot, watch,
    },
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    PortholeServer, connection::SshConnection, droppable_handle::DroppableHandle,
    forwarding::Forwarder,
};

// A message queued for delivery to the remote client over its session channel.
pub(crate) struct ClientMessage {
    pub(crate) data: Vec<u8>,
    // Resolved once the message has been handed to the session channel.
    pub(crate) delivered: Option<oneshot::Sender<()>>,
}

// Best-effort delivery of informational text to the remote client.
#[derive(Clone)]
pub(crate) struct MessageSender {
    tx: UnboundedSender<ClientMessage>,
    session_open: Arc<AtomicBool>,
}

impl MessageSender {
    pub(crate) fn new() -> (Self, UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MessageSender {
                tx,
                session_open: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub(crate) fn mark_session_open(&self) {
        self.session_open.store(true, Ordering::Release);
    }

    // Queue a message for the client. Non-urgent messages are dropped until
    // the client opens a session channel; urgent ones are queued regardless
    // and flushed once it does. Returns a receiver resolved upon delivery.
    pub(crate) fn send(&self, text: &str, urgent: bool) -> Option<oneshot::Receiver<()>> {
        if !urgent && !self.session_open.load(Ordering::Acquire) {
            return None;
        }
        let (delivered_tx, delivered_rx) = oneshot::channel();
        let message = ClientMessage {
            data: format!("{text}\r\n").into_bytes(),
            delivered: Some(delivered_tx),
        };
        self.tx.send(message).ok()?;
        Some(delivered_rx)
    }

    // Keepalive probe through the delivery path. Fails once the session
    // writer task is gone, i.e. the client can no longer receive data.
    pub(crate) fn probe(&self) -> bool {
        self.tx
            .send(ClientMessage {
                data: Vec::new(),
                delivered: None,
            })
            .is_ok()
    }
}

// Handler for routing traffic from a public endpoint onto the reverse
// forwarding channel of the SSH connection that requested it.
pub(crate) struct SshTunnelHandler {
    handle: russh::server::Handle,
    sender: MessageSender,
    pub(crate) peer: SocketAddr,
    address: String,
    port: u32,
}

impl SshTunnelHandler {
    pub(crate) fn new(
        handle: russh::server::Handle,
        sender: MessageSender,
        peer: SocketAddr,
        address: String,
        port: u32,
    ) -> Self {
        SshTunnelHandler {
            handle,
            sender,
            peer,
            address,
            port,
        }
    }

    pub(crate) fn log_channel(&self) -> MessageSender {
        self.sender.clone()
    }

    // Open a forwarded-tcpip channel back to the client for an incoming
    // connection from the given originator.
    pub(crate) async fn tunneling_channel(
        &self,
        ip: IpAddr,
        port: u16,
    ) -> color_eyre::Result<ChannelStream<Msg>> {
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(self.address.clone(), self.port, ip.to_string(), port.into())
            .await?
            .into_stream();
        Ok(channel)
    }
}

impl Display for SshTunnelHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} via {}", self.address, self.port, self.peer)
    }
}

// Per-connection SSH protocol handler.
pub(crate) struct ServerHandler {
    // The IP and port of this connection.
    peer: SocketAddr,
    // The username from this connection's authentication.
    user: Option<String>,
    // Signal that this connection must be closed.
    cancellation_token: CancellationToken,
    // Flag observed by the login-grace watchdog in the accept loop.
    logged_in: Arc<AtomicBool>,
    // Deadline extended by the liveness pinger, if pinging is enabled.
    deadline: Option<watch::Sender<Instant>>,
    // Supervisor for this connection. Set once authentication succeeds.
    connection: Option<Arc<SshConnection>>,
    sender: MessageSender,
    rx: Option<UnboundedReceiver<ClientMessage>>,
    // ID for the open session channel.
    channel_id: Option<ChannelId>,
    // Handle for the session channel writer task.
    open_session_join_handle: Option<DroppableHandle<()>>,
    // Reference to the shared server state.
    server: Arc<PortholeServer>,
}

impl ServerHandler {
    pub(crate) fn login_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.logged_in)
    }
}

pub(crate) trait Server {
    fn new_client(
        &mut self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
        deadline: Option<watch::Sender<Instant>>,
    ) -> ServerHandler;
}

impl Server for Arc<PortholeServer> {
    // Create a new handler for the SSH connection.
    fn new_client(
        &mut self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
        deadline: Option<watch::Sender<Instant>>,
    ) -> ServerHandler {
        info!(peer = %peer_address, "SSH client connected.");
        let (sender, rx) = MessageSender::new();
        ServerHandler {
            peer: peer_address,
            user: None,
            cancellation_token,
            logged_in: Arc::new(AtomicBool::new(false)),
            deadline,
            connection: None,
            sender,
            rx: Some(rx),
            channel_id: None,
            open_session_join_handle: None,
            server: Arc::clone(self),
        }
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    // Handle creation of the channel for sending messages to the client.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // Only the first session receives data. Others are rejected.
        let Some(mut rx) = self.rx.take() else {
            return Ok(false);
        };
        self.channel_id = Some(channel.id());
        self.sender.mark_session_open();
        let cancellation_token = self.cancellation_token.clone();
        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        // Flush any queued messages before the channel goes away.
                        while let Ok(ClientMessage { data, delivered }) = rx.try_recv() {
                            if !data.is_empty() && channel.data(data.as_ref()).await.is_err() {
                                break;
                            }
                            if let Some(delivered) = delivered {
                                let _ = delivered.send(());
                            }
                        }
                        let _ = channel.eof().await;
                        break;
                    }
                    message = rx.recv() => {
                        let Some(ClientMessage { data, delivered }) = message else { break };
                        if !data.is_empty() && channel.data(data.as_ref()).await.is_err() {
                            break;
                        }
                        if let Some(delivered) = delivered {
                            let _ = delivered.send(());
                        }
                    }
                }
            }
        });
        self.open_session_join_handle = Some(DroppableHandle(join_handle));
        Ok(true)
    }

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
            partial_success: false,
        })
    }

    // Accept any public key, recording the user and fingerprint. Which
    // forwards a user may actually open is a policy for the request handlers.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256);
        self.user = Some(user.into());
        info!(
            peer = %self.peer, %user, %fingerprint, "SSH client authenticated with public key."
        );
        Ok(Auth::Accept)
    }

    // Build the connection supervisor and attach its watchers once
    // authentication completes.
    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        if self.connection.is_some() {
            return Ok(());
        }
        self.logged_in.store(true, Ordering::Release);
        let connection = Arc::new(SshConnection::new(
            self.peer,
            self.user.clone().unwrap_or_else(|| "unknown".into()),
            Some(session.handle()),
            self.sender.clone(),
            self.cancellation_token.clone(),
            self.deadline.take(),
        ));
        self.server
            .connections
            .insert(self.peer, Arc::clone(&connection));
        if self.server.cleanup_unbound {
            connection.spawn_unbound_watchdog(&self.server);
        }
        if self.server.ping_client {
            connection.spawn_pinger(&self.server);
        }
        self.connection = Some(connection);
        Ok(())
    }

    // Handle data received from the client such as key presses.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Ctrl+C ends the session and disconnects the client.
        if self
            .channel_id
            .is_some_and(|channel_id| channel_id == channel)
            && data == b"\x03"
        {
            self.cancellation_token.cancel();
        }
        Ok(())
    }

    // Handle a remote forwarding request for the client.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if *port > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        let Some(connection) = self.connection.as_ref() else {
            return Err(russh::Error::Disconnect);
        };
        let handle = session.handle();
        match Forwarder::remote_forwarding(&self.server, connection, handle, address.trim(), port)
            .await
        {
            Ok(accepted) => Ok(accepted),
            Err(error) => {
                warn!(peer = %self.peer, %address, %port, %error, "Remote forwarding failed.");
                let _ = self
                    .sender
                    .send(&format!("Failed to bind {address}:{port} ({error})"), true);
                Ok(false)
            }
        }
    }

    // Handle cancellation of a remote forwarding request.
    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if port > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        let Some(connection) = self.connection.as_ref() else {
            return Err(russh::Error::Disconnect);
        };
        Ok(Forwarder::cancel_remote_forwarding(
            &self.server,
            connection,
            address.trim(),
            port as u16,
        ))
    }
}

// Trigger cleanup when the protocol handler goes away, covering teardown
// paths that bypass the transport-close watcher.
impl Drop for ServerHandler {
    fn drop(&mut self) {
        let user = self.user.as_deref().unwrap_or("unknown");
        debug!(peer = %self.peer, %user, "SSH client disconnected.");
        if let Some(connection) = self.connection.take() {
            let server = Arc::clone(&self.server);
            tokio::spawn(async move {
                connection.cleanup(&server).await;
            });
        }
    }
}

#[cfg(test)]
mod message_sender_tests {
    use super::MessageSender;

    #[test]
    fn drops_messages_until_session_opens() {
        let (sender, mut rx) = MessageSender::new();
        assert!(sender.send("not urgent", false).is_none());
        assert!(rx.try_recv().is_err());
        let delivered = sender.send("urgent", true);
        assert!(delivered.is_some());
        assert_eq!(rx.try_recv().unwrap().data, b"urgent\r\n".to_vec());
        sender.mark_session_open();
        assert!(sender.send("not urgent", false).is_some());
        assert_eq!(rx.try_recv().unwrap().data, b"not urgent\r\n".to_vec());
    }

    #[test]
    fn probe_fails_once_receiver_is_gone() {
        let (sender, rx) = MessageSender::new();
        assert!(sender.probe());
        drop(rx);
        assert!(!sender.probe());
    }
}
