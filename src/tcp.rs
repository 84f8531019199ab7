use std::{net::SocketAddr, sync::Arc};

use bon::Builder;
use color_eyre::eyre::Context;
use tokio::{io::copy_bidirectional, net::TcpListener};
use tracing::{error, info, warn};

use crate::{droppable_handle::DroppableHandle, ip::IpFilter, ssh::SshTunnelHandler};

// Service that creates TCP sockets for reverse forwarding connections.
#[derive(Builder)]
pub(crate) struct TcpHandler {
    // Address to listen to when creating sockets.
    listen_address: String,
    // Service that identifies whether to allow or block a given IP address.
    ip_filter: Arc<IpFilter>,
}

impl TcpHandler {
    // Bind the public socket for a TCP forwarding (an OS-assigned port when
    // zero is requested) and start its accept loop. The loop is aborted by
    // dropping the returned handle.
    pub(crate) async fn create_port_listener(
        &self,
        port: u16,
        handler: Arc<SshTunnelHandler>,
    ) -> color_eyre::Result<(SocketAddr, DroppableHandle<()>)> {
        let listener = TcpListener::bind((self.listen_address.clone(), port)).await?;
        let bound_address = listener
            .local_addr()
            .with_context(|| "Missing local address when binding port")?;
        let ip_filter = Arc::clone(&self.ip_filter);
        let join_handle = DroppableHandle(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, address)) => {
                        let ip = address.ip().to_canonical();
                        if !ip_filter.is_allowed(ip) {
                            info!(%address, "Rejecting TCP connection: IP not allowed.");
                            continue;
                        }
                        if let Err(error) = stream.set_nodelay(true) {
                            warn!(%address, %error, "Error setting nodelay.");
                        }
                        match handler.tunneling_channel(ip, address.port()).await {
                            Ok(mut channel) => {
                                let _ = handler.log_channel().send(
                                    &format!(
                                        "New connection from {}:{} to TCP port {}",
                                        ip,
                                        address.port(),
                                        bound_address.port()
                                    ),
                                    false,
                                );
                                // Copy data between the TCP stream and the
                                // reverse forwarding channel.
                                tokio::spawn(async move {
                                    let _ = copy_bidirectional(&mut stream, &mut channel).await;
                                });
                            }
                            Err(error) => {
                                warn!(%address, %error, "Error opening forwarding channel.");
                            }
                        }
                    }
                    Err(error) => {
                        error!(port = %bound_address.port(), %error, "Error listening on TCP port.");
                    }
                }
            }
        }));
        Ok((bound_address, join_handle))
    }
}
