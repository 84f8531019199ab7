use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use color_eyre::eyre::Context;
use ipnet::IpNet;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::{
    keys::{
        decode_secret_key,
        ssh_key::{LineEnding, private::Ed25519Keypair},
    },
    server::Config,
};
use tokio::{
    fs,
    net::{TcpListener, TcpStream},
    pin,
    sync::watch,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    ListenerEntry, PortholeServer,
    config::ApplicationConfig,
    connection::{LOGIN_GRACE_PERIOD, deadline_expired},
    console::WebConsole,
    diagnostics,
    error::ServerError,
    ip::{CountryResolver, GeoDatabase, IpFilter, IpFilterConfig},
    registry::Registry,
    ssh::Server,
    tcp::TcpHandler,
};

// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    info!("Starting Porthole...");
    // The HTTP/HTTPS addresses only contribute default port numbers for the
    // endpoints communicated to clients.
    let http_port = match config.http_port_override {
        Some(port) => port,
        None => port_from_address(&config.http_address)
            .with_context(|| "Error parsing HTTP address")?,
    };
    let https_port = match config.https_port_override {
        Some(port) => port,
        None => port_from_address(&config.https_address)
            .with_context(|| "Error parsing HTTPS address")?,
    };
    let (listen_host, _) = config
        .ssh_address
        .rsplit_once(':')
        .ok_or_else(|| ServerError::InvalidAddress(config.ssh_address.clone()))
        .with_context(|| "Error parsing SSH address")?;

    // Find the private SSH key for Porthole or create a new one.
    let key = match fs::read_to_string(config.private_key_file.as_path()).await {
        Ok(key) => decode_secret_key(&key, None).with_context(|| "Error decoding secret key")?,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            info!("Key file not found. Creating...");
            let key = russh::keys::PrivateKey::from(Ed25519Keypair::from_seed(
                &ChaCha20Rng::from_os_rng().random(),
            ));
            fs::create_dir_all(
                config
                    .private_key_file
                    .as_path()
                    .parent()
                    .ok_or(ServerError::InvalidFilePath)
                    .with_context(|| "Error parsing secret key path")?,
            )
            .await
            .with_context(|| "Error creating secret key directory")?;
            let key_string = key.to_openssh(LineEnding::LF)?;
            let key =
                decode_secret_key(&key_string, None).with_context(|| "Error decoding secret key")?;
            fs::write(config.private_key_file.as_path(), key_string)
                .await
                .with_context(|| "Error saving secret key to filesystem")?;
            key
        }
        Err(error) => return Err(error).with_context(|| "Error reading secret key"),
    };

    // Initialize the IP address and country filtering service.
    let resolver: Option<Box<dyn CountryResolver>> = if config.enable_geodb {
        match GeoDatabase::open(config.geodb_file.as_path()) {
            Ok(database) => Some(Box::new(database)),
            Err(error) => {
                warn!(%error, "Unable to open geo database. Falling back to IP-only filtering.");
                None
            }
        }
    } else {
        None
    };
    let ip_filter = Arc::new(
        IpFilter::new(
            IpFilterConfig {
                allowlist: parse_network_list(config.whitelisted_ips.as_deref())?,
                blocklist: parse_network_list(config.banned_ips.as_deref())?,
                allowed_countries: parse_country_list(config.whitelisted_countries.as_deref()),
                blocked_countries: parse_country_list(config.banned_countries.as_deref()),
            },
            resolver,
        )
        .with_context(|| "Error initializing IP filter")?,
    );

    let mut server = Arc::new(PortholeServer {
        connections: Registry::new(),
        listeners: Registry::new(),
        http_tunnels: Registry::new(),
        tcp_aliases: Registry::new(),
        console: WebConsole::new(),
        tcp_handler: TcpHandler::builder()
            .listen_address(listen_host.into())
            .ip_filter(Arc::clone(&ip_filter))
            .build(),
        ip_filter,
        http_port,
        https_port,
        cleanup_unbound: config.cleanup_unbound,
        ping_client: config.ping_client,
        ping_interval: config.ping_client_interval.into(),
        idle_timeout: config.connection_idle_timeout.into(),
    });

    let _snapshot_reporter = config
        .debug
        .then(|| diagnostics::spawn_snapshot_reporter(Arc::clone(&server)));

    let ssh_config = Arc::new(Config {
        auth_rejection_time: Duration::from_secs(2),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        inactivity_timeout: Some(Duration::from_secs(3_600)),
        keepalive_interval: config.ping_client.then_some(server.ping_interval),
        keepalive_max: 3,
        keys: vec![key],
        ..Default::default()
    });

    let ssh_listener = TcpListener::bind(&config.ssh_address)
        .await
        .with_context(|| "Error listening to SSH address")?;
    let ssh_listener_address = ssh_listener
        .local_addr()
        .with_context(|| "Missing local address for SSH listener")?;
    server
        .listeners
        .insert(ssh_listener_address, Arc::new(ListenerEntry { owner: None }));
    info!(address = %config.ssh_address, "Starting SSH service.");

    // Add OS signal handlers for termination.
    let signal_handler = wait_for_signal();
    pin!(signal_handler);
    loop {
        tokio::select! {
            conn = ssh_listener.accept() => {
                let (stream, address) = match conn {
                    Ok((stream, address)) => (stream, address),
                    Err(error) => {
                        error!(%error, "Unable to accept SSH connection.");
                        continue;
                    },
                };
                if !server.ip_filter.is_allowed(address.ip().to_canonical()) {
                    debug!(%address, "Rejecting SSH connection: IP not allowed.");
                    continue;
                }
                if let Err(error) = stream.set_nodelay(true) {
                    warn!(%error, %address, "Error setting nodelay.");
                }
                info!(%address, "Accepted SSH connection.");
                handle_ssh_connection(stream, address, Arc::clone(&ssh_config), &mut server);
            }
            _ = &mut signal_handler => break,
        }
    }
    server.listeners.remove(&ssh_listener_address);
    info!("Porthole is shutting down.");
    Ok(())
}

// Perform the SSH handshake in its own task and supervise the resulting
// session until one of the teardown paths fires.
fn handle_ssh_connection(
    stream: TcpStream,
    address: SocketAddr,
    config: Arc<Config>,
    server: &mut Arc<PortholeServer>,
) {
    let cancellation_token = CancellationToken::new();
    let (deadline_tx, deadline_rx) = if server.ping_client {
        let (tx, rx) = watch::channel(Instant::now() + server.ping_interval + server.idle_timeout);
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };
    let handler = server.new_client(address, cancellation_token.clone(), deadline_tx);
    let logged_in = handler.login_flag();
    let server = Arc::clone(server);
    tokio::spawn(async move {
        // Bound resource usage from clients that stall before completing
        // authentication.
        if server.cleanup_unbound {
            let token = cancellation_token.clone();
            tokio::spawn(async move {
                sleep(LOGIN_GRACE_PERIOD).await;
                if !logged_in.load(Ordering::Acquire) {
                    info!(%address, "Login grace period expired. Closing connection.");
                    token.cancel();
                }
            });
        }
        // Dropping the handshake future also drops the raw connection.
        let mut session = tokio::select! {
            result = russh::server::run_stream(config, stream, handler) => match result {
                Ok(session) => session,
                Err(error) => {
                    warn!(%error, %address, "SSH handshake failed.");
                    return;
                }
            },
            _ = cancellation_token.cancelled() => {
                info!(%address, "Connection canceled before handshake completion.");
                return;
            }
        };
        tokio::select! {
            result = &mut session => {
                if let Err(error) = result {
                    debug!(%error, %address, "Connection closed.");
                }
            }
            _ = cancellation_token.cancelled() => {
                info!(%address, "Disconnecting client...");
                let _ = session
                    .handle()
                    .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
                    .await;
            }
            _ = deadline_expired(deadline_rx) => {
                info!(%address, "Connection deadline expired.");
            }
        }
        // Whichever way the transport ended, make sure this connection's
        // registry entries are gone.
        if let Some(connection) = server.connections.get(&address) {
            connection.cleanup(&server).await;
        }
    });
}

fn port_from_address(address: &str) -> color_eyre::Result<u16> {
    let (_, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ServerError::InvalidAddress(address.into()))?;
    Ok(port
        .parse::<u16>()
        .map_err(|_| ServerError::InvalidAddress(address.into()))?)
}

fn parse_network_list(value: Option<&str>) -> color_eyre::Result<Option<Vec<IpNet>>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let mut networks = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let network = entry
            .parse::<IpNet>()
            .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
            .map_err(|_| ServerError::InvalidAddress(entry.into()))?;
        networks.push(network);
    }
    Ok(Some(networks))
}

fn parse_country_list(value: Option<&str>) -> Option<Vec<String>> {
    value.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_uppercase)
            .collect()
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signal_terminate = signal(SignalKind::terminate()).unwrap();
    let mut signal_interrupt = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c().unwrap();
    let mut signal_break = windows::ctrl_break().unwrap();
    let mut signal_close = windows::ctrl_close().unwrap();
    let mut signal_shutdown = windows::ctrl_shutdown().unwrap();

    tokio::select! {
        _ = signal_c.recv() => debug!("Received CTRL_C."),
        _ = signal_break.recv() => debug!("Received CTRL_BREAK."),
        _ = signal_close.recv() => debug!("Received CTRL_CLOSE."),
        _ = signal_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
    };
}
