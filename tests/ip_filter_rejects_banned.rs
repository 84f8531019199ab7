use std::time::Duration;

use clap::Parser;
use porthole::{ApplicationConfig, entrypoint};
use russh::{
    Channel,
    client::{Msg, Session},
};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

/// Connections from banned addresses are dropped before any SSH handshake.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn ip_filter_rejects_banned() {
    // 1. Initialize Porthole with the loopback address banned
    let key_file = std::env::temp_dir().join("porthole-test-18322/ssh");
    let config = ApplicationConfig::parse_from([
        "porthole",
        "--ssh-address=127.0.0.1:18322",
        "--private-key-file",
        key_file.to_str().unwrap(),
        "--banned-ips=127.0.0.1",
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    // The raw TCP connection is still accepted by the kernel before the
    // filter drops it, so waiting on connect success is enough.
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:18322").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for Porthole to start.")
    };

    // 2. The SSH handshake must never complete
    let ssh_client = SshClient;
    let result = timeout(
        Duration::from_secs(5),
        russh::client::connect(Default::default(), "127.0.0.1:18322", ssh_client),
    )
    .await
    .expect("Timeout waiting for the connection to be dropped");
    assert!(
        result.is_err(),
        "banned address should never get an SSH handshake"
    );
}

struct SshClient;

impl russh::client::Handler for SshClient {
    type Error = color_eyre::eyre::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}
