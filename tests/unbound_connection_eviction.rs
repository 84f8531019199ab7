use std::{sync::Arc, time::Duration};

use clap::Parser;
use porthole::{ApplicationConfig, entrypoint};
use russh::{
    ChannelMsg,
    client::{Msg, Session},
    keys::{
        PrivateKey,
        key::PrivateKeyWithHashAlg,
        ssh_key::private::Ed25519Keypair,
    },
    Channel,
};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

/// A connection that never registers a forwarding must receive exactly one
/// eviction notice and then be disconnected by the unbound watchdog.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn unbound_connection_eviction() {
    // 1. Initialize Porthole
    let key_file = std::env::temp_dir().join("porthole-test-18122/ssh");
    let config = ApplicationConfig::parse_from([
        "porthole",
        "--ssh-address=127.0.0.1:18122",
        "--private-key-file",
        key_file.to_str().unwrap(),
        "--cleanup-unbound",
        "--ping-client=false",
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:18122").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for Porthole to start.")
    };

    // 2. Connect and authenticate, but never request a forwarding
    let key = Arc::new(PrivateKey::from(Ed25519Keypair::from_seed(&rand::random())));
    let ssh_client = SshClient;
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:18122", ssh_client)
        .await
        .expect("Failed to connect to SSH server");
    assert!(
        session
            .authenticate_publickey(
                "user",
                PrivateKeyWithHashAlg::new(
                    key,
                    session.best_supported_rsa_hash().await.unwrap().flatten()
                )
            )
            .await
            .expect("SSH authentication failed")
            .success(),
        "authentication didn't succeed"
    );
    let mut channel = session
        .channel_open_session()
        .await
        .expect("Failed to open session channel");

    // 3. Expect the eviction notice, then the disconnection
    let mut buf = Vec::new();
    let received_notice = timeout(Duration::from_secs(5), async {
        while let Some(message) = channel.wait().await {
            if let ChannelMsg::Data { data } = message {
                buf.extend_from_slice(&data);
                if String::from_utf8_lossy(&buf).contains("No forwarding requests sent") {
                    return true;
                }
            }
        }
        false
    })
    .await
    .expect("Timeout waiting for the eviction notice");
    assert!(received_notice, "missing eviction notice");
    assert!(
        timeout(Duration::from_secs(10), &mut session).await.is_ok(),
        "Timeout waiting for client disconnection."
    );
    sleep(Duration::from_millis(500)).await;
    assert!(session.is_closed(), "session should've been closed");
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
