use std::path::PathBuf;

use clap::{ArgAction, Parser};
use humantime::Duration;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Address to listen for SSH connections.
    #[arg(long, default_value_t = String::from("localhost:2222"), value_name = "ADDRESS")]
    pub ssh_address: String,

    /// Address of the HTTP front-end, used to derive the default HTTP port
    /// communicated to clients.
    #[arg(long, default_value_t = String::from("localhost:80"), value_name = "ADDRESS")]
    pub http_address: String,

    /// Address of the HTTPS front-end, used to derive the default HTTPS port
    /// communicated to clients.
    #[arg(long, default_value_t = String::from("localhost:443"), value_name = "ADDRESS")]
    pub https_address: String,

    /// Override for the HTTP port communicated to clients.
    #[arg(long, value_name = "PORT")]
    pub http_port_override: Option<u16>,

    /// Override for the HTTPS port communicated to clients.
    #[arg(long, value_name = "PORT")]
    pub https_port_override: Option<u16>,

    /// Comma-separated list of ISO country codes always allowed to connect.
    ///
    /// Setting this makes the filter block any address it cannot match.
    #[arg(long, value_name = "COUNTRIES")]
    pub whitelisted_countries: Option<String>,

    /// Comma-separated list of ISO country codes blocked from connecting.
    #[arg(long, value_name = "COUNTRIES")]
    pub banned_countries: Option<String>,

    /// Comma-separated list of IP addresses or CIDR networks always allowed
    /// to connect.
    ///
    /// Setting this makes the filter block any address it cannot match.
    #[arg(long, value_name = "ADDRESSES")]
    pub whitelisted_ips: Option<String>,

    /// Comma-separated list of IP addresses or CIDR networks blocked from
    /// connecting.
    #[arg(long, value_name = "ADDRESSES")]
    pub banned_ips: Option<String>,

    /// Resolve countries with a local GeoLite2 database instead of filtering
    /// by IP only.
    #[arg(long, default_value_t = false)]
    pub enable_geodb: bool,

    /// File path to the GeoLite2-Country database.
    #[arg(
        long,
        default_value_os = "./deploy/geoip/GeoLite2-Country.mmdb",
        value_name = "FILE"
    )]
    pub geodb_file: PathBuf,

    /// File path to the server's secret key. If missing, it will be created
    /// for you.
    #[arg(
        long,
        default_value_os = "./deploy/server_keys/ssh",
        value_name = "FILE"
    )]
    pub private_key_file: PathBuf,

    /// Evict connections that fail to authenticate or to register a
    /// forwarding in time.
    #[arg(long, default_value_t = false)]
    pub cleanup_unbound: bool,

    /// Whether to periodically probe clients for liveness.
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    pub ping_client: bool,

    /// Interval between liveness probes.
    #[arg(long, default_value = "10s", value_name = "DURATION")]
    pub ping_client_interval: Duration,

    /// Grace period added on top of the probe interval before an
    /// unresponsive connection is reaped.
    #[arg(long, default_value = "5s", value_name = "DURATION")]
    pub connection_idle_timeout: Duration,

    /// Enable debug logging and the periodic registry snapshot.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}
