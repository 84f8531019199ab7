use ipnet::IpNet;

use crate::tcp_alias::TcpAlias;

#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("Invalid address {0}")]
    InvalidAddress(String),
    #[error("Invalid file path")]
    InvalidFilePath,
    #[error("Network CIDR {0} is duplicated")]
    DuplicateNetworkCidr(IpNet),
    #[error("Host {0} is already being served")]
    HostAlreadyBound(String),
    #[error("Forwarding for {0} is already registered")]
    ForwardingAlreadyBound(TcpAlias),
    #[error("TCP alias {0} is already being served")]
    AliasAlreadyBound(TcpAlias),
}
