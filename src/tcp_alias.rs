use std::fmt::Display;

// A TCP alias, i.e. an address and port pair requested via remote forwarding.
#[derive(Clone, Debug, Hash, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) struct TcpAlias(pub(crate) String, pub(crate) u16);

impl Display for TcpAlias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}
