use crate::net::support::{ErrorType, NetworkError};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Opaque network address of a peer. The connection layer only ever compares, copies and hashes
/// addresses, interpretation is left to the transport.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    /// Wildcard address reaching every listening peer.
    Broadcast,
    /// Abstract node number, used by transports without a socket layer.
    Node(u64),
    Socket(SocketAddr),
}

impl Address {
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        *self == Address::Broadcast
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::Broadcast => write!(f, "broadcast"),
            Address::Node(node) => write!(f, "node:{}", node),
            Address::Socket(addr) => write!(f, "{}", addr),
        }
    }
}

impl From<SocketAddr> for Address {
    #[inline]
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl FromStr for Address {
    type Err = NetworkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "broadcast" {
            return Ok(Address::Broadcast);
        }

        if let Some(node) = value.strip_prefix("node:") {
            return node
                .parse::<u64>()
                .map(Address::Node)
                .map_err(|_| NetworkError::Fatal(ErrorType::AddrParse));
        }

        Ok(Address::Socket(value.parse::<SocketAddr>()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("broadcast".parse::<Address>().unwrap(), Address::Broadcast);
        assert_eq!("node:12".parse::<Address>().unwrap(), Address::Node(12));
        assert_eq!(
            "127.0.0.1:28008".parse::<Address>().unwrap(),
            Address::Socket("127.0.0.1:28008".parse().unwrap())
        );
        assert_eq!(
            "node:x".parse::<Address>().unwrap_err(),
            NetworkError::Fatal(ErrorType::AddrParse)
        );
        assert_eq!(
            "localhost".parse::<Address>().unwrap_err(),
            NetworkError::Fatal(ErrorType::AddrParse)
        );
    }

    #[test]
    fn test_display_roundtrip() {
        for addr in &[Address::Broadcast, Address::Node(3), "10.0.0.1:9".parse().unwrap()] {
            assert_eq!(addr.to_string().parse::<Address>().unwrap(), *addr);
        }
        assert!(Address::Broadcast.is_broadcast());
        assert!(!Address::Node(0).is_broadcast());
    }
}
