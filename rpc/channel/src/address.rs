//! Backend addresses and endpoints.

use std::fmt;
use std::net::SocketAddr;

/// One concrete backend address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// TCP host:port.
    Tcp(SocketAddr),
    /// Unix domain socket path.
    Unix(String),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(addr) => write!(f, "{}", addr),
            Address::Unix(path) => write!(f, "unix:{}", path),
        }
    }
}

/// An ordered list of addresses considered equivalent for one logical
/// backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub addresses: Vec<Address>,
}

impl Endpoint {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self { addresses }
    }

    /// Single-address endpoint.
    pub fn from_address(address: Address) -> Self {
        Self {
            addresses: vec![address],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let addr: SocketAddr = "10.0.0.1:443".parse().unwrap();
        assert_eq!(Address::Tcp(addr).to_string(), "10.0.0.1:443");
        assert_eq!(
            Address::Unix("/run/svc.sock".into()).to_string(),
            "unix:/run/svc.sock"
        );
    }
}
