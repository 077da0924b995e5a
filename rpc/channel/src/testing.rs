//! In-memory network for tests and demos.
//!
//! A [`MemoryNetwork`] hands out connectors whose sessions are in-process
//! queue pairs; the server halves queue up on the network for a test
//! harness to accept and drive.

use crate::address::Address;
use crate::subchannel::Connector;
use rpc_h2::{ClientSession, MemoryServerSession, memory_pair};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

#[derive(Default)]
struct NetworkState {
    refuse: bool,
    accepted: VecDeque<(Address, MemoryServerSession)>,
}

/// An in-process "network" that vends memory connectors.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector wired to this network.
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            state: self.state.clone(),
        }
    }

    /// Make subsequent connection attempts fail with ECONNREFUSED.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.borrow_mut().refuse = refuse;
    }

    /// Take the next accepted server session, if any.
    pub fn accept(&self) -> Option<(Address, MemoryServerSession)> {
        self.state.borrow_mut().accepted.pop_front()
    }
}

/// Connector producing in-memory sessions.
pub struct MemoryConnector {
    state: Rc<RefCell<NetworkState>>,
}

impl Connector for MemoryConnector {
    fn connect(&mut self, address: &Address) -> io::Result<Box<dyn ClientSession>> {
        let mut state = self.state.borrow_mut();
        if state.refuse {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        let (client, server) = memory_pair();
        state.accepted.push_back((address.clone(), server));
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_connect_queues_server_half() {
        let network = MemoryNetwork::new();
        let mut connector = network.connector();
        let address = Address::Tcp("127.0.0.1:50051".parse::<SocketAddr>().unwrap());
        let session = connector.connect(&address).unwrap();
        assert!(session.is_ready());
        let (accepted_address, _server) = network.accept().unwrap();
        assert_eq!(accepted_address, address);
        assert!(network.accept().is_none());
    }

    #[test]
    fn test_refusal() {
        let network = MemoryNetwork::new();
        let mut connector = network.connector();
        network.refuse_connections(true);
        let address = Address::Tcp("127.0.0.1:50051".parse::<SocketAddr>().unwrap());
        assert!(connector.connect(&address).is_err());
        assert!(network.accept().is_none());
    }
}
