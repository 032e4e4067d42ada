use crate::net::address::Address;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use hashbrown::HashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Unreliable datagram primitive the connection layer is built upon. Implementations must never
/// block: `recv` returns `NetworkError::Wait` when no datagram is pending.
pub trait Transport {
    fn open(&mut self) -> NetworkResult<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Address other peers see as the source of datagrams sent through this transport.
    fn local_address(&self) -> Address;

    fn send_to(&mut self, address: &Address, data: &[u8]) -> NetworkResult<()>;

    fn broadcast(&mut self, data: &[u8]) -> NetworkResult<()>;

    /// Receives a single datagram into the buffer, returning its source and size.
    fn recv(&mut self, buffer: &mut [u8]) -> NetworkResult<(Address, usize)>;

    /// Resolves the address datagrams for `address` should actually be sent to (e.g. a bridge).
    #[inline]
    fn resolve(&mut self, address: &Address) -> NetworkResult<Address> {
        Ok(*address)
    }
}

type Filter = Box<dyn FnMut(&Address, &Address, &[u8]) -> bool>;

#[derive(Default)]
struct HubState {
    mailboxes: HashMap<u64, VecDeque<(Address, Vec<u8>)>>,
    filter: Option<Filter>,
    delivered: u64,
    dropped: u64,
}

impl HubState {
    #[inline]
    fn deliver(&mut self, source: Address, node: u64, data: &[u8]) {
        let destination = Address::Node(node);

        if let Some(filter) = self.filter.as_mut() {
            if !filter(&source, &destination, data) {
                self.dropped += 1;
                return;
            }
        }

        if let Some(mailbox) = self.mailboxes.get_mut(&node) {
            mailbox.push_back((source, data.to_vec()));
            self.delivered += 1;
        } else {
            self.dropped += 1;
        }
    }
}

/// In-memory datagram network connecting `LoopbackTransport`s addressed by node number. A filter
/// may be installed to drop datagrams and simulate an unreliable network.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Rc<RefCell<HubState>>,
}

impl LoopbackHub {
    #[inline]
    pub fn new() -> LoopbackHub {
        LoopbackHub::default()
    }

    /// Creates a transport attached to the hub under the supplied node number.
    #[inline]
    pub fn transport(&self, node: u64) -> LoopbackTransport {
        LoopbackTransport {
            hub: self.clone(),
            node,
            open: false,
        }
    }

    /// Installs a filter deciding, per `(source, destination, datagram)`, whether a datagram is
    /// delivered.
    #[inline]
    pub fn set_filter<F>(&self, filter: F)
    where
        F: FnMut(&Address, &Address, &[u8]) -> bool + 'static,
    {
        self.state.borrow_mut().filter = Some(Box::new(filter));
    }

    #[inline]
    pub fn clear_filter(&self) {
        self.state.borrow_mut().filter = None;
    }

    /// Number of datagrams waiting to be received by the node.
    #[inline]
    pub fn pending(&self, node: u64) -> usize {
        self.state
            .borrow()
            .mailboxes
            .get(&node)
            .map_or(0, |mailbox| mailbox.len())
    }

    #[inline]
    pub fn delivered(&self) -> u64 {
        self.state.borrow().delivered
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.state.borrow().dropped
    }
}

pub struct LoopbackTransport {
    hub: LoopbackHub,
    node: u64,
    open: bool,
}

impl LoopbackTransport {
    #[inline]
    pub fn node(&self) -> u64 {
        self.node
    }

    #[inline]
    fn check_open(&self) -> NetworkResult<()> {
        match self.open {
            true => Ok(()),
            false => Err(NetworkError::Fatal(ErrorType::NotOpen)),
        }
    }
}

impl Transport for LoopbackTransport {
    fn open(&mut self) -> NetworkResult<()> {
        let mut state = self.hub.state.borrow_mut();

        if state.mailboxes.contains_key(&self.node) {
            return Err(NetworkError::Fatal(ErrorType::AlreadyConnected));
        }

        state.mailboxes.insert(self.node, VecDeque::new());
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.hub.state.borrow_mut().mailboxes.remove(&self.node);
            self.open = false;
        }
    }

    #[inline]
    fn is_open(&self) -> bool {
        self.open
    }

    #[inline]
    fn local_address(&self) -> Address {
        Address::Node(self.node)
    }

    fn send_to(&mut self, address: &Address, data: &[u8]) -> NetworkResult<()> {
        self.check_open()?;

        match address {
            Address::Node(node) => {
                self.hub.state.borrow_mut().deliver(self.local_address(), *node, data);
                Ok(())
            }
            Address::Broadcast => self.broadcast(data),
            Address::Socket(_) => Err(NetworkError::Fatal(ErrorType::UnsupportedAddress)),
        }
    }

    fn broadcast(&mut self, data: &[u8]) -> NetworkResult<()> {
        self.check_open()?;

        let mut state = self.hub.state.borrow_mut();
        let mut nodes: Vec<u64> = state.mailboxes.keys().copied().filter(|&node| node != self.node).collect();
        nodes.sort_unstable();

        for node in nodes {
            state.deliver(self.local_address(), node, data);
        }

        Ok(())
    }

    fn recv(&mut self, buffer: &mut [u8]) -> NetworkResult<(Address, usize)> {
        self.check_open()?;

        let mut state = self.hub.state.borrow_mut();
        let (source, data) = state
            .mailboxes
            .get_mut(&self.node)
            .and_then(|mailbox| mailbox.pop_front())
            .ok_or(NetworkError::Wait)?;

        if data.len() > buffer.len() {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        buffer[..data.len()].copy_from_slice(&data);
        Ok((source, data.len()))
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_recv() {
        let hub = LoopbackHub::new();
        let mut first = hub.transport(1);
        let mut second = hub.transport(2);

        first.open().unwrap();
        second.open().unwrap();

        first.send_to(&Address::Node(2), &[1, 2, 3]).unwrap();

        let mut buffer = [0u8; 16];
        let (source, size) = second.recv(&mut buffer).unwrap();

        assert_eq!(source, Address::Node(1));
        assert_eq!(&buffer[..size], &[1, 2, 3]);
        assert_eq!(second.recv(&mut buffer).unwrap_err(), NetworkError::Wait);
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let hub = LoopbackHub::new();
        let mut transports: Vec<_> = (0..3).map(|node| hub.transport(node)).collect();

        for transport in transports.iter_mut() {
            transport.open().unwrap();
        }

        transports[0].broadcast(&[7]).unwrap();

        assert_eq!(hub.pending(0), 0);
        assert_eq!(hub.pending(1), 1);
        assert_eq!(hub.pending(2), 1);
    }

    #[test]
    fn test_filter_drops() {
        let hub = LoopbackHub::new();
        let mut first = hub.transport(1);
        let mut second = hub.transport(2);

        first.open().unwrap();
        second.open().unwrap();

        hub.set_filter(|_, _, data| data[0] != 0);

        first.send_to(&Address::Node(2), &[0]).unwrap();
        first.send_to(&Address::Node(2), &[1]).unwrap();

        assert_eq!(hub.pending(2), 1);
        assert_eq!(hub.dropped(), 1);
        assert_eq!(hub.delivered(), 1);
    }

    #[test]
    fn test_closed_transport() {
        let hub = LoopbackHub::new();
        let mut transport = hub.transport(1);
        let mut buffer = [0u8; 4];

        assert_eq!(
            transport.recv(&mut buffer).unwrap_err(),
            NetworkError::Fatal(ErrorType::NotOpen)
        );

        transport.open().unwrap();
        assert_eq!(
            hub.transport(1).open().unwrap_err(),
            NetworkError::Fatal(ErrorType::AlreadyConnected)
        );

        transport.close();
        assert!(!transport.is_open());
        assert_eq!(
            transport.send_to(&Address::Node(2), &[1]).unwrap_err(),
            NetworkError::Fatal(ErrorType::NotOpen)
        );
    }
}
