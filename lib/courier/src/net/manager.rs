use crate::net::address::Address;
use crate::net::connection::{Connection, ConnectionState, Delivery};
use crate::net::global::GlobalConnection;
use crate::net::header::{GlobalHeader, Header, GLOBAL_MAGIC, MAX_DATAGRAM_SIZE, PRIVATE_MAGIC};
use crate::net::queue::Timing;
use crate::net::support::{ErrorType, ErrorUtils, NetworkError, NetworkResult};
use crate::net::transport::Transport;
use flux::{PlayerId, Tick};
use hashbrown::HashMap;
use indexmap::IndexSet;
use serde_derive::{Deserialize, Serialize};
use slog::{debug, info, o, trace, warn, Logger};

pub type ConnectionId = usize;

/// Minimum number of acknowledged packets before a connection's response time is trusted.
pub const MIN_RESPONSE_SAMPLES: u64 = 5;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionChange {
    /// The first datagram from the peer arrived.
    Established(ConnectionId),
    /// The connection ran out of retries or its transport failed. Reported once per connection.
    Failed(ConnectionId),
    /// A global packet addressed to a specific peer could not be delivered.
    Undeliverable(Address),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Identifies the program on the global channel, datagrams with other ids are dropped.
    pub product_id: u16,
    pub send_queue_len: usize,
    pub receive_queue_len: usize,
    pub max_connections: usize,
    pub timing: Timing,
    pub global_timing: Timing,
}

impl Default for ManagerSettings {
    fn default() -> ManagerSettings {
        ManagerSettings {
            product_id: 0x0a55,
            timing: Timing::default(),
            global_timing: Timing {
                retry_delta: 30,
                max_retries: Some(5),
                timeout: 60 * 10,
            },
            send_queue_len: 64,
            receive_queue_len: 64,
            max_connections: 7,
        }
    }
}

/// Owns the transport, the global connection and the private connections. Routes incoming
/// datagrams by magic number and sender address, and drives retransmission.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    settings: ManagerSettings,

    global: GlobalConnection,

    // Storage
    connections: Vec<Option<Connection>>,
    // Ids of unused connection slots
    free: Vec<ConnectionId>,
    live: IndexSet<ConnectionId>,
    addresses: HashMap<Address, ConnectionId>,

    changes: Vec<ConnectionChange>,

    buffer: Vec<u8>,
    receive_overflows: u64,
    dropped: u64,

    log: Logger,
}

impl<T: Transport> ConnectionManager<T> {
    #[inline]
    pub fn new(transport: T, settings: ManagerSettings, log: &Logger) -> ConnectionManager<T> {
        let log = log.new(o!("component" => "connections"));

        ConnectionManager {
            global: GlobalConnection::new(
                settings.product_id,
                settings.global_timing,
                settings.send_queue_len,
                settings.receive_queue_len,
                &log,
            ),
            transport,
            settings,
            connections: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            addresses: HashMap::new(),
            changes: Vec::new(),
            buffer: vec![0; MAX_DATAGRAM_SIZE],
            receive_overflows: 0,
            dropped: 0,
            log,
        }
    }

    #[inline]
    pub fn open(&mut self) -> NetworkResult<()> {
        self.transport.open()?;
        info!(self.log, "Transport open"; "address" => %self.transport.local_address());
        Ok(())
    }

    /// Closes the transport and discards every connection.
    #[inline]
    pub fn close(&mut self) {
        let ids: Vec<_> = self.live.iter().copied().collect();
        for id in ids {
            self.delete_connection(id);
        }

        self.global.clear();
        self.transport.close();
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    #[inline]
    pub fn local_address(&self) -> Address {
        self.transport.local_address()
    }

    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[inline]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    #[inline]
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Creates a private connection to the peer at `address`.
    pub fn create_connection(&mut self, id: PlayerId, name: &str, address: Address) -> NetworkResult<ConnectionId> {
        if address.is_broadcast() {
            return Err(NetworkError::Fatal(ErrorType::UnsupportedAddress));
        }

        if self.addresses.contains_key(&address) {
            return Err(NetworkError::Fatal(ErrorType::AlreadyConnected));
        }

        if self.live.len() >= self.settings.max_connections {
            return Err(NetworkError::Fatal(ErrorType::TooManyConnections));
        }

        let connection = Connection::new(
            id,
            name,
            address,
            self.settings.timing,
            self.settings.send_queue_len,
            self.settings.receive_queue_len,
            &self.log,
        );

        let connection_id = match self.free.pop() {
            Some(connection_id) => {
                self.connections[connection_id] = Some(connection);
                connection_id
            }
            None => {
                self.connections.push(Some(connection));
                self.connections.len() - 1
            }
        };

        self.live.insert(connection_id);
        self.addresses.insert(address, connection_id);

        debug!(self.log, "Connection created"; "connection_id" => connection_id, "peer" => id, "address" => %address);
        Ok(connection_id)
    }

    /// Deletes the connection, dropping any queued packets. Deleting an unknown id is a no-op.
    pub fn delete_connection(&mut self, connection_id: ConnectionId) {
        if !self.live.swap_remove(&connection_id) {
            return;
        }

        if let Some(connection) = self.connections[connection_id].take() {
            self.addresses.remove(&connection.address());
            debug!(self.log, "Connection deleted"; "connection_id" => connection_id, "peer" => connection.id());
        }

        self.free.push(connection_id);
    }

    /// Id of the connection bound to the supplied address.
    #[inline]
    pub fn connection_index(&self, address: &Address) -> Option<ConnectionId> {
        self.addresses.get(address).copied()
    }

    #[inline]
    pub fn connection(&self, connection_id: ConnectionId) -> Option<&Connection> {
        self.connections.get(connection_id).and_then(Option::as_ref)
    }

    /// Ids of all live connections.
    #[inline]
    pub fn connection_ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.live.iter().copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// First connection that has failed, if any.
    #[inline]
    pub fn bad_connection(&self) -> Option<ConnectionId> {
        self.live.iter().copied().find(|&connection_id| {
            self.connection(connection_id)
                .map_or(false, |connection| connection.state() == ConnectionState::Failed)
        })
    }

    #[inline]
    pub fn send_private(&mut self, connection_id: ConnectionId, payload: &[u8], ack: bool) -> NetworkResult<()> {
        self.connection_mut(connection_id)?.send(payload, ack)
    }

    #[inline]
    pub fn get_private(&mut self, connection_id: ConnectionId) -> Option<Vec<u8>> {
        self.connection_mut(connection_id).ok()?.get_message()
    }

    /// Queues a global packet, broadcast when no destination is supplied.
    #[inline]
    pub fn send_global(&mut self, payload: &[u8], destination: Option<Address>) -> NetworkResult<()> {
        self.global.send(payload, destination)
    }

    #[inline]
    pub fn get_global(&mut self) -> Option<(Address, Vec<u8>)> {
        self.global.get_message()
    }

    /// Applies new retransmission parameters to every connection, present and future.
    pub fn set_timing(&mut self, timing: Timing) {
        self.settings.timing = timing;

        for connection in self.connections.iter_mut().flatten() {
            connection.set_timing(timing);
        }

        debug!(self.log, "Timing changed"; "retry_delta" => timing.retry_delta, "timeout" => timing.timeout);
    }

    /// Maximum of the average response times over all connections with enough samples.
    #[inline]
    pub fn response_time(&self) -> Option<Tick> {
        self.connections
            .iter()
            .flatten()
            .filter(|connection| connection.stats().count() >= MIN_RESPONSE_SAMPLES)
            .filter_map(|connection| connection.stats().average())
            .max()
    }

    #[inline]
    pub fn reset_response_time(&mut self) {
        for connection in self.connections.iter_mut().flatten() {
            connection.reset_stats();
        }
    }

    #[inline]
    pub fn global_send_pending(&self) -> usize {
        self.global.send_pending()
    }

    #[inline]
    pub fn global_receive_pending(&self) -> usize {
        self.global.receive_pending()
    }

    #[inline]
    pub fn private_send_pending(&self) -> usize {
        self.connections.iter().flatten().map(Connection::send_pending).sum()
    }

    #[inline]
    pub fn private_receive_pending(&self) -> usize {
        self.connections.iter().flatten().map(Connection::receive_pending).sum()
    }

    /// Number of datagrams dropped because a receive queue was full.
    #[inline]
    pub fn receive_overflows(&self) -> u64 {
        self.receive_overflows
    }

    /// Number of datagrams dropped as undecodable or from unknown senders.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    #[inline]
    pub fn changes(&mut self) -> impl Iterator<Item = ConnectionChange> + '_ {
        self.changes.drain(..)
    }

    /// Drains the transport, then transmits and retransmits on every connection. Never blocks.
    /// Errors are only returned when receiving from the transport fails.
    pub fn service(&mut self, now: Tick) -> NetworkResult<()> {
        loop {
            match self.transport.recv(&mut self.buffer) {
                Ok((source, size)) => self.route(source, size, now),
                Err(NetworkError::Wait) => break,
                Err(error) => {
                    warn!(self.log, "Transport receive failed"; "error" => %error);
                    return Err(error);
                }
            }
        }

        let transport = &mut self.transport;
        let changes = &mut self.changes;
        let log = &self.log;

        match self.global.service(transport, now) {
            Ok(undeliverable) => changes.extend(undeliverable.into_iter().map(ConnectionChange::Undeliverable)),
            Err(error) => warn!(log, "Global send failed"; "error" => %error),
        }

        for &connection_id in self.live.iter() {
            if let Some(connection) = self.connections[connection_id].as_mut() {
                if connection.service(transport, now).has_failed() {
                    changes.push(ConnectionChange::Failed(connection_id));
                }
            }
        }

        Ok(())
    }

    fn route(&mut self, source: Address, size: usize, now: Tick) {
        let transport = &mut self.transport;
        let mut datagram = &self.buffer[..size];

        let result = match Header::peek_magic(datagram) {
            Ok(GLOBAL_MAGIC) => match GlobalHeader::read(&mut datagram) {
                Ok(header) => self.global.receive(transport, source, header, datagram, now),
                Err(error) => Err(error),
            },
            Ok(PRIVATE_MAGIC) => {
                let connection_id = self.addresses.get(&source).copied();

                match connection_id {
                    Some(connection_id) => match self.connections[connection_id].as_mut() {
                        Some(connection) => {
                            let pending = connection.state() == ConnectionState::Pending;

                            let result = match Header::read(&mut datagram) {
                                Ok(header) => connection.receive(transport, header, datagram, now),
                                Err(error) => Err(error),
                            };

                            if pending && connection.state() == ConnectionState::Established {
                                self.changes.push(ConnectionChange::Established(connection_id));
                            }

                            result
                        }
                        None => Err(NetworkError::Fatal(ErrorType::UnknownConnection)),
                    },
                    None => Err(NetworkError::Fatal(ErrorType::UnknownConnection)),
                }
            }
            Ok(magic) => Err(NetworkError::Fatal(ErrorType::MagicMismatch(magic))),
            Err(error) => Err(error),
        };

        match result {
            Ok(Delivery::Overflow) => self.receive_overflows += 1,
            Ok(_) => (),
            Err(error) => {
                self.dropped += 1;
                trace!(self.log, "Datagram dropped"; "source" => %source, "error" => %error);
            }
        }
    }

    #[inline]
    fn connection_mut(&mut self, connection_id: ConnectionId) -> NetworkResult<&mut Connection> {
        self.connections
            .get_mut(connection_id)
            .and_then(Option::as_mut)
            .ok_or(NetworkError::Fatal(ErrorType::UnknownConnection))
    }
}
