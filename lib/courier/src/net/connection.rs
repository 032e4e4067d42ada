use crate::net::address::Address;
use crate::net::header::{Code, Header, MAX_PAYLOAD_SIZE};
use crate::net::queue::{ReceiveEntry, ReceiveQueue, ResponseStats, SendEntry, SendQueue, Timing};
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crate::net::transport::Transport;
use flux::{PlayerId, Tick};
use slog::{debug, o, trace, warn, Logger};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    /// Nothing has been received from the peer yet.
    Pending,
    /// At least one datagram has been received from the peer.
    Established,
    /// Retries were exhausted or the transport failed. A failed connection stays inert.
    Failed,
}

/// Outcome of handing a datagram to a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Delivery {
    Queued,
    Duplicate,
    /// Dropped for lack of room in the receive queue, the sender will retransmit.
    Overflow,
    Acknowledgement,
}

/// Sequenced channel to a single peer. Packets are either acknowledged, in which case they are
/// retransmitted until the peer confirms them and delivered in order, or fire and forget.
pub struct Connection {
    id: PlayerId,
    name: String,
    address: Address,
    // Next hop address, resolved on the first transmission
    immediate: Option<Address>,
    state: ConnectionState,
    timing: Timing,

    send_queue: SendQueue,
    receive_queue: ReceiveQueue,

    // Ids assigned to outbound packets, acknowledged and fire and forget packets count separately
    next_ack_id: u32,
    next_noack_id: u32,
    // Highest id up to which every acknowledged packet has been received
    last_sequence_id: u32,
    // Id of the last acknowledged packet handed to the application
    last_read_id: u32,

    stats: ResponseStats,
    log: Logger,
}

impl Connection {
    #[inline]
    pub fn new(
        id: PlayerId,
        name: &str,
        address: Address,
        timing: Timing,
        send_capacity: usize,
        receive_capacity: usize,
        log: &Logger,
    ) -> Connection {
        Connection {
            id,
            name: name.to_owned(),
            address,
            immediate: None,
            state: ConnectionState::Pending,
            timing,
            send_queue: SendQueue::new(send_capacity),
            receive_queue: ReceiveQueue::new(receive_capacity),
            next_ack_id: 1,
            next_noack_id: 1,
            last_sequence_id: 0,
            last_read_id: 0,
            stats: ResponseStats::default(),
            log: log.new(o!("peer" => id, "address" => address.to_string())),
        }
    }

    #[inline]
    pub fn id(&self) -> PlayerId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.address
    }

    #[inline]
    pub fn immediate_address(&self) -> Option<Address> {
        self.immediate
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn timing(&self) -> Timing {
        self.timing
    }

    #[inline]
    pub fn set_timing(&mut self, timing: Timing) {
        self.timing = timing;
    }

    /// Response time statistics of acknowledged packets.
    #[inline]
    pub fn stats(&self) -> &ResponseStats {
        &self.stats
    }

    #[inline]
    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Number of outbound packets not yet sent or acknowledged.
    #[inline]
    pub fn send_pending(&self) -> usize {
        self.send_queue.len()
    }

    /// Number of received packets not yet consumed.
    #[inline]
    pub fn receive_pending(&self) -> usize {
        self.receive_queue.len()
    }

    /// Queues a packet for transmission on the next service round. Success does not imply
    /// delivery, only that the packet was accepted into the send queue.
    pub fn send(&mut self, payload: &[u8], ack: bool) -> NetworkResult<()> {
        if self.state == ConnectionState::Failed {
            return Err(NetworkError::Fatal(ErrorType::ConnectionFailed));
        }

        if payload.is_empty() {
            return Err(NetworkError::Fatal(ErrorType::EmptyPayload));
        }

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        let (code, packet_id) = match ack {
            true => (Code::DataAck, self.next_ack_id),
            false => (Code::DataNoAck, self.next_noack_id),
        };

        self.send_queue
            .push(SendEntry::new(packet_id, code, None, payload.to_vec()))?;

        match ack {
            true => self.next_ack_id += 1,
            false => self.next_noack_id += 1,
        }

        Ok(())
    }

    /// Processes a datagram received from the peer.
    pub fn receive<T: Transport>(
        &mut self,
        transport: &mut T,
        header: Header,
        payload: &[u8],
        now: Tick,
    ) -> NetworkResult<Delivery> {
        if self.state == ConnectionState::Failed {
            return Err(NetworkError::Fatal(ErrorType::ConnectionFailed));
        }

        self.state = ConnectionState::Established;
        let packet_id = header.packet_id;

        match header.code {
            Code::Ack => {
                if let Some(elapsed) = self.send_queue.acknowledge(packet_id, now, |_| true) {
                    self.stats.record(elapsed);
                }
                Ok(Delivery::Acknowledgement)
            }
            Code::DataAck => {
                // Already delivered or queued, the acknowledgement must have been lost
                if packet_id <= self.last_sequence_id || self.receive_queue.contains(packet_id, Code::DataAck) {
                    trace!(self.log, "Duplicate packet"; "packet_id" => packet_id);
                    self.acknowledge(transport, packet_id)?;
                    return Ok(Delivery::Duplicate);
                }

                // The last slot is reserved for the packet unblocking in order delivery
                let free = self.receive_queue.free_slots();
                if free == 0 || (free == 1 && packet_id != self.last_sequence_id + 1) {
                    debug!(self.log, "Receive queue overflow"; "packet_id" => packet_id);
                    return Ok(Delivery::Overflow);
                }

                self.receive_queue.push(ReceiveEntry {
                    packet_id,
                    code: Code::DataAck,
                    source: self.address,
                    data: payload.to_vec(),
                })?;

                self.acknowledge(transport, packet_id)?;

                while self.receive_queue.contains(self.last_sequence_id + 1, Code::DataAck) {
                    self.last_sequence_id += 1;
                }

                Ok(Delivery::Queued)
            }
            Code::DataNoAck => {
                if self.receive_queue.contains(packet_id, Code::DataNoAck) {
                    return Ok(Delivery::Duplicate);
                }

                match self.receive_queue.push(ReceiveEntry {
                    packet_id,
                    code: Code::DataNoAck,
                    source: self.address,
                    data: payload.to_vec(),
                }) {
                    Ok(()) => Ok(Delivery::Queued),
                    Err(NetworkError::Wait) => Ok(Delivery::Overflow),
                    Err(error) => Err(error),
                }
            }
        }
    }

    /// Transmits new packets and retransmits unacknowledged ones whose retry delta has elapsed.
    /// Returns an error exactly once, when the connection fails, and does nothing afterwards.
    pub fn service<T: Transport>(&mut self, transport: &mut T, now: Tick) -> NetworkResult<()> {
        if self.state == ConnectionState::Failed {
            return Ok(());
        }

        let destination = match self.resolve(transport) {
            Ok(destination) => destination,
            Err(error) => return self.fail(error),
        };

        let result = self.send_queue.service(now, &self.timing, |entry| {
            let datagram = Header::new(entry.code, entry.packet_id).datagram(&entry.data)?;
            transport.send_to(&destination, &datagram)
        });

        match result {
            Ok(expired) => match expired.first() {
                Some(entry) => {
                    let error = match entry.send_count > self.timing.max_retries.unwrap_or(u32::max_value()) {
                        true => ErrorType::RetriesExhausted,
                        false => ErrorType::Expired,
                    };
                    self.fail(NetworkError::Fatal(error))
                }
                None => Ok(()),
            },
            Err(error) => self.fail(error),
        }
    }

    /// Pops the oldest deliverable payload. Acknowledged packets are delivered strictly in id
    /// order, fire and forget packets as they arrive.
    pub fn get_message(&mut self) -> Option<Vec<u8>> {
        let next_id = self.last_read_id + 1;

        let entry = self.receive_queue.take_first(|entry| match entry.code {
            Code::DataAck => entry.packet_id == next_id,
            _ => true,
        })?;

        if entry.code == Code::DataAck {
            self.last_read_id = next_id;
        }

        Some(entry.data)
    }

    /// Drops every queued packet in both directions.
    #[inline]
    pub fn clear(&mut self) {
        self.send_queue.clear();
        self.receive_queue.clear();
    }

    #[inline]
    fn resolve<T: Transport>(&mut self, transport: &mut T) -> NetworkResult<Address> {
        match self.immediate {
            Some(immediate) => Ok(immediate),
            None => {
                let immediate = transport.resolve(&self.address)?;
                self.immediate = Some(immediate);
                Ok(immediate)
            }
        }
    }

    #[inline]
    fn acknowledge<T: Transport>(&mut self, transport: &mut T, packet_id: u32) -> NetworkResult<()> {
        let destination = self.resolve(transport)?;
        let datagram = Header::new(Code::Ack, packet_id).datagram(&[])?;

        match transport.send_to(&destination, &datagram) {
            // The peer retransmits and gets acknowledged on the next attempt
            Err(NetworkError::Wait) => Ok(()),
            result => result,
        }
    }

    #[inline]
    fn fail(&mut self, error: NetworkError) -> NetworkResult<()> {
        warn!(self.log, "Connection failed"; "error" => %error);
        self.state = ConnectionState::Failed;
        Err(error)
    }
}
