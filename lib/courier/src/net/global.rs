use crate::net::address::Address;
use crate::net::connection::Delivery;
use crate::net::header::{Code, GlobalHeader, MAX_PAYLOAD_SIZE};
use crate::net::queue::{ReceiveEntry, ReceiveQueue, ResponseStats, SendEntry, SendQueue, Timing};
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crate::net::transport::Transport;
use flux::Tick;
use slog::{debug, o, trace, Logger};

const RECENT_SIZE: usize = 4;

/// Broadcast capable connection shared by every peer. Used for discovery and announcements
/// before private connections exist. Packets sent to a concrete address are acknowledged,
/// broadcasts are fire and forget.
pub struct GlobalConnection {
    product_id: u16,
    timing: Timing,

    send_queue: SendQueue,
    receive_queue: ReceiveQueue,

    next_ack_id: u32,
    next_noack_id: u32,

    // Recently received (source, packet id) pairs, for detecting retransmissions
    recent: [Option<(Address, u32)>; RECENT_SIZE],
    recent_index: usize,

    stats: ResponseStats,
    log: Logger,
}

impl GlobalConnection {
    #[inline]
    pub fn new(product_id: u16, timing: Timing, send_capacity: usize, receive_capacity: usize, log: &Logger) -> GlobalConnection {
        GlobalConnection {
            product_id,
            timing,
            send_queue: SendQueue::new(send_capacity),
            receive_queue: ReceiveQueue::new(receive_capacity),
            next_ack_id: 1,
            next_noack_id: 1,
            recent: [None; RECENT_SIZE],
            recent_index: 0,
            stats: ResponseStats::default(),
            log: log.new(o!("channel" => "global")),
        }
    }

    #[inline]
    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    #[inline]
    pub fn set_timing(&mut self, timing: Timing) {
        self.timing = timing;
    }

    #[inline]
    pub fn stats(&self) -> &ResponseStats {
        &self.stats
    }

    #[inline]
    pub fn send_pending(&self) -> usize {
        self.send_queue.len()
    }

    #[inline]
    pub fn receive_pending(&self) -> usize {
        self.receive_queue.len()
    }

    /// Queues a packet. Without a destination the packet is broadcast and not acknowledged.
    pub fn send(&mut self, payload: &[u8], destination: Option<Address>) -> NetworkResult<()> {
        if payload.is_empty() {
            return Err(NetworkError::Fatal(ErrorType::EmptyPayload));
        }

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        let destination = destination.filter(|address| !address.is_broadcast());

        let (code, packet_id) = match destination {
            Some(_) => (Code::DataAck, self.next_ack_id),
            None => (Code::DataNoAck, self.next_noack_id),
        };

        self.send_queue
            .push(SendEntry::new(packet_id, code, destination, payload.to_vec()))?;

        match code {
            Code::DataAck => self.next_ack_id += 1,
            _ => self.next_noack_id += 1,
        }

        Ok(())
    }

    /// Processes a datagram received from `source`.
    pub fn receive<T: Transport>(
        &mut self,
        transport: &mut T,
        source: Address,
        header: GlobalHeader,
        payload: &[u8],
        now: Tick,
    ) -> NetworkResult<Delivery> {
        if header.product_id != self.product_id {
            return Err(NetworkError::Fatal(ErrorType::ProductMismatch(header.product_id)));
        }

        let packet_id = header.header.packet_id;

        match header.header.code {
            Code::Ack => {
                let acknowledged = self
                    .send_queue
                    .acknowledge(packet_id, now, |entry| entry.destination == Some(source));

                if let Some(elapsed) = acknowledged {
                    self.stats.record(elapsed);
                }

                Ok(Delivery::Acknowledgement)
            }
            Code::DataAck => {
                if self.recent.contains(&Some((source, packet_id))) {
                    trace!(self.log, "Duplicate packet"; "source" => %source, "packet_id" => packet_id);
                    self.acknowledge(transport, source, packet_id)?;
                    return Ok(Delivery::Duplicate);
                }

                // Not acknowledged, the sender retries once there is room
                if self.push(packet_id, Code::DataAck, source, payload).is_err() {
                    debug!(self.log, "Receive queue overflow"; "source" => %source);
                    return Ok(Delivery::Overflow);
                }

                self.recent[self.recent_index] = Some((source, packet_id));
                self.recent_index = (self.recent_index + 1) % RECENT_SIZE;

                self.acknowledge(transport, source, packet_id)?;
                Ok(Delivery::Queued)
            }
            Code::DataNoAck => match self.push(packet_id, Code::DataNoAck, source, payload) {
                Ok(()) => Ok(Delivery::Queued),
                Err(_) => Ok(Delivery::Overflow),
            },
        }
    }

    /// Transmits and retransmits queued packets. Packets that could not be delivered are dropped
    /// and their destinations returned.
    pub fn service<T: Transport>(&mut self, transport: &mut T, now: Tick) -> NetworkResult<Vec<Address>> {
        let product_id = self.product_id;

        let expired = self.send_queue.service(now, &self.timing, |entry| {
            let datagram = GlobalHeader::new(entry.code, entry.packet_id, product_id).datagram(&entry.data)?;

            match entry.destination {
                Some(destination) => transport.send_to(&destination, &datagram),
                None => transport.broadcast(&datagram),
            }
        })?;

        Ok(expired
            .into_iter()
            .filter_map(|entry| entry.destination)
            .collect())
    }

    /// Pops the oldest received payload together with its source address.
    #[inline]
    pub fn get_message(&mut self) -> Option<(Address, Vec<u8>)> {
        self.receive_queue
            .take_first(|_| true)
            .map(|entry| (entry.source, entry.data))
    }

    #[inline]
    pub fn clear(&mut self) {
        self.send_queue.clear();
        self.receive_queue.clear();
        self.recent = [None; RECENT_SIZE];
    }

    #[inline]
    fn push(&mut self, packet_id: u32, code: Code, source: Address, payload: &[u8]) -> NetworkResult<()> {
        self.receive_queue.push(ReceiveEntry {
            packet_id,
            code,
            source,
            data: payload.to_vec(),
        })
    }

    #[inline]
    fn acknowledge<T: Transport>(&self, transport: &mut T, destination: Address, packet_id: u32) -> NetworkResult<()> {
        let datagram = GlobalHeader::new(Code::Ack, packet_id, self.product_id).datagram(&[])?;

        match transport.send_to(&destination, &datagram) {
            Err(NetworkError::Wait) => Ok(()),
            result => result,
        }
    }
}
