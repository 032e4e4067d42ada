use crate::net::address::Address;
use crate::net::header::Code;
use crate::net::support::{NetworkError, NetworkResult};
use flux::Tick;
use serde_derive::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Retransmission parameters of a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    /// Ticks to wait for an acknowledgement before retransmitting.
    pub retry_delta: Tick,
    /// Number of retransmissions before giving up, unlimited if absent.
    pub max_retries: Option<u32>,
    /// Ticks after the first transmission before giving up regardless of the retry count.
    pub timeout: Tick,
}

impl Default for Timing {
    fn default() -> Timing {
        Timing {
            retry_delta: 15,
            max_retries: None,
            timeout: 60 * 60,
        }
    }
}

#[derive(Debug)]
pub struct SendEntry {
    pub packet_id: u32,
    pub code: Code,
    /// Destination of the entry, only used by the global connection. `None` broadcasts.
    pub destination: Option<Address>,
    pub data: Vec<u8>,
    pub first_sent: Option<Tick>,
    pub last_sent: Tick,
    pub send_count: u32,
    pub acknowledged: bool,
}

impl SendEntry {
    #[inline]
    pub fn new(packet_id: u32, code: Code, destination: Option<Address>, data: Vec<u8>) -> SendEntry {
        SendEntry {
            packet_id,
            code,
            destination,
            data,
            first_sent: None,
            last_sent: 0,
            send_count: 0,
            acknowledged: false,
        }
    }
}

/// Bounded FIFO queue of outbound packets awaiting transmission or acknowledgement.
pub struct SendQueue {
    entries: VecDeque<SendEntry>,
    capacity: usize,
}

impl SendQueue {
    #[inline]
    pub fn new(capacity: usize) -> SendQueue {
        SendQueue {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.entries.clear()
    }

    /// Appends an entry, `NetworkError::Wait` if the queue is at capacity.
    #[inline]
    pub fn push(&mut self, entry: SendEntry) -> NetworkResult<()> {
        if self.entries.len() >= self.capacity {
            return Err(NetworkError::Wait);
        }

        self.entries.push_back(entry);
        Ok(())
    }

    /// Marks the unacknowledged entry with the supplied id as acknowledged, returning the ticks
    /// elapsed since its first transmission. Only entries matching the `accept` predicate are
    /// considered.
    #[inline]
    pub fn acknowledge<F>(&mut self, packet_id: u32, now: Tick, accept: F) -> Option<Tick>
    where
        F: Fn(&SendEntry) -> bool,
    {
        let entry = self.entries.iter_mut().find(|entry| {
            entry.code == Code::DataAck && entry.packet_id == packet_id && !entry.acknowledged && accept(entry)
        })?;

        entry.acknowledged = true;
        Some(now.saturating_sub(entry.first_sent.unwrap_or(now)))
    }

    /// Runs one round of queue maintenance:
    ///
    /// * acknowledged entries are dropped,
    /// * entries never sent are transmitted, fire and forget entries are dropped right after,
    /// * entries whose retry delta elapsed are retransmitted,
    /// * entries out of retries or past the timeout are removed and returned.
    ///
    /// Transmission stops for the round when `transmit` reports `NetworkError::Wait`, fatal
    /// transmission errors are propagated.
    pub fn service<F>(&mut self, now: Tick, timing: &Timing, mut transmit: F) -> NetworkResult<Vec<SendEntry>>
    where
        F: FnMut(&SendEntry) -> NetworkResult<()>,
    {
        let mut expired = Vec::new();
        let mut index = 0;

        while index < self.entries.len() {
            let entry = &mut self.entries[index];

            if entry.acknowledged {
                self.entries.remove(index);
                continue;
            }

            match entry.first_sent {
                None => {
                    match transmit(entry) {
                        Err(NetworkError::Wait) => break,
                        Err(error) => return Err(error),
                        Ok(()) => (),
                    }

                    entry.first_sent = Some(now);
                    entry.last_sent = now;
                    entry.send_count = 1;

                    if entry.code == Code::DataNoAck {
                        self.entries.remove(index);
                        continue;
                    }
                }
                Some(first_sent) => {
                    let due = now.saturating_sub(entry.last_sent) >= timing.retry_delta;
                    let exhausted = timing.max_retries.map_or(false, |max| entry.send_count > max);

                    if now.saturating_sub(first_sent) > timing.timeout || (due && exhausted) {
                        if let Some(entry) = self.entries.remove(index) {
                            expired.push(entry);
                        }
                        continue;
                    }

                    if due {
                        match transmit(entry) {
                            Err(NetworkError::Wait) => break,
                            Err(error) => return Err(error),
                            Ok(()) => (),
                        }

                        entry.last_sent = now;
                        entry.send_count += 1;
                    }
                }
            }

            index += 1;
        }

        Ok(expired)
    }
}

#[derive(Debug)]
pub struct ReceiveEntry {
    pub packet_id: u32,
    pub code: Code,
    pub source: Address,
    pub data: Vec<u8>,
}

/// Bounded queue of inbound packets awaiting consumption by the application.
pub struct ReceiveQueue {
    entries: VecDeque<ReceiveEntry>,
    capacity: usize,
}

impl ReceiveQueue {
    #[inline]
    pub fn new(capacity: usize) -> ReceiveQueue {
        ReceiveQueue {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn free_slots(&self) -> usize {
        self.capacity - self.entries.len()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.entries.clear()
    }

    #[inline]
    pub fn contains(&self, packet_id: u32, code: Code) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.packet_id == packet_id && entry.code == code)
    }

    /// Appends an entry, `NetworkError::Wait` if the queue is at capacity.
    #[inline]
    pub fn push(&mut self, entry: ReceiveEntry) -> NetworkResult<()> {
        if self.entries.len() >= self.capacity {
            return Err(NetworkError::Wait);
        }

        self.entries.push_back(entry);
        Ok(())
    }

    /// Removes and returns the oldest entry satisfying the predicate.
    #[inline]
    pub fn take_first<F>(&mut self, predicate: F) -> Option<ReceiveEntry>
    where
        F: Fn(&ReceiveEntry) -> bool,
    {
        let index = self.entries.iter().position(predicate)?;
        self.entries.remove(index)
    }
}

/// Running response time statistics of acknowledged packets.
#[derive(Debug, Default, Copy, Clone)]
pub struct ResponseStats {
    count: u64,
    total: Tick,
    max: Tick,
}

impl ResponseStats {
    #[inline]
    pub fn record(&mut self, ticks: Tick) {
        self.count += 1;
        self.total += ticks;
        self.max = self.max.max(ticks);
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[inline]
    pub fn max(&self) -> Tick {
        self.max
    }

    #[inline]
    pub fn average(&self) -> Option<Tick> {
        match self.count {
            0 => None,
            count => Some(self.total / count),
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        *self = ResponseStats::default();
    }
}
