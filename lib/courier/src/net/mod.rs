//! Reliable, sequenced delivery over an unreliable datagram transport.
//!
//! Every peer is served by a private `Connection`, discovery and announcements go through the
//! single `GlobalConnection`. The `ConnectionManager` owns the transport and both kinds of
//! connection, routes incoming datagrams and retransmits unacknowledged packets. Nothing in this
//! module blocks: the manager is serviced once per tick and time is supplied by the caller.

pub mod address;
pub mod connection;
pub mod global;
pub mod header;
pub mod manager;
pub mod queue;
pub mod support;
pub mod transport;
pub mod udp;
