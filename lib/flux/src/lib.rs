#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Simulation ticks. All timing in the network layer is expressed in ticks supplied by the caller.
pub type Tick = u64;

/// Lock-step simulation frame number.
pub type FrameNo = u32;

/// Player identifier, unique within a session.
pub type PlayerId = u8;

pub mod logging;
pub mod time;
pub mod util;
