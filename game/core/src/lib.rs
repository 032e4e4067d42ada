#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod event;
pub mod packet;
pub mod session;
pub mod transfer;
pub mod trigger;
pub mod wire;
