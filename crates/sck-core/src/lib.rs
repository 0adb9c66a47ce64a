//! Hardware-independent firmware core for the sck-rs sensor kit
//!
//! This crate contains the platform-agnostic logic of a battery powered
//! environmental sensor node: the mode controller state machine, the framed
//! link to the wireless co-processor, the in-memory reading store, local
//! card output, configuration persistence and power supervision.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets and desktop hosts (for the simulator and tests).
//! Hardware is reached only through the traits collected in [`hal`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod controller;
pub mod error;
pub mod hal;
pub mod link;
pub mod power;
pub mod sensors;
pub mod state;
pub mod status;
pub mod storage;
pub mod time;

#[cfg(test)]
pub(crate) mod testing;
