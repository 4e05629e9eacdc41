//! Cycle-accurate model of an off-chip DRAM memory controller.
//!
//! The controller admits requests from upstream cache channels once per
//! simulated tick, maps physical addresses onto a
//! (channel, rank, bank, row, column) topology, schedules DRAM commands
//! against per-bank timing constraints, arbitrates the shared data bus, and
//! returns completed responses upstream.

pub mod addrdec;
pub mod config;
pub mod controller;
pub mod dram;
pub mod fifo;
pub mod request;
pub mod upstream;

pub use config::Config;
pub use controller::MemoryController;
pub use request::{Request, Response};
pub use upstream::UpstreamChannel;

/// A physical or virtual memory address.
#[allow(non_camel_case_types)]
pub type address = u64;
