//! Morpheus: real-time GPU video effects stage
//!
//! A shared display context owns the GPU device and hands frames between
//! producer threads and the effect engine, which renders one of a catalog of
//! shader effects into each output frame.

pub mod config;
pub mod display;
pub mod effects;
pub mod filter;
pub mod frame;
pub mod gpu;
pub mod shader;
pub mod utils;
