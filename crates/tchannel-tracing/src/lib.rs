#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod bridge;
mod carrier;
mod tracer;

pub use bridge::*;
pub use carrier::*;
pub use tracer::*;

pub use tchannel_core::TRACING_KEY_PREFIX;
