#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod call;
mod checksum;
mod codec;
mod connection;
mod error;
mod fragment;
mod frame;
mod headers;
mod init;
mod limits;
mod transport;

pub use call::*;
pub use checksum::*;
pub use codec::*;
pub use connection::*;
pub use error::*;
pub use fragment::*;
pub use frame::*;
pub use headers::*;
pub use init::*;
pub use limits::*;
pub use transport::*;
