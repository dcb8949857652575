#![doc = include_str!("../README.md")]
#![warn(rust_2018_idioms)]

pub use crate::configspace::{ConfigSpace0, BAR_PROBE_VALUE, CONFIG_SPACE_LEN};
pub use crate::connection::{BarSlot, CompletionHandler, Connection, ReadHandler, Received, WriteHandler};
pub use crate::dllp::Dllp;
pub use crate::error::Error;
pub use crate::eventloop::{EventLoop, Family, DEFAULT_PORT};
pub use crate::proto::{fmt, tlp_type, CplStatus};
pub use crate::requester::AckKind;
pub use crate::tlp::{Tlp, TlpBody, TlpKind};

pub mod pci;

mod configspace;
mod connection;
mod crc;
mod dllp;
mod error;
mod eventloop;
mod proto;
mod requester;
mod router;
mod tlp;
