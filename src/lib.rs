#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod gateway;

pub use connection::{Connection, ConnectionId, SharedConnection, TcpConfig};
pub use factory::{ConnectionFactory, SharedFactory};
pub use gateway::{GatewayBuilder, OutboundGateway};
