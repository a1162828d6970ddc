//! MySQL wire-protocol client.
//!
//! This crate implements the client side of the MySQL protocol from scratch
//! on top of asupersync's TCP primitives. It provides:
//!
//! - Buffered socket I/O with one outstanding receive and send
//! - Packet framing with sequence numbers, including packets over 16MB
//! - An incremental parser driven by the connection phase
//! - The handshake with `mysql_native_password` authentication
//! - Chain steps that run connection operations one after another
//!
//! # Example
//!
//! ```rust,ignore
//! use mysqlwire::{Connection, ConnectionConfig, TaskChain, steps};
//!
//! let config = ConnectionConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = Connection::new(config)?;
//! let mut chain = TaskChain::new();
//! steps::open_step(&mut chain, &cx);
//! steps::close_step(&mut chain, &cx);
//! chain.run(&mut conn).await.into_result()?;
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod io;
pub mod protocol;
pub mod steps;

#[cfg(test)]
mod mock;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionState, QueryResult, ResultSet};
pub use io::{RecvEvent, SendEvent, SocketIo, Transport};
pub use protocol::{PacketParser, PacketWriter, ParseResult, ParserPhase};

pub use mysqlwire_core::{ChainOutcome, Cx, Error, FailurePolicy, Outcome, StepContext, TaskChain};
