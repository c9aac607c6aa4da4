//! revssh-server: SSH bastion that brokers connections to reverse clients.
//!
//! Reverse clients dial in, authenticate and register a hostname. Inbound
//! clients asking to forward to that hostname are tunnelled through a
//! secondary stream on the reverse client's own connection; every other
//! destination is dialed directly.

pub mod config;
pub mod connection;
pub mod gateway;
pub mod relay;
pub mod server;

pub use connection::{ConnectionManager, ConnectionSettings, SshTunnel};
pub use gateway::{ForwardingEngine, Route, StreamRouter};
pub use relay::{RequestRouter, ReverseClientEntry, ReverseClientRegistry, SessionBinder};
pub use server::RevsshServer;
