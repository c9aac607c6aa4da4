//! Gateway: logical stream routing and port forwarding.
//!
//! - **[`streams`]**: the [`StreamRouter`] accepts or rejects stream-open
//!   requests by type, and [`streams::session_stub`] answers sub-requests
//!   on interactive sessions.
//! - **[`forwarder`]**: the [`ForwardingEngine`] connects a
//!   `direct-tcpip` request either directly or through a registered reverse
//!   client, and [`forwarder::relay`] pipes bytes until either side closes.
//!
//! ```text
//! direct-tcpip open
//!   → StreamRouter::route
//!   → ForwardingEngine::connect
//!       → ReverseClientRegistry::lookup(host, user)
//!       → Tunnel::open_secondary  |  Dialer::dial
//!   → spawn_relay
//! ```

pub mod forwarder;
pub mod streams;

pub use forwarder::{relay, spawn_relay, ForwardingEngine, Route};
pub use streams::StreamRouter;
