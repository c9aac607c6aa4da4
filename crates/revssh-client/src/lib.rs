//! revssh-client: the reverse client agent.
//!
//! Dials a revssh broker outbound, registers a hostname, and serves the
//! secondary streams the broker opens with an embedded SSH server, so the
//! machine is reachable through the broker without inbound connectivity.
//!
//! # Quick Start
//!
//! ```no_run
//! use revssh_client::{AgentSettings, ReverseAgent};
//! use revssh_core::FileAuthority;
//! use std::sync::Arc;
//!
//! # async fn example() -> revssh_core::RevsshResult<()> {
//! let authority = Arc::new(FileAuthority::new("/etc/revssh"));
//! let agent = ReverseAgent::new(
//!     AgentSettings::new("bastion.example.com:22", "alice", "box1"),
//!     authority,
//! );
//! agent.run().await
//! # }
//! ```

pub mod agent;
pub mod backoff;
pub mod config;
pub mod control;
pub mod keepalive;

pub use agent::{AgentSettings, AgentState, ReverseAgent};
pub use backoff::{Backoff, BackoffConfig};
pub use control::{send_request, SessionPinger};
pub use keepalive::{run_keepalive, KeepaliveTarget};

pub use revssh_core::{RevsshError, RevsshResult};
