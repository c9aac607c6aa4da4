//! revssh-core: shared protocol library for the revssh bastion.
//!
//! Provides the wire codec for forward and registration payloads, key
//! helpers, known_hosts TOFU records, the transport authority abstraction
//! and the raw transport traits both the broker and reverse client build on.

pub mod authority;
pub mod error;
pub mod keys;
pub mod known_hosts;
pub mod protocol;
pub mod transport;
pub mod wire;

// Re-export commonly used items at crate root.
pub use authority::{expand_tilde, FileAuthority, MemoryAuthority, TransportAuthority};
pub use error::{RevsshError, RevsshResult};
pub use protocol::{Reply, RequestKind, Role, StreamKind, VERSION};
pub use transport::{BoxedStream, Dialer, RawTransport, TcpDialer, Tunnel};
pub use wire::{ForwardRequest, RegistrationPayload, RequestEnvelope};
