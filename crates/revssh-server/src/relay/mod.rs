//! Reverse client relay: registry, session binding and request routing.

pub mod registry;
pub mod requests;
pub mod sessions;

pub use registry::{ReverseClientEntry, ReverseClientRegistry};
pub use requests::{RequestContext, RequestRouter};
pub use sessions::SessionBinder;
