//! HTTP proxy surface

pub mod forward;
pub mod http;

pub use forward::{ForwardRequest, Forwarder};
pub use http::{run, serve, AppState};
