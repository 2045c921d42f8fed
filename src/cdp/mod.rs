//! Minimal Chrome DevTools Protocol client
//!
//! Hand-rolled transport, connection/session management, and the protocol
//! types the sniffer needs. No generated bindings.

pub mod connection;
pub mod transport;
pub mod types;

pub use connection::{Connection, Session};
pub use transport::{launch_browser, PageEvent, Transport};
