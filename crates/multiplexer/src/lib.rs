//! Shares one backend chat connection between any number of local clients.

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod fetch;
pub mod history;
pub mod multiplexer;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub mod service;
pub mod store;
pub mod transport;

pub use codec::{JsonCodec, WireCodec};
pub use error::MuxError;
pub use fetch::{FileFetcher, HttpFileFetcher, MissingFileFetcher};
pub use multiplexer::{MuxOptions, Multiplexer, SessionState};
pub use service::{spawn_multiplexer, spawn_multiplexer_with, ClientSession, MultiplexerHandle};
pub use store::{EphemeralStore, MessageStore};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
