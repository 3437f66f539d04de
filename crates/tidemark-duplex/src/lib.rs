//! Duplex reverse-call engine for Tidemark.
//!
//! A [`DuplexConnection`] owns one consumer connection: it reads the
//! handshake, is accepted or rejected exactly once, and while serving keeps
//! the correlation table that matches concurrent outbound
//! [`Correlator::call`]s to inbound responses by call id. The transport is a
//! channel pair, so any framing/transport layer can sit in front of it.

pub mod correlator;
pub mod error;

pub use correlator::{Correlator, DuplexConfig, DuplexConnection};
pub use error::{DuplexError, DuplexResult};
