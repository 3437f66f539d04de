//! The Tidemark processing core.
//!
//! A [`StreamProcessor`] drives one consumer over one source stream: retry
//! due failing partitions, evaluate the frontier event, persist the cursor,
//! write included events to the consumer's target stream. The
//! [`ProcessorRegistry`] enforces one active processor per consumer and
//! validates re-registrations, and [`serve_consumer_connection`] ties a
//! duplex consumer connection to a running processor.

pub mod consumer;
pub mod error;
pub mod processor;
pub mod registry;
pub mod service;
mod validation;

pub use consumer::{ConsumerResponse, CorrelatorConsumer, EventConsumer};
pub use error::{ProcessorError, ProcessorResult, RegistrationError};
pub use processor::{ProcessorConfig, StreamProcessor};
pub use registry::{ProcessorHandle, ProcessorRegistry};
pub use service::{serve_consumer_connection, ProcessorDeps};
