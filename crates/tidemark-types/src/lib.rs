//! Foundation types for Tidemark.
//!
//! This crate provides the identity, position, and event types used
//! throughout the Tidemark runtime. Every other Tidemark crate depends on
//! `tidemark-types`.
//!
//! # Key Types
//!
//! - [`ProcessorId`] — one logical consumer of one stream
//! - [`ProcessingPosition`] — (stream, event log) read-position pair
//! - [`PartitionKey`] — opaque grouping key for per-partition retry isolation
//! - [`CommittedEvent`] / [`StreamEvent`] — events in the log and in derived streams
//! - [`ConsumerDefinition`] — the registered shape of a consumer

pub mod definition;
pub mod error;
pub mod event;
pub mod identity;
pub mod position;

pub use definition::{ConsumerDefinition, FilterSpec};
pub use error::TypeError;
pub use event::{CommittedEvent, StreamEvent};
pub use identity::{
    ConsumerId, ConsumerKind, EventTypeId, MicroserviceId, ProcessorId, ScopeId, StreamId,
    TenantId,
};
pub use position::{EventLogPosition, PartitionKey, ProcessingPosition, StreamPosition};
