//! Storage boundaries for Tidemark.
//!
//! The processing core never talks to a database directly; it goes through
//! the narrow traits in [`traits`]. The [`memory`] module provides in-memory
//! implementations for tests and embedding.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::{InMemoryDefinitionRepository, InMemoryEventLog, InMemoryStateRepository};
pub use traits::{DefinitionRepository, LogReader, StateRepository, StreamWriter};
