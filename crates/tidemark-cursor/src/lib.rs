//! Pure cursor state machine for Tidemark.
//!
//! A [`CursorState`] tracks how far one consumer has read through its stream
//! and which partitions are currently stuck on a failed event. It performs no
//! I/O and holds no clock: every transition is a pure function taking `now`
//! explicitly and returning a new state, which makes the failure-isolation
//! logic exhaustively testable.

pub mod failing;
pub mod state;

pub use failing::{FailingPartitionState, ProcessingFailure, ProcessingResult};
pub use state::CursorState;
