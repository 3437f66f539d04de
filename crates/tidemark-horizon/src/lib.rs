//! Event-horizon subscriptions for Tidemark.
//!
//! A [`Subscription`] keeps one producer's public stream flowing into the
//! subscriber: connect from the persisted cursor position, drain received
//! events into a bounded [`EventBuffer`], and run a processor over them.
//! Disconnects reconnect with jittered backoff and resume from wherever the
//! cursor is, so no event is lost or skipped across connection churn.

pub mod backoff;
pub mod buffer;
pub mod connector;
pub mod error;
pub mod subscription;

pub use backoff::{Backoff, BackoffConfig};
pub use buffer::EventBuffer;
pub use connector::{Consent, HorizonConnection, HorizonConnector, SubscriptionId};
pub use error::{HorizonError, HorizonResult};
pub use subscription::{ProcessorFactory, Subscription, SubscriptionConfig, SubscriptionState};
