//! In-process message bus for session lifecycle and server push events.
//!
//! The bus is an explicitly constructed object that is cloned into every
//! collaborator needing to publish or observe events. Delivery is
//! fire-and-forget: every handler runs as its own task and a failing or
//! panicking handler never affects other handlers or the publisher.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod debounce;
pub mod topics;

pub use bus::{Handler, HandlerResult, MessageBus, SubscriptionToken};
pub use debounce::Debouncer;
