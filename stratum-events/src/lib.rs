//! Stratum Events - Invalidation Channel
//!
//! Keeps process-local caches of separate processes eventually consistent.
//! A process that mutates its local cache pushes an invalidation through its
//! [`Updater`]; every other process sharing the channel receives it on the
//! updater's [`EventBus`] and applies it to its own local cache.
//!
//! # Key Types
//!
//! - [`Updater`]: the broadcaster contract (`push_update`, `push_removal`,
//!   `push_clear`, `event_bus`)
//! - [`EventBus`] / [`CollectionEvents`]: local publish/subscribe, filtered by
//!   collection
//! - [`InvalidationMessage`]: sender-tagged wire envelope
//! - [`BroadcastHub`] / [`HubUpdater`]: in-process channel backend
//!
//! Delivery is best effort: messages from one sender arrive in send order,
//! nothing is retried, and a receiver never applies its own messages.

mod bus;
mod hub;
mod message;
mod updater;

pub use bus::{CollectionEvents, Delivery, EventBus};
pub use hub::{BroadcastHub, HubUpdater};
pub use message::{EventKind, InvalidationEvent, InvalidationMessage, MessageKind};
pub use updater::Updater;
