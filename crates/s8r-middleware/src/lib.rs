//! `s8r-middleware` – Event Delivery
//!
//! Carries domain events from the kernel to whoever is listening, without
//! caring what the events mean.
//!
//! # Modules
//!
//! - [`publisher`] – [`EventPublisher`]: the kernel's
//!   [`EventSink`][s8r_types::EventSink], with bounded per-subject queues and
//!   an async dispatch loop.
//! - [`subscriber`] – the [`EventSubscriber`] port plus two ready-made
//!   subscribers: [`LoggingSubscriber`] and [`ChannelSubscriber`].

pub mod publisher;
pub mod subscriber;

pub use publisher::{EventPublisher, PublisherConfig};
pub use subscriber::{ChannelSubscriber, EventSubscriber, LoggingSubscriber, SubscriberError};
