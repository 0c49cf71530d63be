//! Core domain types for the cadence scheduled event orchestrator.
//!
//! This crate holds the entities shared by every component of the delivery
//! pipeline:
//!
//! - [`ScheduledEvent`]: the central entity, a delivery unit with a lease
//! - [`EventStatus`] / [`DeliveryType`]: the state machine and channel enums
//! - [`EventId`] / [`MessageId`]: strongly-typed identifiers
//! - [`error::Error`]: the core error type
//! - [`observability`]: logging initialization shared by all binaries

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod error;
pub mod event;
pub mod id;
pub mod observability;

pub use error::{Error, Result};
pub use event::{DeliveryType, EventStatus, ScheduledEvent, MAX_ERROR_LEN};
pub use id::{EventId, MessageId};
