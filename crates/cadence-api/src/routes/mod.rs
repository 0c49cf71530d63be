//! HTTP route handlers.

pub mod events;
