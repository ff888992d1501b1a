//! Per-message engagement dimensions for email campaigns.
//!
//! A [`dimension::Dimension`] walks one contact's interaction timeline and
//! emits an [`dimension::metric::AggregateRecord`] for every message event:
//! page views, goals and engagement inside the event's time window, plus
//! whether the event was the contact's first open or click of the message.

pub mod config;
pub mod contact;
pub mod dimension;
pub mod export;
pub mod interaction;
pub mod pipeline;
pub mod unique;
