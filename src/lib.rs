//! Starguard - Starboard Admission Control
//!
//! This crate implements the rate limiting that sits in front of a starboard
//! chat bot: approximate sliding-window counters, keyed registries of those
//! counters with generational eviction, and the per-guild, per-channel and
//! per-user throttles built on top of them.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod replay;
pub mod throttle;
