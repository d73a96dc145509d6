#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! WhatsFlow Shared Types and Utilities
//!
//! This crate contains the domain types, counter store, rate limiter and
//! database helpers shared by the api, billing and worker crates.

pub mod clock;
pub mod counter;
pub mod db;
pub mod error;
pub mod rate_limit;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterSnapshot, CounterStore, InMemoryCounterStore, RedisCounterStore};
pub use db::*;
pub use error::*;
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
pub use types::*;
