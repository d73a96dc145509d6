#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! WhatsFlow API Server
//!
//! HTTP surface of the billing engine: plan catalog, tenant subscription
//! management, the PayHere notify URL, platform admin overrides, and the
//! rate-limited public API that integrations use for enforcement checks.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
