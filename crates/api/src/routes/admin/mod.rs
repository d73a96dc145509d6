//! Platform admin routes
//!
//! - `plans`: plan catalog management
//! - `accounts`: per-tenant overrides (free status, pause, credits, refunds, audit log)
//! - `api_keys`: issuing public API keys
//!
//! Every route here sits behind `require_auth` and `require_admin`.

pub mod accounts;
pub mod api_keys;
pub mod plans;

pub use accounts::*;
pub use api_keys::*;
pub use plans::*;
