//! Authentication module

pub mod api_key;
pub mod jwt;
pub mod middleware;

pub use api_key::ApiKeyManager;
pub use jwt::{Claims, JwtManager, TokenType};
pub use middleware::{require_admin, require_api_key, require_auth, ApiClient, AuthUser};
