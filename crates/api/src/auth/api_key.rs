//! API Key generation and validation

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;
use whatsflow_shared::{ApiKey, RateLimitTier};

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_PREFIX: &str = "wfk_";
const API_KEY_VERSION: &str = "01";

/// Key body: version(2) + uuid(32) + random(32) + signature(16)
const KEY_BODY_LEN: usize = 82;
const PAYLOAD_LEN: usize = 66;

/// API Key manager for generation and validation
#[derive(Clone)]
pub struct ApiKeyManager {
    hmac_secret: Vec<u8>,
}

impl ApiKeyManager {
    pub fn new(secret: &str) -> Self {
        Self {
            hmac_secret: secret.as_bytes().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, ApiKeyError> {
        HmacSha256::new_from_slice(&self.hmac_secret).map_err(|_| ApiKeyError::HmacInitFailed)
    }

    /// Generate a new API key.
    /// Returns (full_key, key_hash, key_prefix)
    pub fn generate_key(&self) -> Result<(String, String, String), ApiKeyError> {
        let key_id = Uuid::new_v4();
        let random_bytes: [u8; 16] = rand::random();
        let random_hex = hex::encode(random_bytes);

        let payload = format!("{}{}{}", API_KEY_VERSION, key_id.simple(), random_hex);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();
        let sig_hex = hex::encode(&signature[..8]);

        let full_key = format!("{}{}{}", API_KEY_PREFIX, payload, sig_hex);
        let key_hash = self.hash_key(&full_key)?;
        let key_prefix = format!("{}{}...", API_KEY_PREFIX, &payload[..12]);

        Ok((full_key, key_hash, key_prefix))
    }

    /// Generate a key and the row that stores it. The full key is only returned here.
    pub fn issue(
        &self,
        business_profile_id: Uuid,
        name: &str,
        tier: RateLimitTier,
        scopes: Vec<String>,
        now: OffsetDateTime,
    ) -> Result<(String, ApiKey), ApiKeyError> {
        let (full_key, key_hash, key_prefix) = self.generate_key()?;
        let record = ApiKey {
            id: Uuid::new_v4(),
            business_profile_id,
            name: name.to_string(),
            key_hash,
            key_prefix,
            rate_limit_tier: tier,
            scopes,
            is_active: true,
            requests_count: 0,
            last_used_at: None,
            created_at: now,
        };
        Ok((full_key, record))
    }

    /// Check format and signature without touching the store
    pub fn validate_key(&self, key: &str) -> Result<bool, ApiKeyError> {
        let Some(key_body) = key.strip_prefix(API_KEY_PREFIX) else {
            return Ok(false);
        };
        if key_body.len() != KEY_BODY_LEN || !key_body.is_ascii() {
            return Ok(false);
        }

        let payload = &key_body[..PAYLOAD_LEN];
        let provided_sig = &key_body[PAYLOAD_LEN..];

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let expected_sig = mac.finalize().into_bytes();
        let expected_sig_hex = hex::encode(&expected_sig[..8]);

        Ok(constant_time_compare(provided_sig, &expected_sig_hex))
    }

    /// Keyed hash stored in `api_keys.key_hash`
    pub fn hash_key(&self, key: &str) -> Result<String, ApiKeyError> {
        let mut mac = self.mac()?;
        mac.update(key.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Constant-time comparison
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        let dummy = vec![0u8; a.len()];
        let _ = a.as_bytes().ct_eq(&dummy);
        return false;
    }

    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[derive(Debug, thiserror::Error)]
pub enum ApiKeyError {
    #[error("HMAC initialization failed")]
    HmacInitFailed,
}
