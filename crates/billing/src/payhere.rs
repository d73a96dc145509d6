//! PayHere hosted checkout and notification signing
//!
//! Both directions use the same two-stage construction:
//! `UPPER(MD5(merchant_id + order_id + amount + currency [+ status_code] + UPPER(MD5(secret))))`.

use md5::{Digest, Md5};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::config::PayHereConfig;

const ORDER_SUFFIX_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Prefix of a recurring subscription order
pub const SUBSCRIPTION_ORDER_PREFIX: &str = "SUB";
/// Prefix of a one-time payment order
pub const ONE_TIME_ORDER_PREFIX: &str = "PAY";

fn md5_upper(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize()).to_uppercase()
}

/// Hash authorizing a redirect to the hosted checkout
pub fn checkout_hash(
    merchant_id: &str,
    order_id: &str,
    amount: &str,
    currency: &str,
    merchant_secret: &str,
) -> String {
    let hashed_secret = md5_upper(merchant_secret);
    md5_upper(&format!(
        "{}{}{}{}{}",
        merchant_id, order_id, amount, currency, hashed_secret
    ))
}

/// Signature the gateway puts in `md5sig`
pub fn notification_hash(
    merchant_id: &str,
    order_id: &str,
    amount: &str,
    currency: &str,
    status_code: &str,
    merchant_secret: &str,
) -> String {
    let hashed_secret = md5_upper(merchant_secret);
    md5_upper(&format!(
        "{}{}{}{}{}{}",
        merchant_id, order_id, amount, currency, status_code, hashed_secret
    ))
}

/// Check `md5sig` against a locally computed signature in constant time
pub fn verify_notification(notification: &PayHereNotification, merchant_secret: &str) -> bool {
    let local = notification_hash(
        &notification.merchant_id,
        &notification.order_id,
        &notification.payhere_amount,
        &notification.payhere_currency,
        &notification.status_code,
        merchant_secret,
    );
    let received = notification.md5sig.trim();
    local.len() == received.len() && bool::from(local.as_bytes().ct_eq(received.as_bytes()))
}

/// Render minor units as the two-decimal string the gateway expects
pub fn format_amount(minor_units: i64) -> String {
    let sign = if minor_units < 0 { "-" } else { "" };
    let abs = minor_units.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Parse a gateway amount such as `"2900.00"` into minor units
pub fn parse_amount(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let (whole, frac) = match raw.split_once('.') {
        Some((w, f)) => (w, f),
        None => (raw, ""),
    };
    if frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    let frac: i64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<2}", frac).parse().ok()?
    };
    whole.checked_mul(100)?.checked_add(frac)
}

/// `{prefix}-{unix millis}-{6 random base36 chars}`
pub fn generate_order_id(prefix: &str, now: OffsetDateTime) -> String {
    let millis = now.unix_timestamp_nanos() / 1_000_000;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| ORDER_SUFFIX_ALPHABET[rng.gen_range(0..ORDER_SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}-{}", prefix, millis, suffix)
}

pub fn is_subscription_order(order_id: &str) -> bool {
    order_id.starts_with("SUB-")
}

/// Payment outcome reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Succeeded,
    Pending,
    Canceled,
    Failed,
    Chargedback,
}

impl GatewayStatus {
    /// `2` succeeded, `0` pending, `-1` canceled, `-2` failed, `-3` chargedback.
    /// Unknown codes are treated as failures.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "2" => Self::Succeeded,
            "0" => Self::Pending,
            "-1" => Self::Canceled,
            "-2" => Self::Failed,
            "-3" => Self::Chargedback,
            _ => Self::Failed,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Succeeded => "Payment successful",
            Self::Pending => "Payment pending",
            Self::Canceled => "Payment canceled",
            Self::Failed => "Payment failed",
            Self::Chargedback => "Payment chargedback",
        }
    }
}

impl std::fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Pending => "pending",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
            Self::Chargedback => "chargedback",
        };
        f.write_str(s)
    }
}

/// Server-to-server notification posted to the notify URL
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PayHereNotification {
    pub merchant_id: String,
    pub order_id: String,
    #[serde(default)]
    pub payment_id: Option<String>,
    pub payhere_amount: String,
    pub payhere_currency: String,
    #[serde(deserialize_with = "string_or_number")]
    pub status_code: String,
    pub md5sig: String,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub custom_1: Option<String>,
    #[serde(default)]
    pub custom_2: Option<String>,
    /// Gateway subscription id on recurring notifications
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub item_recurrence: Option<String>,
    #[serde(default)]
    pub card_holder_name: Option<String>,
    #[serde(default)]
    pub card_no: Option<String>,
}

impl PayHereNotification {
    pub fn status(&self) -> GatewayStatus {
        GatewayStatus::from_code(&self.status_code)
    }

    /// Installment notifications reuse the order id, so each charge is keyed by its payment id
    pub fn is_recurring_installment(&self) -> bool {
        self.message_type
            .as_deref()
            .is_some_and(|t| t.starts_with("RECURRING_INSTALLMENT"))
    }

    /// Key that identifies this charge in the payments table
    pub fn idempotency_key(&self) -> String {
        match (&self.payment_id, self.is_recurring_installment()) {
            (Some(payment_id), true) if !payment_id.is_empty() => {
                format!("{}:{}", self.order_id, payment_id)
            }
            _ => self.order_id.clone(),
        }
    }

    pub fn amount_minor(&self) -> Option<i64> {
        parse_amount(&self.payhere_amount)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(i) => i.to_string(),
    })
}

/// Customer fields shown on the hosted checkout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerDetails {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default = "default_country")]
    pub country: String,
}

fn default_country() -> String {
    "Sri Lanka".to_string()
}

impl CustomerDetails {
    /// Split a display name into first and last name
    pub fn from_full_name(full_name: &str, email: &str) -> Self {
        let mut parts = full_name.split_whitespace();
        let first = parts.next().unwrap_or_default().to_string();
        let rest: Vec<&str> = parts.collect();
        let last = if rest.is_empty() {
            first.clone()
        } else {
            rest.join(" ")
        };
        Self {
            first_name: first,
            last_name: last,
            email: email.to_string(),
            country: default_country(),
            ..Default::default()
        }
    }
}

/// Form fields for a redirect to the hosted checkout
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutPayload {
    pub checkout_url: String,
    pub merchant_id: String,
    pub return_url: String,
    pub cancel_url: String,
    pub notify_url: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub city: String,
    pub country: String,
    pub order_id: String,
    pub items: String,
    pub currency: String,
    pub amount: String,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// Tenant id, echoed back in notifications
    pub custom_1: String,
}

/// What is being sold
#[derive(Debug, Clone)]
pub struct CheckoutItem {
    pub order_id: String,
    pub description: String,
    pub amount: i64,
    pub currency: String,
    /// Recurrence such as `1 Month`; `None` for one-time payments
    pub recurrence: Option<String>,
}

pub fn build_checkout(
    config: &PayHereConfig,
    customer: &CustomerDetails,
    item: &CheckoutItem,
    user_id: uuid::Uuid,
) -> CheckoutPayload {
    let amount = format_amount(item.amount);
    let hash = checkout_hash(
        &config.merchant_id,
        &item.order_id,
        &amount,
        &item.currency,
        &config.merchant_secret,
    );

    CheckoutPayload {
        checkout_url: config.checkout_url().to_string(),
        merchant_id: config.merchant_id.clone(),
        return_url: config.return_url.clone(),
        cancel_url: config.cancel_url.clone(),
        notify_url: config.notify_url.clone(),
        first_name: customer.first_name.clone(),
        last_name: customer.last_name.clone(),
        email: customer.email.clone(),
        phone: customer.phone.clone(),
        address: customer.address.clone(),
        city: customer.city.clone(),
        country: customer.country.clone(),
        order_id: item.order_id.clone(),
        items: item.description.clone(),
        currency: item.currency.clone(),
        amount,
        hash,
        duration: item.recurrence.as_ref().map(|_| "Forever".to_string()),
        recurrence: item.recurrence.clone(),
        custom_1: user_id.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Notification signed with `secret`, as the gateway would send it
    pub fn signed_notification(
        merchant_id: &str,
        order_id: &str,
        amount: i64,
        status_code: &str,
        secret: &str,
    ) -> PayHereNotification {
        let amount = format_amount(amount);
        PayHereNotification {
            merchant_id: merchant_id.to_string(),
            order_id: order_id.to_string(),
            payment_id: Some("320025071278".to_string()),
            md5sig: notification_hash(merchant_id, order_id, &amount, "LKR", status_code, secret),
            payhere_amount: amount,
            payhere_currency: "LKR".to_string(),
            status_code: status_code.to_string(),
            ..Default::default()
        }
    }
}
