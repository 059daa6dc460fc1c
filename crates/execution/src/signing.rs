//! Root value signing.
//!
//! The engine trusts a root value only when it carries a valid signature.
//! The MAC covers the RFC 8785 canonical JSON of
//! `{subscriptionId, payload, timestampBucket}`, where the bucket is the
//! issuance time in milliseconds divided by the bucket width. Verification
//! additionally requires the issuance time to be inside the validity window.

use crate::error::{Error, Result, SignatureError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Shortest accepted secret, in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// Signs and verifies root values with a shared secret.
#[derive(Clone)]
pub struct RootValueSigner {
    secret: Vec<u8>,
    bucket_ms: i64,
    window_ms: i64,
}

impl std::fmt::Debug for RootValueSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootValueSigner")
            .field("bucket_ms", &self.bucket_ms)
            .field("window_ms", &self.window_ms)
            .finish_non_exhaustive()
    }
}

/// A signed root value for one (subscription, event) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedRootValue {
    pub event_name: String,
    pub subscription_id: String,
    pub payload: Value,
    /// Issuance time, milliseconds since the Unix epoch.
    pub issued_at: i64,
    pub signature: String,
}

impl SignedRootValue {
    /// `{ [eventName]: payload, subscriptionId, issuedAt, signature }`
    pub fn into_root_value(self) -> Value {
        let mut root = Map::new();
        root.insert(self.event_name, self.payload);
        root.insert("subscriptionId".into(), Value::String(self.subscription_id));
        root.insert("issuedAt".into(), Value::from(self.issued_at));
        root.insert("signature".into(), Value::String(self.signature));
        Value::Object(root)
    }
}

impl RootValueSigner {
    pub fn new(secret: impl Into<Vec<u8>>, bucket: Duration, window: Duration) -> Result<Self> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::Signing(format!(
                "secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        let bucket_ms = i64::try_from(bucket.as_millis().max(1))
            .map_err(|_| Error::Signing(format!("bucket {:?} is too long", bucket)))?;
        let window_ms = i64::try_from(window.as_millis())
            .map_err(|_| Error::Signing(format!("window {:?} is too long", window)))?;
        Ok(Self {
            secret,
            bucket_ms,
            window_ms,
        })
    }

    pub fn sign(
        &self,
        event_name: &str,
        subscription_id: &str,
        payload: Value,
    ) -> Result<SignedRootValue> {
        self.sign_at(event_name, subscription_id, payload, Utc::now())
    }

    pub fn sign_at(
        &self,
        event_name: &str,
        subscription_id: &str,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<SignedRootValue> {
        let issued_at = now.timestamp_millis();
        let signature = self.mac(subscription_id, &payload, issued_at)?;
        Ok(SignedRootValue {
            event_name: event_name.to_string(),
            subscription_id: subscription_id.to_string(),
            payload,
            issued_at,
            signature: URL_SAFE_NO_PAD.encode(signature),
        })
    }

    /// Check a root value produced by [`SignedRootValue::into_root_value`].
    pub fn verify(
        &self,
        root_value: &Value,
        event_name: &str,
    ) -> std::result::Result<(), SignatureError> {
        self.verify_at(root_value, event_name, Utc::now())
    }

    pub fn verify_at(
        &self,
        root_value: &Value,
        event_name: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), SignatureError> {
        let payload = root_value
            .get(event_name)
            .ok_or(SignatureError::Missing("payload"))?;
        let subscription_id = root_value
            .get("subscriptionId")
            .ok_or(SignatureError::Missing("subscriptionId"))?
            .as_str()
            .ok_or(SignatureError::Malformed("subscriptionId"))?;
        let issued_at = root_value
            .get("issuedAt")
            .ok_or(SignatureError::Missing("issuedAt"))?
            .as_i64()
            .ok_or(SignatureError::Malformed("issuedAt"))?;
        let signature = root_value
            .get("signature")
            .ok_or(SignatureError::Missing("signature"))?
            .as_str()
            .ok_or(SignatureError::Malformed("signature"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SignatureError::Malformed("signature"))?;

        let age = now
            .timestamp_millis()
            .checked_sub(issued_at)
            .ok_or(SignatureError::Expired)?;
        if age > self.window_ms || age < -self.bucket_ms {
            return Err(SignatureError::Expired);
        }

        self.keyed_mac(subscription_id, payload, issued_at)
            .map_err(|_| SignatureError::Invalid)?
            .verify_slice(&signature)
            .map_err(|_| SignatureError::Invalid)
    }

    fn mac(&self, subscription_id: &str, payload: &Value, issued_at: i64) -> Result<Vec<u8>> {
        let mac = self.keyed_mac(subscription_id, payload, issued_at)?;
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn keyed_mac(
        &self,
        subscription_id: &str,
        payload: &Value,
        issued_at: i64,
    ) -> Result<HmacSha256> {
        let canonical = serde_jcs::to_vec(&json!({
            "subscriptionId": subscription_id,
            "payload": payload,
            "timestampBucket": issued_at.div_euclid(self.bucket_ms),
        }))
        .map_err(|e| Error::Signing(e.to_string()))?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::Signing(e.to_string()))?;
        mac.update(&canonical);
        Ok(mac)
    }
}
