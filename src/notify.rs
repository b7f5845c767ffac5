//! Downstream order notifications with at-most-once dedupe.
//!
//! Each notifiable event carries a dedupe key (order id + terminal state,
//! not network-layer identity). The key is claimed atomically before any
//! delivery attempt, so a concurrent duplicate can never pass the gate
//! twice. Delivery itself is fire-and-forget: sink failures are logged and
//! swallowed, never surfaced to the HTTP operation that triggered them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload posted to each configured webhook URL when an order completes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderNotification {
    pub event: String,
    pub order_id: String,
    pub customer: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub shipping_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_instructions: Option<String>,
    pub amount: String,
    pub transaction_id: String,
    pub timestamp: i64,
}

/// At-most-once notification dispatcher.
pub struct NotificationDispatcher {
    http: reqwest::Client,
    webhook_urls: Vec<String>,
    /// Signs outbound payloads with `X-Webhook-Signature` when set.
    hmac_key: Option<Vec<u8>>,
    seen: DashMap<String, ()>,
}

impl NotificationDispatcher {
    pub fn new(webhook_urls: Vec<String>, hmac_key: Option<Vec<u8>>) -> Self {
        for url in &webhook_urls {
            if !url.starts_with("https://") {
                tracing::warn!(
                    url = %url,
                    "notification webhook does not use HTTPS — payloads will be sent in cleartext"
                );
            }
        }
        Self {
            http: reqwest::Client::new(),
            webhook_urls,
            hmac_key,
            seen: DashMap::new(),
        }
    }

    /// Fire the notification unless `dedupe_key` has already been claimed.
    /// Returns `true` if this call won the claim (and delivery was
    /// attempted), `false` on a duplicate.
    pub fn notify_once(&self, dedupe_key: &str, payload: OrderNotification) -> bool {
        // Claim the key before any side effect; the entry API is atomic.
        match self.seen.entry(dedupe_key.to_string()) {
            Entry::Occupied(_) => {
                tracing::debug!(key = %dedupe_key, "duplicate notification suppressed");
                return false;
            }
            Entry::Vacant(v) => {
                v.insert(());
            }
        }

        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize notification payload");
                return true;
            }
        };

        for url in &self.webhook_urls {
            let client = self.http.clone();
            let url = url.clone();
            let body = body.clone();
            let signature = self.hmac_key.as_deref().map(|key| sign_payload(key, &body));

            tokio::spawn(async move {
                let mut req = client
                    .post(&url)
                    .header("content-type", "application/json")
                    .timeout(DELIVERY_TIMEOUT);
                if let Some(ref sig) = signature {
                    req = req.header("X-Webhook-Signature", sig.as_str());
                }
                match req.body(body).send().await {
                    Ok(resp) => {
                        tracing::debug!(url = %url, status = %resp.status(), "notification delivered")
                    }
                    Err(e) => {
                        tracing::warn!(url = %url, error = %e, "notification delivery failed")
                    }
                }
            });
        }
        true
    }

    /// Release a dedupe key once its order has been reclaimed, so the set
    /// does not grow for the life of the process.
    pub fn forget(&self, dedupe_key: &str) {
        self.seen.remove(dedupe_key);
    }

    /// Whether a dedupe key has already been claimed.
    pub fn has_fired(&self, dedupe_key: &str) -> bool {
        self.seen.contains_key(dedupe_key)
    }

    /// Number of distinct events fired so far.
    pub fn fired_count(&self) -> usize {
        self.seen.len()
    }
}

/// Hex-encoded HMAC-SHA256 over the notification body.
pub fn sign_payload(key: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(body);
    mac.finalize()
        .into_bytes()
        .iter()
        .fold(String::new(), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{b:02x}");
            s
        })
}
