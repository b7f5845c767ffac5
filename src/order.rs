//! The central order entity and its state machine.
//!
//! An [`Order`] is created by the storefront, bound to a payment-gateway
//! deposit address when payment is initiated, and finalized exactly once by
//! the callback verifier. All mutation goes through
//! [`crate::service::CheckoutService`]; nothing else touches an order.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an order.
///
/// Transitions are one-directional: `Created -> Initiated -> Verified`
/// or `Created -> Initiated -> Rejected`. Expiry is not a stored state —
/// an order past its `expires_at` reads as absent (see [`crate::store`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    /// Order registered, no deposit address yet.
    Created,
    /// Deposit address and IPN token assigned by the gateway.
    Initiated,
    /// Payment corroborated by the gateway; terminal.
    Verified,
    /// Amount or address mismatch during verification; terminal.
    Rejected,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Created => "created",
            OrderState::Initiated => "initiated",
            OrderState::Verified => "verified",
            OrderState::Rejected => "rejected",
        }
    }
}

/// Customer contact/shipping payload. Opaque to the lifecycle logic: it is
/// presence-validated at creation and passed through to the notification
/// sink, nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetails {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub street: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apartment: Option<String>,
    pub city: String,
    pub state: String,
    pub postal: String,
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_instructions: Option<String>,
}

impl OrderDetails {
    /// Multi-line shipping address, the shape the notification sink expects.
    pub fn formatted_address(&self) -> String {
        let mut lines = vec![self.street.clone()];
        if let Some(apartment) = &self.apartment {
            lines.push(format!("Apt/Unit: {apartment}"));
        }
        lines.push(format!("{}, {} {}", self.city, self.state, self.postal));
        lines.push(self.country.clone());
        lines.join("\n")
    }
}

/// An in-flight checkout order.
#[derive(Clone)]
pub struct Order {
    pub id: Uuid,
    /// Capability secret returned once at creation. Compared in constant
    /// time on every access, never logged.
    pub token: String,
    pub details: OrderDetails,
    /// Agreed payment total, fixed at creation. Verification compares the
    /// gateway-reported paid amount against this, never the reverse.
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Deposit address assigned by the gateway; set at most once.
    pub gateway_address: Option<String>,
    /// Gateway-issued secret for querying authoritative payment status;
    /// set at most once, never exposed.
    pub ipn_token: Option<String>,
    /// Outbound transaction id, set only on verified completion.
    pub transaction_id: Option<String>,
    pub state: OrderState,
}

impl Order {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

// Manual Debug: the order token and IPN token are secrets and must not end
// up in log output.
impl std::fmt::Debug for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Order")
            .field("id", &self.id)
            .field("token", &"[REDACTED]")
            .field("amount", &self.amount)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("gateway_address", &self.gateway_address)
            .field("ipn_token", &self.ipn_token.as_ref().map(|_| "[REDACTED]"))
            .field("transaction_id", &self.transaction_id)
            .field("state", &self.state)
            .finish()
    }
}
