//! Checkout broker between a storefront, a crypto payment gateway, and a
//! notification sink.
//!
//! The core is the order lifecycle and payment-verification state machine:
//! unguessable order tokens, a deposit address registered with the gateway
//! per order, callback validation against the gateway's own record, and
//! exactly one downstream notification per completed order.
//!
//! # Three-party model
//!
//! - **Storefront** — creates orders and polls their status, holding only
//!   the order token as a capability
//! - **Gateway** ([`PaygateClient`]) — assigns deposit addresses and is the
//!   authoritative source for payment status
//! - **Notification sink** — receives one signed webhook per verified order
//!
//! Callback query parameters are treated as untrusted hints: an order is
//! finalized only when the gateway's record, queried through the privately
//! held IPN token, agrees on status and amount.

pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod notify;
pub mod order;
pub mod routes;
pub mod service;
pub mod state;
pub mod store;
pub mod token;

pub use config::CheckoutConfig;
pub use error::CheckoutError;
pub use gateway::{PaygateClient, PaymentGateway};
pub use notify::NotificationDispatcher;
pub use order::{Order, OrderState};
pub use service::CheckoutService;
pub use state::AppState;
pub use store::{InMemoryOrderStore, OrderStore};
