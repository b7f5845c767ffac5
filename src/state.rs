use std::sync::Arc;

use crate::service::CheckoutService;

/// Shared application state for the HTTP server.
pub struct AppState {
    pub service: Arc<CheckoutService>,
    /// Pre-shared credential for the admin read; None disables the
    /// endpoint (every request gets 401).
    pub admin_key: Option<String>,
    /// Bearer token for /metrics; None denies by default.
    pub metrics_token: Option<String>,
    /// Serve /metrics without a token; explicit opt-in.
    pub public_metrics: bool,
    /// Storefront success page for the callback redirect; None means the
    /// callback answers with JSON instead.
    pub success_redirect_url: Option<String>,
}
