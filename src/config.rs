use std::env;
use std::time::Duration;
use url::Url;

const DEFAULT_GATEWAY_API_URL: &str = "https://api.paygate.to";
const DEFAULT_GATEWAY_CHECKOUT_URL: &str = "https://checkout.paygate.to";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_ORDER_TTL_SECS: i64 = 3600;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RATE_LIMIT_RPM: u64 = 120;

#[derive(Clone)]
pub struct CheckoutConfig {
    /// Merchant wallet the gateway forwards settled funds to.
    pub wallet_address: String,
    /// Public base URL of this broker, used to build callback URLs.
    pub public_base_url: String,
    /// Payment gateway API base.
    pub gateway_api_url: String,
    /// Hosted checkout base the buyer is redirected to.
    pub gateway_checkout_url: String,
    /// Bound on every gateway round trip.
    pub gateway_timeout: Duration,
    /// Order validity window.
    pub order_ttl: chrono::Duration,
    /// Expiry sweep cadence.
    pub sweep_interval: Duration,
    /// Server port.
    pub port: u16,
    /// CORS allowed origins (empty = localhost-only dev default).
    pub allowed_origins: Vec<String>,
    /// Rate limit requests per minute per IP.
    pub rate_limit_rpm: u64,
    /// Notification sink URLs.
    pub webhook_urls: Vec<String>,
    /// Key for signing notification payloads (None = unsigned).
    pub webhook_hmac_secret: Option<Vec<u8>>,
    /// Pre-shared admin credential (None = admin endpoint disabled).
    pub admin_key: Option<String>,
    /// Bearer token for /metrics (None = default-deny).
    pub metrics_token: Option<String>,
    /// Serve /metrics without a token. Explicit opt-in, off by default.
    pub public_metrics: bool,
    /// Storefront page the callback redirects to on success (None = JSON).
    pub success_redirect_url: Option<String>,
}

impl std::fmt::Debug for CheckoutConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutConfig")
            .field("wallet_address", &self.wallet_address)
            .field("public_base_url", &self.public_base_url)
            .field("gateway_api_url", &self.gateway_api_url)
            .field("gateway_checkout_url", &self.gateway_checkout_url)
            .field("gateway_timeout", &self.gateway_timeout)
            .field("order_ttl", &self.order_ttl)
            .field("sweep_interval", &self.sweep_interval)
            .field("port", &self.port)
            .field("allowed_origins", &self.allowed_origins)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("webhook_urls", &self.webhook_urls)
            .field(
                "webhook_hmac_secret",
                &self.webhook_hmac_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("admin_key", &self.admin_key.as_ref().map(|_| "[REDACTED]"))
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("public_metrics", &self.public_metrics)
            .field("success_redirect_url", &self.success_redirect_url)
            .finish()
    }
}

impl CheckoutConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let wallet_address = env::var("WALLET_ADDRESS")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingRequired("WALLET_ADDRESS"))?;

        let public_base_url = env::var("PUBLIC_BASE_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingRequired("PUBLIC_BASE_URL"))?;
        Url::parse(&public_base_url)
            .map_err(|_| ConfigError::InvalidUrl(public_base_url.clone()))?;

        let gateway_api_url =
            env::var("GATEWAY_API_URL").unwrap_or_else(|_| DEFAULT_GATEWAY_API_URL.to_string());
        Url::parse(&gateway_api_url)
            .map_err(|_| ConfigError::InvalidUrl(gateway_api_url.clone()))?;

        let gateway_checkout_url = env::var("GATEWAY_CHECKOUT_URL")
            .unwrap_or_else(|_| DEFAULT_GATEWAY_CHECKOUT_URL.to_string());
        Url::parse(&gateway_checkout_url)
            .map_err(|_| ConfigError::InvalidUrl(gateway_checkout_url.clone()))?;

        let gateway_timeout = Duration::from_secs(
            env::var("GATEWAY_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_GATEWAY_TIMEOUT_SECS),
        );

        let order_ttl_secs: i64 = env::var("ORDER_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_ORDER_TTL_SECS);
        if order_ttl_secs <= 0 {
            return Err(ConfigError::InvalidValue("ORDER_TTL_SECS must be positive"));
        }

        let sweep_interval = Duration::from_secs(
            env::var("SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&s| s > 0)
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        );

        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let allowed_origins: Vec<String> = env::var("ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if allowed_origins.iter().any(|o| o == "*") {
            return Err(ConfigError::InvalidValue(
                "wildcard CORS origin '*' is not allowed",
            ));
        }

        let rate_limit_rpm = env::var("RATE_LIMIT_RPM")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_RPM);

        let webhook_urls: Vec<String> = env::var("WEBHOOK_URLS")
            .ok()
            .map(|urls| {
                urls.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        for url in &webhook_urls {
            Url::parse(url).map_err(|_| ConfigError::InvalidUrl(url.clone()))?;
        }

        let webhook_hmac_secret = env::var("WEBHOOK_HMAC_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| s.into_bytes());

        let admin_key = env::var("ADMIN_API_KEY").ok().filter(|s| !s.is_empty());
        match &admin_key {
            Some(key) if key.len() < 32 => {
                tracing::warn!(
                    "ADMIN_API_KEY is only {} chars (minimum 32 recommended) — \
                     use `openssl rand -hex 32` to generate a secure credential",
                    key.len()
                );
            }
            Some(_) => {}
            None => {
                tracing::warn!("ADMIN_API_KEY not set — admin endpoint is disabled");
            }
        }

        let metrics_token = env::var("METRICS_TOKEN").ok().filter(|s| !s.is_empty());
        let public_metrics = env::var("PUBLIC_METRICS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        if metrics_token.is_none() && !public_metrics {
            tracing::warn!("METRICS_TOKEN not set — /metrics denies all requests by default");
        }

        let success_redirect_url = env::var("SUCCESS_REDIRECT_URL")
            .ok()
            .filter(|s| !s.is_empty());
        if let Some(url) = &success_redirect_url {
            Url::parse(url).map_err(|_| ConfigError::InvalidUrl(url.clone()))?;
        }

        Ok(Self {
            wallet_address,
            public_base_url,
            gateway_api_url,
            gateway_checkout_url,
            gateway_timeout,
            order_ttl: chrono::Duration::seconds(order_ttl_secs),
            sweep_interval,
            port,
            allowed_origins,
            rate_limit_rpm,
            webhook_urls,
            webhook_hmac_secret,
            admin_key,
            metrics_token,
            public_metrics,
            success_redirect_url,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
}
