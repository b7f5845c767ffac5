//! Payment-gateway adapter.
//!
//! The gateway (Paygate) is the second source of truth for payment
//! verification: callback query parameters are attacker-controllable, so
//! the lifecycle service never finalizes on them alone. It registers a
//! deposit address up front, keeps the returned IPN token private, and
//! later asks the gateway's own record whether that deposit was paid.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::error::CheckoutError;

/// One-time deposit address plus the private status-query token the
/// gateway issued for it.
#[derive(Debug, Clone)]
pub struct DepositRegistration {
    pub deposit_address: String,
    pub ipn_token: String,
}

/// The gateway's authoritative record for a deposit.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentStatusReport {
    /// "paid", "pending", "failed", ...
    pub status: String,
    /// Amount actually received, gateway-reported.
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub value_coin: Option<Decimal>,
    /// Settlement currency.
    #[serde(default)]
    pub coin: Option<String>,
}

impl PaymentStatusReport {
    pub fn is_paid(&self) -> bool {
        self.status == "paid"
    }
}

/// External payment-gateway interface.
///
/// Object-safe so the lifecycle service can hold `Arc<dyn PaymentGateway>`
/// and tests can substitute a scripted double.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Ask the gateway for a one-time deposit address tied to `callback_url`.
    /// Any transport failure or non-2xx must surface as
    /// [`CheckoutError::GatewayUnavailable`], never as silent success.
    async fn register_deposit(
        &self,
        callback_url: &str,
    ) -> Result<DepositRegistration, CheckoutError>;

    /// Query the gateway's own payment record via the privately held IPN
    /// token.
    async fn query_status(&self, ipn_token: &str) -> Result<PaymentStatusReport, CheckoutError>;

    /// Hosted-checkout URL the buyer is redirected to.
    fn payment_url(&self, deposit_address: &str, amount: Decimal, email: &str) -> String;
}

/// Paygate wire response for `wallet.php`.
#[derive(Debug, Deserialize)]
struct WalletResponse {
    address_in: String,
    ipn_token: String,
}

/// reqwest-backed Paygate client.
pub struct PaygateClient {
    http: reqwest::Client,
    api_url: String,
    checkout_url: String,
    wallet_address: String,
    timeout: Duration,
}

impl PaygateClient {
    pub fn new(
        api_url: String,
        checkout_url: String,
        wallet_address: String,
        timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            checkout_url: checkout_url.trim_end_matches('/').to_string(),
            wallet_address,
            timeout,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        what: &str,
    ) -> Result<T, CheckoutError> {
        let resp = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| CheckoutError::GatewayUnavailable(format!("{what} request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(CheckoutError::GatewayUnavailable(format!(
                "{what} returned status {}",
                resp.status()
            )));
        }

        resp.json::<T>()
            .await
            .map_err(|e| CheckoutError::GatewayUnavailable(format!("{what} parse failed: {e}")))
    }
}

#[async_trait]
impl PaymentGateway for PaygateClient {
    async fn register_deposit(
        &self,
        callback_url: &str,
    ) -> Result<DepositRegistration, CheckoutError> {
        let url = format!(
            "{}/control/wallet.php?address={}&callback={}",
            self.api_url,
            self.wallet_address,
            urlencoding::encode(callback_url),
        );
        let wallet: WalletResponse = self.get_json(&url, "deposit registration").await?;
        Ok(DepositRegistration {
            deposit_address: wallet.address_in,
            ipn_token: wallet.ipn_token,
        })
    }

    async fn query_status(&self, ipn_token: &str) -> Result<PaymentStatusReport, CheckoutError> {
        let url = format!(
            "{}/control/payment-status.php?ipn_token={}",
            self.api_url,
            urlencoding::encode(ipn_token),
        );
        self.get_json(&url, "payment status").await
    }

    fn payment_url(&self, deposit_address: &str, amount: Decimal, email: &str) -> String {
        format!(
            "{}/process-payment.php?address={}&amount={}&provider=wert&email={}&currency=USD",
            self.checkout_url,
            urlencoding::encode(deposit_address),
            amount,
            urlencoding::encode(email),
        )
    }
}

/// Paygate reports `value_coin` as a string in some responses and a bare
/// number in others; accept both.
fn lenient_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(f64),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Text(s)) => s
            .parse::<Decimal>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(Raw::Number(n)) => Decimal::try_from(n)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
