//! Order lifecycle orchestration and the callback verification gates.
//!
//! Four public operations: create order, initiate payment, verify callback,
//! query status (plus the admin read). Every operation re-validates the
//! order token and expiry before touching state — there is no session; the
//! token is the sole capability per request.
//!
//! Callback verification runs under a per-order mutex so the
//! `Initiated -> Verified` transition executes at most once even when a
//! gateway retry races a forged duplicate. A sweep racing a verify at the
//! exact expiry boundary may non-deterministically reject the last-second
//! callback; this is accepted boundary behavior.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CheckoutError;
use crate::gateway::PaymentGateway;
use crate::metrics;
use crate::notify::{NotificationDispatcher, OrderNotification};
use crate::order::{Order, OrderDetails, OrderState};
use crate::store::OrderStore;
use crate::token;

/// Storefront request to open an order. All fields arrive optional so a
/// missing one maps to a 400 with a stable error body instead of a
/// deserialization failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub street: Option<String>,
    pub apartment: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal: Option<String>,
    pub country: Option<String>,
    pub delivery_instructions: Option<String>,
    /// Agreed total, as a string to keep exact decimal semantics.
    pub product_total: Option<String>,
}

impl CreateOrderRequest {
    fn validate(self) -> Result<(OrderDetails, Decimal), CheckoutError> {
        fn required(field: Option<String>) -> Result<String, CheckoutError> {
            match field {
                Some(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(CheckoutError::Validation("Missing required fields".into())),
            }
        }

        let total = required(self.product_total.clone())?;
        let amount: Decimal = total
            .parse()
            .map_err(|_| CheckoutError::Validation("Invalid product total".into()))?;
        if amount <= Decimal::ZERO {
            return Err(CheckoutError::Validation("Invalid product total".into()));
        }

        let details = OrderDetails {
            first_name: required(self.first_name)?,
            last_name: required(self.last_name)?,
            email: required(self.email)?,
            phone: self.phone.filter(|p| !p.trim().is_empty()),
            street: required(self.street)?,
            apartment: self.apartment.filter(|a| !a.trim().is_empty()),
            city: required(self.city)?,
            state: required(self.state)?,
            postal: required(self.postal)?,
            country: required(self.country)?,
            delivery_instructions: self
                .delivery_instructions
                .filter(|d| !d.trim().is_empty()),
        };
        Ok((details, amount))
    }
}

/// Creation response — the only place the order token ever leaves the
/// process.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedOrder {
    pub order_id: Uuid,
    pub order_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInit {
    pub payment_url: String,
    pub status: &'static str,
}

/// Inbound payment-callback query parameters. Attacker-controllable hints;
/// verification never finalizes on these alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub value_coin: Option<String>,
    pub coin: Option<String>,
    pub txid_in: Option<String>,
    pub txid_out: Option<String>,
    pub address_in: Option<String>,
}

struct CompleteCallback {
    txid_out: String,
    address_in: String,
}

impl CallbackParams {
    fn require_complete(&self) -> Result<CompleteCallback, CheckoutError> {
        fn present(field: &Option<String>) -> Result<&str, CheckoutError> {
            match field.as_deref() {
                Some(v) if !v.is_empty() => Ok(v),
                _ => Err(CheckoutError::Validation(
                    "Missing payment verification parameters".into(),
                )),
            }
        }

        // The claimed amount is attacker-controllable and never trusted,
        // but a callback without a parseable one is malformed.
        present(&self.value_coin)?
            .parse::<Decimal>()
            .map_err(|_| {
                CheckoutError::Validation("Missing payment verification parameters".into())
            })?;
        present(&self.coin)?;
        present(&self.txid_in)?;
        let txid_out = present(&self.txid_out)?.to_string();
        let address_in = present(&self.address_in)?.to_string();
        Ok(CompleteCallback {
            txid_out,
            address_in,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackOutcome {
    pub order_id: Uuid,
    pub status: &'static str,
    /// True when this callback was a retry of an already-verified order.
    pub replay: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatus {
    pub status: &'static str,
    pub expires_at: DateTime<Utc>,
}

/// Full admin snapshot of an order. Excludes the order token and the IPN
/// token — those secrets never leave the process after issuance.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminOrderView {
    pub order_id: Uuid,
    pub details: OrderDetails,
    pub product_total: String,
    pub state: OrderState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Orchestration façade over store, gateway and notifier.
pub struct CheckoutService {
    store: Arc<dyn OrderStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<NotificationDispatcher>,
    /// Per-order mutex serializing initiate/verify for the same id.
    order_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    ttl: Duration,
    /// Public base URL the gateway calls back to.
    callback_base_url: String,
}

impl CheckoutService {
    /// Maximum number of concurrent order locks, to bound memory under
    /// callback floods. Idle locks are reclaimed by the sweep.
    const MAX_ORDER_LOCKS: usize = 100_000;

    pub fn new(
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<NotificationDispatcher>,
        ttl: Duration,
        callback_base_url: String,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            order_locks: DashMap::new(),
            ttl,
            callback_base_url: callback_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Register a new order and issue its capability token.
    pub fn create_order(&self, req: CreateOrderRequest) -> Result<CreatedOrder, CheckoutError> {
        let (details, amount) = req.validate().inspect_err(|_| {
            metrics::ORDERS_CREATED.with_label_values(&["invalid"]).inc();
        })?;

        let id = token::new_order_id();
        let order_token = token::new_order_token();
        let now = Utc::now();
        let expires_at = now + self.ttl;

        self.store.insert(Order {
            id,
            token: order_token.clone(),
            details,
            amount,
            created_at: now,
            expires_at,
            gateway_address: None,
            ipn_token: None,
            transaction_id: None,
            state: OrderState::Created,
        });

        metrics::ORDERS_CREATED.with_label_values(&["ok"]).inc();
        tracing::info!(order_id = %id, %expires_at, "order created");
        Ok(CreatedOrder {
            order_id: id,
            order_token,
            expires_at,
        })
    }

    /// Register a deposit address with the gateway and hand back the hosted
    /// checkout URL. `Created -> Initiated`; idempotent for an order that
    /// is already `Initiated` (re-issues the URL without re-registering).
    pub async fn initiate_payment(
        &self,
        id: Uuid,
        order_token: &str,
    ) -> Result<PaymentInit, CheckoutError> {
        let lock = self.order_lock(id)?;
        let _guard = lock.lock().await;

        let order = self.authorize(id, order_token)?;

        match order.state {
            OrderState::Created => {}
            OrderState::Initiated => {
                // Gateway fields are set at most once; a repeat initiation
                // re-issues the URL from the stored deposit address.
                if let Some(address) = &order.gateway_address {
                    return Ok(PaymentInit {
                        payment_url: self.gateway.payment_url(
                            address,
                            order.amount,
                            &order.details.email,
                        ),
                        status: "pending",
                    });
                }
                return Err(CheckoutError::Internal(
                    "initiated order has no deposit address".into(),
                ));
            }
            OrderState::Verified | OrderState::Rejected => {
                return Err(CheckoutError::StateConflict(
                    "payment already finalized for this order".into(),
                ));
            }
        }

        let callback_url = format!("{}/payment-callback/{}", self.callback_base_url, id);
        let registration = self
            .gateway
            .register_deposit(&callback_url)
            .await
            .inspect_err(|_| {
                metrics::PAYMENTS_INITIATED
                    .with_label_values(&["gateway_error"])
                    .inc();
            })?;

        let updated = self.store.update(id, &mut |o| {
            o.gateway_address = Some(registration.deposit_address.clone());
            o.ipn_token = Some(registration.ipn_token.clone());
            o.state = OrderState::Initiated;
        });
        if !updated {
            // Swept between authorization and the gateway round trip.
            return Err(CheckoutError::Unauthorized);
        }

        metrics::PAYMENTS_INITIATED.with_label_values(&["ok"]).inc();
        tracing::info!(order_id = %id, "payment initiated");
        Ok(PaymentInit {
            payment_url: self.gateway.payment_url(
                &registration.deposit_address,
                order.amount,
                &order.details.email,
            ),
            status: "pending",
        })
    }

    /// Validate an inbound payment callback and finalize the order.
    ///
    /// Gates, in order, each rejecting on failure:
    /// 1. order exists and is `Initiated` (terminal states short-circuit),
    /// 2. callback parameters are complete,
    /// 3. the gateway's own record (queried via the private IPN token)
    ///    says `paid`,
    /// 4. gateway-reported amount `>=` the order amount,
    /// 5. callback-claimed address equals the stored deposit address,
    /// 6. set the transaction id, transition to `Verified`, notify once.
    pub async fn handle_callback(
        &self,
        id: Uuid,
        params: CallbackParams,
    ) -> Result<CallbackOutcome, CheckoutError> {
        let lock = self.order_lock(id)?;
        let _guard = lock.lock().await;

        let order = self.store.get(id).ok_or_else(|| {
            metrics::CALLBACKS.with_label_values(&["unknown_order"]).inc();
            CheckoutError::OrderNotFound
        })?;

        match order.state {
            OrderState::Verified => {
                // Gateways retry callbacks; a verified order answers with
                // the same success, no second status query, no second
                // notification.
                metrics::CALLBACKS.with_label_values(&["replay"]).inc();
                return Ok(CallbackOutcome {
                    order_id: id,
                    status: "verified",
                    replay: true,
                });
            }
            OrderState::Rejected => {
                metrics::CALLBACKS.with_label_values(&["rejected_replay"]).inc();
                return Err(CheckoutError::PaymentRejected);
            }
            OrderState::Created => {
                metrics::CALLBACKS.with_label_values(&["premature"]).inc();
                return Err(CheckoutError::StateConflict(
                    "payment was never initiated for this order".into(),
                ));
            }
            OrderState::Initiated => {}
        }

        let callback = params.require_complete().inspect_err(|_| {
            metrics::CALLBACKS.with_label_values(&["malformed"]).inc();
        })?;

        let ipn_token = order.ipn_token.as_deref().ok_or_else(|| {
            CheckoutError::Internal("initiated order missing gateway token".into())
        })?;

        // Second source of truth: the gateway's own record, reached through
        // the token we privately hold — never through caller-supplied data.
        let report = self.gateway.query_status(ipn_token).await.inspect_err(|_| {
            // Transient: state stays Initiated so a retry can succeed.
            metrics::CALLBACKS.with_label_values(&["gateway_error"]).inc();
        })?;

        if !report.is_paid() {
            metrics::CALLBACKS.with_label_values(&["not_paid"]).inc();
            tracing::info!(order_id = %id, status = %report.status, "payment not completed yet");
            return Err(CheckoutError::PaymentNotCompleted);
        }

        let paid_amount = report.value_coin.ok_or_else(|| {
            CheckoutError::GatewayUnavailable("paid status without an amount".into())
        })?;

        // >= tolerates gateway rounding and overpayment; < is never accepted.
        if paid_amount < order.amount {
            self.store
                .update(id, &mut |o| o.state = OrderState::Rejected);
            metrics::CALLBACKS.with_label_values(&["insufficient"]).inc();
            tracing::warn!(
                order_id = %id,
                expected = %order.amount,
                paid = %paid_amount,
                "payment amount insufficient"
            );
            return Err(CheckoutError::InsufficientPayment);
        }

        let expected_address = order.gateway_address.as_deref().ok_or_else(|| {
            CheckoutError::Internal("initiated order missing deposit address".into())
        })?;
        if callback.address_in != expected_address {
            self.store
                .update(id, &mut |o| o.state = OrderState::Rejected);
            metrics::CALLBACKS
                .with_label_values(&["address_mismatch"])
                .inc();
            tracing::warn!(order_id = %id, "callback deposit address mismatch");
            return Err(CheckoutError::AddressMismatch);
        }

        self.store.update(id, &mut |o| {
            o.transaction_id = Some(callback.txid_out.clone());
            o.state = OrderState::Verified;
        });
        metrics::CALLBACKS.with_label_values(&["verified"]).inc();
        tracing::info!(order_id = %id, "payment verified");

        let fired = self.notifier.notify_once(
            &verified_key(id),
            OrderNotification {
                event: "order.verified".into(),
                order_id: id.to_string(),
                customer: format!(
                    "{} {}",
                    order.details.first_name, order.details.last_name
                ),
                email: order.details.email.clone(),
                phone: order.details.phone.clone(),
                shipping_address: order.details.formatted_address(),
                delivery_instructions: order.details.delivery_instructions.clone(),
                amount: order.amount.to_string(),
                transaction_id: callback.txid_out,
                timestamp: Utc::now().timestamp(),
            },
        );
        metrics::NOTIFICATIONS
            .with_label_values(&[if fired { "fired" } else { "deduped" }])
            .inc();

        Ok(CallbackOutcome {
            order_id: id,
            status: "verified",
            replay: false,
        })
    }

    /// Token-gated status read.
    pub fn get_status(&self, id: Uuid, order_token: &str) -> Result<OrderStatus, CheckoutError> {
        let order = self.authorize(id, order_token)?;
        Ok(OrderStatus {
            status: order.state.as_str(),
            expires_at: order.expires_at,
        })
    }

    /// Admin snapshot. Credential checking happens at the route layer; this
    /// only hides expired/unknown orders.
    pub fn admin_order(&self, id: Uuid) -> Result<AdminOrderView, CheckoutError> {
        let order = self.store.get(id).ok_or(CheckoutError::OrderNotFound)?;
        Ok(AdminOrderView {
            order_id: order.id,
            details: order.details,
            product_total: order.amount.to_string(),
            state: order.state,
            gateway_address: order.gateway_address,
            transaction_id: order.transaction_id,
            created_at: order.created_at,
            expires_at: order.expires_at,
        })
    }

    /// Reclaim expired orders, their notification dedupe keys, and idle
    /// per-order locks. Returns the number of orders removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let swept = self.store.sweep_expired(now);
        if !swept.is_empty() {
            metrics::ORDERS_SWEPT
                .with_label_values(&["expired"])
                .inc_by(swept.len() as u64);
            tracing::info!(swept = swept.len(), "reclaimed expired orders");
        }
        // A reclaimed order can never be verified again, so its dedupe key
        // is dead weight.
        for id in &swept {
            self.notifier.forget(&verified_key(*id));
        }

        // Drop locks nobody holds. Checking both the refcount and try_lock
        // prevents a race where a concurrent order_lock() clones the Arc
        // between the check and the removal. Removals are counted inside
        // the predicate; diffing map lengths underflows when concurrent
        // inserts outpace the retain.
        let mut removed = 0;
        self.order_locks.retain(|_, lock| {
            if Arc::strong_count(lock) > 1 || lock.try_lock().is_err() {
                true
            } else {
                removed += 1;
                false
            }
        });
        if removed > 0 {
            tracing::debug!(removed, "cleaned up idle order locks");
        }
        swept.len()
    }

    /// Spawn the periodic expiry sweep on its own schedule, independent of
    /// in-flight requests.
    pub fn start_sweep(self: Arc<Self>, interval: std::time::Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would sweep an empty store.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep(Utc::now());
            }
        });
    }

    fn authorize(&self, id: Uuid, order_token: &str) -> Result<Order, CheckoutError> {
        // Absent, expired and token-mismatch all collapse into Unauthorized
        // so the response does not reveal which order ids exist.
        let order = self.store.get(id).ok_or(CheckoutError::Unauthorized)?;
        if !token::token_matches(order_token, &order.token) {
            return Err(CheckoutError::Unauthorized);
        }
        Ok(order)
    }

    fn order_lock(&self, id: Uuid) -> Result<Arc<Mutex<()>>, CheckoutError> {
        if self.order_locks.len() >= Self::MAX_ORDER_LOCKS && !self.order_locks.contains_key(&id) {
            return Err(CheckoutError::Internal(
                "too many in-flight orders — try again later".into(),
            ));
        }
        Ok(self
            .order_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}

/// Notification dedupe key for a verified order.
fn verified_key(id: Uuid) -> String {
    format!("{id}:verified")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{DepositRegistration, PaymentStatusReport};
    use crate::store::InMemoryOrderStore;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted gateway double. `status` holds what the next query_status
    /// returns; `Err` simulates an unreachable gateway.
    struct MockGateway {
        deposit_address: String,
        register_calls: AtomicUsize,
        query_calls: AtomicUsize,
        status: std::sync::Mutex<Result<PaymentStatusReport, String>>,
    }

    impl MockGateway {
        fn new() -> Self {
            Self {
                deposit_address: "0xdeposit".into(),
                register_calls: AtomicUsize::new(0),
                query_calls: AtomicUsize::new(0),
                status: std::sync::Mutex::new(Ok(report("pending", None))),
            }
        }

        fn set_status(&self, status: Result<PaymentStatusReport, String>) {
            *self.status.lock().unwrap() = status;
        }
    }

    fn report(status: &str, value_coin: Option<Decimal>) -> PaymentStatusReport {
        PaymentStatusReport {
            status: status.into(),
            value_coin,
            coin: Some("USDC".into()),
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn register_deposit(
            &self,
            _callback_url: &str,
        ) -> Result<DepositRegistration, CheckoutError> {
            self.register_calls.fetch_add(1, Ordering::SeqCst);
            Ok(DepositRegistration {
                deposit_address: self.deposit_address.clone(),
                ipn_token: "ipn-secret".into(),
            })
        }

        async fn query_status(
            &self,
            _ipn_token: &str,
        ) -> Result<PaymentStatusReport, CheckoutError> {
            self.query_calls.fetch_add(1, Ordering::SeqCst);
            self.status
                .lock()
                .unwrap()
                .clone()
                .map_err(CheckoutError::GatewayUnavailable)
        }

        fn payment_url(&self, deposit_address: &str, amount: Decimal, _email: &str) -> String {
            format!("https://checkout.test/pay?address={deposit_address}&amount={amount}")
        }
    }

    struct Harness {
        service: Arc<CheckoutService>,
        gateway: Arc<MockGateway>,
        notifier: Arc<NotificationDispatcher>,
    }

    fn harness() -> Harness {
        harness_with_ttl(Duration::hours(1))
    }

    fn harness_with_ttl(ttl: Duration) -> Harness {
        let gateway = Arc::new(MockGateway::new());
        let notifier = Arc::new(NotificationDispatcher::new(vec![], None));
        let service = Arc::new(CheckoutService::new(
            Arc::new(InMemoryOrderStore::new()),
            gateway.clone(),
            notifier.clone(),
            ttl,
            "https://broker.test".into(),
        ));
        Harness {
            service,
            gateway,
            notifier,
        }
    }

    fn valid_request(total: &str) -> CreateOrderRequest {
        CreateOrderRequest {
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            email: Some("ada@example.com".into()),
            phone: None,
            street: Some("12 Analytical Way".into()),
            apartment: None,
            city: Some("London".into()),
            state: Some("LDN".into()),
            postal: Some("E1 6AN".into()),
            country: Some("UK".into()),
            delivery_instructions: None,
            product_total: Some(total.into()),
        }
    }

    fn paid_callback(address: &str) -> CallbackParams {
        CallbackParams {
            value_coin: Some("50.00".into()),
            coin: Some("USDC".into()),
            txid_in: Some("tx-in".into()),
            txid_out: Some("tx-out".into()),
            address_in: Some(address.into()),
        }
    }

    #[test]
    fn create_order_rejects_missing_fields() {
        let h = harness();
        let mut req = valid_request("50.00");
        req.email = None;
        assert!(matches!(
            h.service.create_order(req),
            Err(CheckoutError::Validation(_))
        ));

        assert!(matches!(
            h.service.create_order(valid_request("not-a-number")),
            Err(CheckoutError::Validation(_))
        ));
        assert!(matches!(
            h.service.create_order(valid_request("-1")),
            Err(CheckoutError::Validation(_))
        ));
    }

    #[test]
    fn token_authorizes_only_its_own_order() {
        let h = harness();
        let a = h.service.create_order(valid_request("10")).unwrap();
        let b = h.service.create_order(valid_request("20")).unwrap();

        assert!(h.service.get_status(a.order_id, &a.order_token).is_ok());
        assert!(matches!(
            h.service.get_status(a.order_id, &b.order_token),
            Err(CheckoutError::Unauthorized)
        ));
        assert!(matches!(
            h.service.get_status(b.order_id, &a.order_token),
            Err(CheckoutError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn expired_order_is_rejected_before_the_sweep_runs() {
        let h = harness_with_ttl(Duration::seconds(-1));
        let created = h.service.create_order(valid_request("10")).unwrap();

        assert!(matches!(
            h.service.get_status(created.order_id, &created.order_token),
            Err(CheckoutError::Unauthorized)
        ));
        assert!(matches!(
            h.service
                .initiate_payment(created.order_id, &created.order_token)
                .await,
            Err(CheckoutError::Unauthorized)
        ));
        assert!(matches!(
            h.service
                .handle_callback(created.order_id, paid_callback("0xdeposit"))
                .await,
            Err(CheckoutError::OrderNotFound)
        ));
    }

    #[tokio::test]
    async fn initiate_payment_is_idempotent_for_initiated_orders() {
        let h = harness();
        let created = h.service.create_order(valid_request("50.00")).unwrap();

        let first = h
            .service
            .initiate_payment(created.order_id, &created.order_token)
            .await
            .unwrap();
        let second = h
            .service
            .initiate_payment(created.order_id, &created.order_token)
            .await
            .unwrap();

        assert_eq!(first.payment_url, second.payment_url);
        assert_eq!(h.gateway.register_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_for_uninitiated_order_is_a_state_conflict() {
        let h = harness();
        let created = h.service.create_order(valid_request("50.00")).unwrap();

        assert!(matches!(
            h.service
                .handle_callback(created.order_id, paid_callback("0xdeposit"))
                .await,
            Err(CheckoutError::StateConflict(_))
        ));
        // No state change, no gateway query.
        assert_eq!(h.gateway.query_calls.load(Ordering::SeqCst), 0);
        let status = h
            .service
            .get_status(created.order_id, &created.order_token)
            .unwrap();
        assert_eq!(status.status, "created");
    }

    #[tokio::test]
    async fn malformed_callback_is_rejected_without_a_gateway_query() {
        let h = harness();
        let created = h.service.create_order(valid_request("50.00")).unwrap();
        h.service
            .initiate_payment(created.order_id, &created.order_token)
            .await
            .unwrap();

        let mut params = paid_callback("0xdeposit");
        params.txid_out = None;
        assert!(matches!(
            h.service.handle_callback(created.order_id, params).await,
            Err(CheckoutError::Validation(_))
        ));

        let mut params = paid_callback("0xdeposit");
        params.value_coin = Some("not-a-number".into());
        assert!(matches!(
            h.service.handle_callback(created.order_id, params).await,
            Err(CheckoutError::Validation(_))
        ));
        assert_eq!(h.gateway.query_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pending_then_paid_scenario_verifies_exactly_once() {
        let h = harness();
        let created = h.service.create_order(valid_request("50.00")).unwrap();
        h.service
            .initiate_payment(created.order_id, &created.order_token)
            .await
            .unwrap();

        // Gateway still reports pending: 402, state unchanged.
        assert!(matches!(
            h.service
                .handle_callback(created.order_id, paid_callback("0xdeposit"))
                .await,
            Err(CheckoutError::PaymentNotCompleted)
        ));
        let status = h
            .service
            .get_status(created.order_id, &created.order_token)
            .unwrap();
        assert_eq!(status.status, "initiated");
        assert_eq!(h.notifier.fired_count(), 0);

        // Payment lands.
        h.gateway.set_status(Ok(report("paid", Some(dec!(50.00)))));
        let outcome = h
            .service
            .handle_callback(created.order_id, paid_callback("0xdeposit"))
            .await
            .unwrap();
        assert!(!outcome.replay);
        assert_eq!(outcome.status, "verified");
        assert_eq!(h.notifier.fired_count(), 1);

        let queries_after_verify = h.gateway.query_calls.load(Ordering::SeqCst);

        // Replay: same success, no second query, no second notification.
        let replay = h
            .service
            .handle_callback(created.order_id, paid_callback("0xdeposit"))
            .await
            .unwrap();
        assert!(replay.replay);
        assert_eq!(replay.status, "verified");
        assert_eq!(
            h.gateway.query_calls.load(Ordering::SeqCst),
            queries_after_verify
        );
        assert_eq!(h.notifier.fired_count(), 1);

        let status = h
            .service
            .get_status(created.order_id, &created.order_token)
            .unwrap();
        assert_eq!(status.status, "verified");
    }

    #[tokio::test]
    async fn underpayment_rejects_and_is_terminal() {
        let h = harness();
        let created = h.service.create_order(valid_request("50.00")).unwrap();
        h.service
            .initiate_payment(created.order_id, &created.order_token)
            .await
            .unwrap();

        h.gateway.set_status(Ok(report("paid", Some(dec!(49.99)))));
        assert!(matches!(
            h.service
                .handle_callback(created.order_id, paid_callback("0xdeposit"))
                .await,
            Err(CheckoutError::InsufficientPayment)
        ));
        assert_eq!(h.notifier.fired_count(), 0);

        // Terminal: even a now-sufficient retry answers with the rejection.
        h.gateway.set_status(Ok(report("paid", Some(dec!(50.00)))));
        assert!(matches!(
            h.service
                .handle_callback(created.order_id, paid_callback("0xdeposit"))
                .await,
            Err(CheckoutError::PaymentRejected)
        ));
        let status = h
            .service
            .get_status(created.order_id, &created.order_token)
            .unwrap();
        assert_eq!(status.status, "rejected");
    }

    #[tokio::test]
    async fn overpayment_is_accepted() {
        let h = harness();
        let created = h.service.create_order(valid_request("50.00")).unwrap();
        h.service
            .initiate_payment(created.order_id, &created.order_token)
            .await
            .unwrap();

        h.gateway.set_status(Ok(report("paid", Some(dec!(55.00)))));
        let outcome = h
            .service
            .handle_callback(created.order_id, paid_callback("0xdeposit"))
            .await
            .unwrap();
        assert_eq!(outcome.status, "verified");
    }

    #[tokio::test]
    async fn address_mismatch_rejects_regardless_of_amount() {
        let h = harness();
        let created = h.service.create_order(valid_request("50.00")).unwrap();
        h.service
            .initiate_payment(created.order_id, &created.order_token)
            .await
            .unwrap();

        h.gateway.set_status(Ok(report("paid", Some(dec!(500.00)))));
        assert!(matches!(
            h.service
                .handle_callback(created.order_id, paid_callback("0xattacker"))
                .await,
            Err(CheckoutError::AddressMismatch)
        ));
        assert_eq!(h.notifier.fired_count(), 0);
        let status = h
            .service
            .get_status(created.order_id, &created.order_token)
            .unwrap();
        assert_eq!(status.status, "rejected");
    }

    #[tokio::test]
    async fn gateway_outage_leaves_order_retryable() {
        let h = harness();
        let created = h.service.create_order(valid_request("50.00")).unwrap();
        h.service
            .initiate_payment(created.order_id, &created.order_token)
            .await
            .unwrap();

        h.gateway.set_status(Err("connect timeout".into()));
        assert!(matches!(
            h.service
                .handle_callback(created.order_id, paid_callback("0xdeposit"))
                .await,
            Err(CheckoutError::GatewayUnavailable(_))
        ));
        let status = h
            .service
            .get_status(created.order_id, &created.order_token)
            .unwrap();
        assert_eq!(status.status, "initiated");

        // Gateway recovers; the same callback now succeeds.
        h.gateway.set_status(Ok(report("paid", Some(dec!(50.00)))));
        let outcome = h
            .service
            .handle_callback(created.order_id, paid_callback("0xdeposit"))
            .await
            .unwrap();
        assert_eq!(outcome.status, "verified");
    }

    #[tokio::test]
    async fn concurrent_callbacks_fire_exactly_one_notification() {
        let h = harness();
        let created = h.service.create_order(valid_request("50.00")).unwrap();
        h.service
            .initiate_payment(created.order_id, &created.order_token)
            .await
            .unwrap();
        h.gateway.set_status(Ok(report("paid", Some(dec!(50.00)))));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = h.service.clone();
            let id = created.order_id;
            handles.push(tokio::spawn(async move {
                service.handle_callback(id, paid_callback("0xdeposit")).await
            }));
        }
        let mut fresh = 0;
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert_eq!(outcome.status, "verified");
            if !outcome.replay {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(h.notifier.fired_count(), 1);
    }

    #[tokio::test]
    async fn initiate_after_finalization_is_a_state_conflict() {
        let h = harness();
        let created = h.service.create_order(valid_request("50.00")).unwrap();
        h.service
            .initiate_payment(created.order_id, &created.order_token)
            .await
            .unwrap();
        h.gateway.set_status(Ok(report("paid", Some(dec!(50.00)))));
        h.service
            .handle_callback(created.order_id, paid_callback("0xdeposit"))
            .await
            .unwrap();

        assert!(matches!(
            h.service
                .initiate_payment(created.order_id, &created.order_token)
                .await,
            Err(CheckoutError::StateConflict(_))
        ));
    }

    #[test]
    fn sweep_reclaims_expired_orders() {
        let h = harness_with_ttl(Duration::seconds(-1));
        h.service.create_order(valid_request("10")).unwrap();
        h.service.create_order(valid_request("20")).unwrap();
        assert_eq!(h.service.sweep(Utc::now()), 2);
        assert_eq!(h.service.sweep(Utc::now()), 0);
    }

    #[tokio::test]
    async fn sweep_releases_notification_keys_for_reclaimed_orders() {
        let h = harness();
        let created = h.service.create_order(valid_request("50.00")).unwrap();
        h.service
            .initiate_payment(created.order_id, &created.order_token)
            .await
            .unwrap();
        h.gateway.set_status(Ok(report("paid", Some(dec!(50.00)))));
        h.service
            .handle_callback(created.order_id, paid_callback("0xdeposit"))
            .await
            .unwrap();
        assert_eq!(h.notifier.fired_count(), 1);

        assert_eq!(h.service.sweep(Utc::now() + Duration::hours(2)), 1);
        assert_eq!(h.notifier.fired_count(), 0);
        // The order itself is gone, so the released key cannot re-fire.
        assert!(matches!(
            h.service
                .handle_callback(created.order_id, paid_callback("0xdeposit"))
                .await,
            Err(CheckoutError::OrderNotFound)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sweep_runs_safely_alongside_new_orders() {
        let h = harness();
        let service = h.service.clone();
        let creator = tokio::spawn(async move {
            for _ in 0..128 {
                let created = service.create_order(valid_request("10")).unwrap();
                service
                    .initiate_payment(created.order_id, &created.order_token)
                    .await
                    .unwrap();
            }
        });
        while !creator.is_finished() {
            h.service.sweep(Utc::now());
            tokio::task::yield_now().await;
        }
        creator.await.unwrap();
        assert_eq!(h.service.sweep(Utc::now()), 0);
    }

    #[test]
    fn admin_view_excludes_secrets() {
        let h = harness();
        let created = h.service.create_order(valid_request("50.00")).unwrap();
        let view = h.service.admin_order(created.order_id).unwrap();
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains(&created.order_token));
        assert!(json.contains("productTotal"));
        assert!(matches!(
            h.service.admin_order(Uuid::new_v4()),
            Err(CheckoutError::OrderNotFound)
        ));
    }
}
