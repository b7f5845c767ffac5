use actix_web::{get, post, web, HttpRequest, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::CheckoutError;
use crate::metrics;
use crate::service::{CallbackParams, CreateOrderRequest};
use crate::state::AppState;
use crate::token;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessPaymentRequest {
    pub order_id: Option<String>,
    pub order_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub order_token: Option<String>,
}

#[post("/api/create-order")]
pub async fn create_order(
    state: web::Data<AppState>,
    body: web::Json<CreateOrderRequest>,
) -> Result<HttpResponse, CheckoutError> {
    let created = state.service.create_order(body.into_inner())?;
    Ok(HttpResponse::Ok().json(created))
}

#[post("/api/process-payment")]
pub async fn process_payment(
    state: web::Data<AppState>,
    body: web::Json<ProcessPaymentRequest>,
) -> Result<HttpResponse, CheckoutError> {
    let body = body.into_inner();
    let (order_id, order_token) = match (body.order_id, body.order_token) {
        (Some(id), Some(token)) if !id.is_empty() && !token.is_empty() => (id, token),
        _ => return Err(CheckoutError::Validation("Missing order details".into())),
    };
    // A non-UUID id cannot name an order; same response as a bad token so
    // callers cannot probe for valid ids.
    let order_id: Uuid = order_id.parse().map_err(|_| CheckoutError::Unauthorized)?;

    let init = state.service.initiate_payment(order_id, &order_token).await?;
    Ok(HttpResponse::Ok().json(init))
}

#[get("/payment-callback/{order_id}")]
pub async fn payment_callback(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<CallbackParams>,
) -> Result<HttpResponse, CheckoutError> {
    let order_id: Uuid = path
        .into_inner()
        .parse()
        .map_err(|_| CheckoutError::OrderNotFound)?;

    let outcome = state
        .service
        .handle_callback(order_id, query.into_inner())
        .await?;

    match &state.success_redirect_url {
        Some(url) => Ok(HttpResponse::SeeOther()
            .insert_header(("Location", format!("{url}?orderId={order_id}")))
            .finish()),
        None => Ok(HttpResponse::Ok().json(outcome)),
    }
}

#[get("/api/order-status/{order_id}")]
pub async fn order_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<StatusQuery>,
) -> Result<HttpResponse, CheckoutError> {
    let order_token = query
        .into_inner()
        .order_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CheckoutError::Validation("Missing order information".into()))?;
    let order_id: Uuid = path
        .into_inner()
        .parse()
        .map_err(|_| CheckoutError::Unauthorized)?;

    let status = state.service.get_status(order_id, &order_token)?;
    Ok(HttpResponse::Ok().json(status))
}

#[get("/api/admin/verify-order/{order_id}")]
pub async fn admin_verify_order(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, CheckoutError> {
    // Admin credential is distinct from any order token. No key configured
    // means the endpoint is disabled outright.
    let expected = state
        .admin_key
        .as_deref()
        .ok_or(CheckoutError::AdminUnauthorized)?;
    let presented = req
        .headers()
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(CheckoutError::AdminUnauthorized)?;
    if !token::token_matches(presented, expected) {
        tracing::warn!("admin credential mismatch");
        return Err(CheckoutError::AdminUnauthorized);
    }

    let order_id: Uuid = path
        .into_inner()
        .parse()
        .map_err(|_| CheckoutError::OrderNotFound)?;
    let view = state.service.admin_order(order_id)?;
    Ok(HttpResponse::Ok().json(view))
}

#[get("/api/health")]
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "crypto-checkout",
    }))
}

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    match &state.metrics_token {
        Some(expected) => {
            let authorized = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| token::token_matches(t, expected))
                .unwrap_or(false);
            if !authorized {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Valid Bearer token required for /metrics"
                }));
            }
        }
        None => {
            // No token configured — metrics stay protected unless the
            // operator explicitly opted in.
            if !state.public_metrics {
                return HttpResponse::Forbidden().json(serde_json::json!({
                    "error": "forbidden",
                    "message": "Set METRICS_TOKEN or PUBLIC_METRICS=true to access /metrics"
                }));
            }
        }
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}
