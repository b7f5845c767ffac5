use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

/// Errors surfaced by checkout operations.
///
/// Every verification-gate failure maps to a specific status code — the
/// only 500s are gateway transport failures (retryable by the caller) and
/// genuine internal faults. Gateway detail strings are logged server-side,
/// not echoed to callers.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// Malformed or missing input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Order token absent, mismatched, or order unknown/expired. Collapsed
    /// into one variant so callers cannot probe which order ids exist.
    #[error("invalid or expired order")]
    Unauthorized,

    /// Admin credential missing or incorrect.
    #[error("admin authentication failed")]
    AdminUnauthorized,

    /// Order id unknown, or expired and reclaimed.
    #[error("order not found")]
    OrderNotFound,

    /// Operation invalid for the order's current state.
    #[error("invalid order state: {0}")]
    StateConflict(String),

    /// Gateway does not (yet) report the payment as paid. Retryable once
    /// the payment lands; leaves the order in `Initiated`.
    #[error("payment not completed")]
    PaymentNotCompleted,

    /// Gateway-reported paid amount is below the order amount. Terminal.
    #[error("payment amount insufficient")]
    InsufficientPayment,

    /// Replay of an order already rejected by verification.
    #[error("payment was rejected")]
    PaymentRejected,

    /// Callback-claimed deposit address differs from the one the gateway
    /// assigned to this order. Spoofing signal; terminal.
    #[error("invalid payment address")]
    AddressMismatch,

    /// Gateway unreachable, timed out, or returned garbage. Transient.
    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CheckoutError {
    /// Stable machine-readable code for the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            CheckoutError::Validation(_) => "validation_error",
            CheckoutError::Unauthorized => "unauthorized",
            CheckoutError::AdminUnauthorized => "admin_unauthorized",
            CheckoutError::OrderNotFound => "order_not_found",
            CheckoutError::StateConflict(_) => "state_conflict",
            CheckoutError::PaymentNotCompleted => "payment_not_completed",
            CheckoutError::InsufficientPayment => "insufficient_payment",
            CheckoutError::PaymentRejected => "payment_rejected",
            CheckoutError::AddressMismatch => "address_mismatch",
            CheckoutError::GatewayUnavailable(_) => "gateway_unavailable",
            CheckoutError::Internal(_) => "internal_error",
        }
    }
}

impl ResponseError for CheckoutError {
    fn error_response(&self) -> HttpResponse {
        let body = |message: &str| {
            serde_json::json!({
                "error": self.code(),
                "message": message,
            })
        };
        match self {
            CheckoutError::Validation(msg) => HttpResponse::BadRequest().json(body(msg)),
            CheckoutError::Unauthorized => {
                HttpResponse::Unauthorized().json(body("Invalid or expired order"))
            }
            CheckoutError::AdminUnauthorized => {
                HttpResponse::Unauthorized().json(body("Unauthorized"))
            }
            CheckoutError::OrderNotFound => HttpResponse::NotFound().json(body("Order not found")),
            CheckoutError::StateConflict(msg) => HttpResponse::Conflict().json(body(msg)),
            CheckoutError::PaymentNotCompleted => {
                HttpResponse::PaymentRequired().json(body("Payment not completed"))
            }
            CheckoutError::InsufficientPayment => {
                HttpResponse::PaymentRequired().json(body("Payment amount insufficient"))
            }
            CheckoutError::PaymentRejected => {
                HttpResponse::PaymentRequired().json(body("Payment was rejected"))
            }
            CheckoutError::AddressMismatch => {
                HttpResponse::Forbidden().json(body("Invalid payment address"))
            }
            CheckoutError::GatewayUnavailable(detail) => {
                tracing::error!(detail = %detail, "payment gateway unavailable");
                HttpResponse::InternalServerError().json(body("Payment provider error"))
            }
            CheckoutError::Internal(detail) => {
                tracing::error!(detail = %detail, "internal error");
                HttpResponse::InternalServerError().json(body("An internal error occurred"))
            }
        }
    }
}
