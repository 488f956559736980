use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::notifications::MailError;
use crate::payments::GatewayError;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Bad Request",
    "message": "Not enough stock for Linen shirt (M): 1 available, 2 requested",
    "details": {"productId": "550e8400-e29b-41d4-a716-446655440000", "size": "M", "available": 1, "requested": 2},
    "request_id": "req-abc123xyz",
    "timestamp": "2026-01-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Structured detail for business-rule failures
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

/// Why a discount code was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscountRejection {
    Unknown,
    Inactive,
    Expired,
    Exhausted,
    BelowMinimum { min_subtotal: i64 },
}

impl std::fmt::Display for DiscountRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscountRejection::Unknown => f.write_str("discount code does not exist"),
            DiscountRejection::Inactive => f.write_str("discount code is not active"),
            DiscountRejection::Expired => f.write_str("discount code has expired"),
            DiscountRejection::Exhausted => f.write_str("discount code has reached its usage limit"),
            DiscountRejection::BelowMinimum { min_subtotal } => write!(
                f,
                "discount code requires a minimum subtotal of {}",
                crate::services::invoices::format_minor(*min_subtotal)
            ),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not enough stock for {product_name} ({size}): {available} available, {requested} requested")]
    InsufficientStock {
        product_id: Uuid,
        product_name: String,
        size: String,
        available: i32,
        requested: i32,
    },

    #[error("Invalid discount code {code}: {reason}")]
    InvalidDiscount {
        code: String,
        reason: DiscountRejection,
    },

    #[error("Cancellation window closed {hours_elapsed:.1} hours after purchase")]
    CancellationWindowClosed { hours_elapsed: f64 },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Payment gateway error: {0}")]
    PaymentGateway(#[from] GatewayError),

    #[error("Email delivery failed: {0}")]
    Mail(#[from] MailError),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::ValidationError(_)
            | ServiceError::BadRequest(_)
            | ServiceError::InsufficientStock { .. }
            | ServiceError::InvalidDiscount { .. }
            | ServiceError::CancellationWindowClosed { .. }
            | ServiceError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::PaymentGateway(_)
            | ServiceError::DatabaseError(_)
            | ServiceError::Mail(_)
            | ServiceError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to clients. Infrastructure failures are masked.
    pub fn response_message(&self) -> String {
        match self {
            ServiceError::DatabaseError(_) | ServiceError::InternalError(_) | ServiceError::Mail(_) => {
                "An internal error occurred".to_string()
            }
            ServiceError::PaymentGateway(_) => {
                "The payment provider could not complete the request".to_string()
            }
            ServiceError::CancellationWindowClosed { .. } => {
                "This order can no longer be cancelled; please request a return instead".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Machine-readable detail for business-rule failures.
    pub fn details(&self) -> Option<Value> {
        match self {
            ServiceError::InsufficientStock {
                product_id,
                product_name,
                size,
                available,
                requested,
            } => Some(json!({
                "productId": product_id,
                "product": product_name,
                "size": size,
                "available": available,
                "requested": requested,
            })),
            ServiceError::InvalidDiscount { code, reason } => Some(json!({
                "code": code,
                "reason": reason.to_string(),
            })),
            ServiceError::CancellationWindowClosed { hours_elapsed } => Some(json!({
                "type": "requires_return",
                "hoursElapsed": round_hours(*hours_elapsed),
            })),
            _ => None,
        }
    }
}

pub(crate) fn round_hours(hours: f64) -> f64 {
    (hours * 10.0).round() / 10.0
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: self.details(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        // Detail keys are mirrored at the top level (`available`, `requested`).
        let mut body = serde_json::to_value(&err).unwrap_or_else(|_| json!({}));
        if let (Some(Value::Object(details)), Value::Object(top)) = (&err.details, &mut body) {
            for (key, value) in details {
                top.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        (status, Json(body)).into_response()
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn business_rule_failures_are_client_errors() {
        let err = ServiceError::InsufficientStock {
            product_id: Uuid::nil(),
            product_name: "Tee".into(),
            size: "M".into(),
            available: 1,
            requested: 2,
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        let details = err.details().unwrap();
        assert_eq!(details["available"], 1);
        assert_eq!(details["requested"], 2);

        let conflict = ServiceError::Conflict("order is already being refunded".into());
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn stock_details_are_readable_at_the_top_level() {
        let response = ServiceError::InsufficientStock {
            product_id: Uuid::nil(),
            product_name: "Tee".into(),
            size: "M".into(),
            available: 1,
            requested: 2,
        }
        .into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "Bad Request");
        assert_eq!(value["available"], 1);
        assert_eq!(value["requested"], 2);
        assert_eq!(value["details"]["size"], "M");
    }

    #[test]
    fn refund_gateway_failures_fail_loudly() {
        let err = ServiceError::PaymentGateway(GatewayError::Transport("timeout".into()));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.response_message().contains("timeout"));
    }

    #[test]
    fn infrastructure_failures_are_masked() {
        let err = ServiceError::DatabaseError(DbErr::Custom("connection reset".into()));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.response_message(), "An internal error occurred");
    }

    #[tokio::test]
    async fn window_closed_renders_requires_return() {
        let response = ServiceError::CancellationWindowClosed { hours_elapsed: 2.0166 }.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["details"]["type"], "requires_return");
        assert_eq!(value["details"]["hoursElapsed"], 2.0);
    }

    #[tokio::test]
    async fn error_body_carries_request_id_in_scope() {
        let response = crate::tracing::scope_request_id(
            crate::tracing::RequestId::new("req-42"),
            async { ServiceError::NotFound("order".into()).into_response() },
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["request_id"], "req-42");
    }
}
