use crate::{
    auth::AuthUser,
    entities::{invoice, return_request::ReturnReason},
    errors::{round_hours, ServiceError},
    services::lifecycle::RETURN_INSTRUCTIONS,
    AppState,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderRequest {
    pub order_id: Uuid,
}

/// Credit note reference returned with every refund.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreditNoteSummary {
    pub id: Uuid,
    pub number: String,
    /// Negated order total, minor units
    pub total: i64,
    pub emailed: bool,
}

impl From<invoice::Model> for CreditNoteSummary {
    fn from(doc: invoice::Model) -> Self {
        Self {
            id: doc.id,
            number: doc.invoice_number,
            total: doc.total,
            emailed: doc.emailed_at.is_some(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderResponse {
    pub success: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub refund_id: String,
    pub credit_note: Option<CreditNoteSummary>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReturnRequestBody {
    pub order_id: Uuid,
    /// One of damaged, wrong_size, wrong_item, not_as_described, changed_mind, other
    #[validate(length(min = 1, max = 32))]
    pub reason: String,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReturnRequestResponse {
    pub success: bool,
    pub return_id: Uuid,
    pub return_number: String,
    pub deadline: DateTime<Utc>,
    pub instructions: String,
}

/// Self-service cancellation with immediate refund.
#[utoipa::path(
    post,
    path = "/api/v1/orders/cancel",
    request_body = CancelOrderRequest,
    responses(
        (status = 200, description = "Order cancelled and refunded", body = CancelOrderResponse),
        (status = 400, description = "Cancellation window closed; a return is required"),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order already being refunded", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<CancelOrderRequest>,
) -> Result<Response, ServiceError> {
    let user_id = user.user_uuid()?;
    let outcome = state
        .services
        .lifecycle
        .cancel_order(user_id, payload.order_id, Utc::now())
        .await;

    match outcome {
        Ok(outcome) => Ok(Json(CancelOrderResponse {
            success: true,
            kind: "cancellation".to_string(),
            refund_id: outcome.refund.id,
            credit_note: outcome.credit_note.map(CreditNoteSummary::from),
        })
        .into_response()),
        Err(ServiceError::CancellationWindowClosed { hours_elapsed }) => Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "type": "requires_return",
                "hoursElapsed": round_hours(hours_elapsed),
                "message": "This order can no longer be cancelled; please request a return instead",
            })),
        )
            .into_response()),
        Err(e) => Err(e),
    }
}

/// Opens a return for an order past its cancellation window.
#[utoipa::path(
    post,
    path = "/api/v1/orders/returns",
    request_body = ReturnRequestBody,
    responses(
        (status = 200, description = "Return registered", body = ReturnRequestResponse),
        (status = 400, description = "Order not returnable or invalid reason", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "A return is already open", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "orders"
)]
pub async fn request_return(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(payload): Json<ReturnRequestBody>,
) -> Result<Json<ReturnRequestResponse>, ServiceError> {
    payload.validate()?;
    let user_id = user.user_uuid()?;
    let reason = ReturnReason::from_str(payload.reason.trim())
        .map_err(|_| ServiceError::ValidationError(format!("Unknown return reason '{}'", payload.reason)))?;

    let record = state
        .services
        .lifecycle
        .request_return(user_id, payload.order_id, reason, payload.description, Utc::now())
        .await?;

    Ok(Json(ReturnRequestResponse {
        success: true,
        return_id: record.id,
        return_number: record.return_number,
        deadline: record.return_deadline,
        instructions: RETURN_INSTRUCTIONS.to_string(),
    }))
}
