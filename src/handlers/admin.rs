use crate::{
    entities::order::OrderStatus,
    errors::ServiceError,
    handlers::orders::CreditNoteSummary,
    services::{
        lifecycle::{ReturnAction, ReturnActionOutcome},
        refunds::RefundTrigger,
    },
    AppState,
};
use axum::{
    extract::{Path, State},
    response::Json,
    Extension,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthUser;

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct AdminRefundRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RefundSummary {
    pub id: String,
    pub amount: i64,
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdminRefundResponse {
    pub success: bool,
    pub refund: RefundSummary,
    pub credit_note: Option<CreditNoteSummary>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusResponse {
    pub id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReturnActionRequest {
    pub action: ReturnAction,
    pub return_id: Option<Uuid>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

/// Refunds an order from the back office.
#[utoipa::path(
    post,
    path = "/api/v1/admin/orders/{id}/refund",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = AdminRefundRequest,
    responses(
        (status = 200, description = "Refund issued", body = AdminRefundResponse),
        (status = 400, description = "Order cannot be refunded from its status", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Already refunding or refunded", body = crate::errors::ErrorResponse),
        (status = 500, description = "Payment provider refused the refund", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn refund_order(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
    payload: Option<Json<AdminRefundRequest>>,
) -> Result<Json<AdminRefundResponse>, ServiceError> {
    let Json(payload) = payload.unwrap_or_default();
    payload.validate()?;
    let reason = payload
        .reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "Refunded by store staff".to_string());

    info!(%order_id, admin = %admin.user_id, "admin refund requested");
    let outcome = state
        .services
        .refunds
        .refund_order(
            order_id,
            RefundTrigger::Admin,
            &reason,
            &OrderStatus::ADMIN_REFUNDABLE,
        )
        .await?;

    Ok(Json(AdminRefundResponse {
        success: true,
        refund: RefundSummary {
            id: outcome.refund.id,
            amount: outcome.refund.amount,
            status: outcome.refund.status,
        },
        credit_note: outcome.credit_note.map(CreditNoteSummary::from),
    }))
}

/// Moves an order forward along the fulfilment path.
#[utoipa::path(
    put,
    path = "/api/v1/admin/orders/{id}/status",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = OrderStatusResponse),
        (status = 400, description = "Transition not allowed", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<OrderStatusResponse>, ServiceError> {
    let order = state
        .services
        .lifecycle
        .update_status(order_id, payload.status, Utc::now())
        .await?;
    Ok(Json(OrderStatusResponse {
        id: order.id,
        order_number: order.order_number,
        status: order.status,
        updated_at: order.updated_at,
    }))
}

/// Back-office return handling: approve, receive, reject, expire_check.
#[utoipa::path(
    post,
    path = "/api/v1/admin/returns",
    request_body = ReturnActionRequest,
    responses(
        (status = 200, description = "Action applied"),
        (status = 400, description = "Invalid action for the return's state", body = crate::errors::ErrorResponse),
        (status = 404, description = "Return not found", body = crate::errors::ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn manage_return(
    State(state): State<AppState>,
    Json(payload): Json<ReturnActionRequest>,
) -> Result<Json<Value>, ServiceError> {
    payload.validate()?;
    let outcome = state
        .services
        .lifecycle
        .admin_return_action(payload.action, payload.return_id, payload.notes, Utc::now())
        .await?;

    let body = match outcome {
        ReturnActionOutcome::Updated(record) => json!({
            "success": true,
            "returnId": record.id,
            "returnNumber": record.return_number,
            "status": record.status,
        }),
        ReturnActionOutcome::Refunded { record, refund } => json!({
            "success": true,
            "returnId": record.id,
            "returnNumber": record.return_number,
            "status": record.status,
            "refund": {
                "id": refund.refund.id,
                "amount": refund.refund.amount,
                "status": refund.refund.status,
            },
            "creditNote": refund.credit_note.map(CreditNoteSummary::from),
        }),
        ReturnActionOutcome::Expired(expired) => json!({
            "success": true,
            "expired": expired,
        }),
    };
    Ok(Json(body))
}
