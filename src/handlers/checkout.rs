use crate::{
    auth::AuthUser,
    errors::ServiceError,
    services::{
        checkout::{CheckoutRequest, CheckoutResponse},
        reconciler::VerifyResponse,
    },
    AppState,
};
use axum::{extract::State, response::Json, Extension};
use serde::Deserialize;
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifySessionRequest {
    #[validate(length(min = 1, max = 255, message = "sessionId is required"))]
    pub session_id: String,
}

/// Prices the cart on the server and opens a hosted payment session.
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Payment session created", body = CheckoutResponse),
        (status = 400, description = "Insufficient stock, unknown product or invalid discount", body = crate::errors::ErrorResponse),
        (status = 500, description = "Payment provider unavailable", body = crate::errors::ErrorResponse)
    ),
    tag = "checkout"
)]
pub async fn create_checkout(
    State(state): State<AppState>,
    user: Option<Extension<AuthUser>>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ServiceError> {
    let (user_id, email) = match user {
        Some(Extension(user)) => (Some(user.user_uuid()?), user.email),
        None => (None, None),
    };

    let response = state
        .services
        .checkout
        .create_session(user_id, email, payload)
        .await?;
    Ok(Json(response))
}

/// Client-triggered confirmation for when the payment webhook is late.
#[utoipa::path(
    post,
    path = "/api/v1/checkout/verify",
    request_body = VerifySessionRequest,
    responses(
        (status = 200, description = "Session status", body = VerifyResponse),
        (status = 400, description = "Malformed session id", body = crate::errors::ErrorResponse)
    ),
    tag = "checkout"
)]
pub async fn verify_session(
    State(state): State<AppState>,
    Json(payload): Json<VerifySessionRequest>,
) -> Result<Json<VerifyResponse>, ServiceError> {
    payload.validate()?;
    let response = state
        .services
        .reconciler
        .verify_session(payload.session_id.trim())
        .await?;
    Ok(Json(response))
}
