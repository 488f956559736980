use crate::{
    errors::ServiceError,
    payments::webhook::{verify_signature, WebhookEvent, SIGNATURE_HEADER},
    services::reconciler::{Fulfillment, WebhookOutcome},
    AppState,
};
use axum::{extract::State, http::HeaderMap, response::Json};
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{error, info, warn};

// POST /api/v1/webhooks/payments
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/payments",
    request_body = String,
    responses(
        (status = 200, description = "Event received"),
        (status = 400, description = "Missing or invalid signature", body = crate::errors::ErrorResponse)
    ),
    tag = "payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ServiceError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let payment = &state.config.payment;
    if let Err(e) = verify_signature(
        &body,
        signature,
        &payment.webhook_secret,
        payment.webhook_tolerance_secs,
        chrono::Utc::now().timestamp(),
    ) {
        warn!(error = %e, "payment webhook signature verification failed");
        return Err(ServiceError::BadRequest(format!("Webhook signature rejected: {e}")));
    }

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid event payload: {e}")))?;

    // Acknowledge once the signature checks out. A failure here is for
    // operators: the payment already succeeded and the verifier can still
    // create the order.
    match state.services.reconciler.handle_event(&event).await {
        Ok(WebhookOutcome::Fulfilled(Fulfillment::Created(order))) => {
            info!(event_id = %event.id, order_number = %order.order_number, "order created from webhook");
        }
        Ok(WebhookOutcome::Fulfilled(Fulfillment::Existing(order))) => {
            info!(event_id = %event.id, order_number = %order.order_number, "webhook for an existing order");
        }
        Ok(WebhookOutcome::Ignored) => {}
        Err(e) => {
            error!(event_id = %event.id, error = %e, "webhook processing failed; manual reconciliation may be needed");
        }
    }

    Ok(Json(json!({ "received": true })))
}
