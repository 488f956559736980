use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "1.0.0",
        description = r#"
# Storefront Order Core

Checkout, payment confirmation and the post-purchase lifecycle of a small
online store.

## Authentication

Customer and admin endpoints take a JWT in the Authorization header:

```
Authorization: Bearer <your-jwt-token>
```

Admin endpoints additionally require the `admin` role. The payment webhook
is authenticated by its `stripe-signature` header instead.

## Money

All amounts are integers in minor currency units (cents).

## Error Handling

Failures share one body shape; business-rule failures add machine-readable
detail such as `available` and `requested`:

```json
{
  "error": "Bad Request",
  "message": "Not enough stock for Linen shirt (M): 1 available, 2 requested",
  "available": 1,
  "requested": 2,
  "timestamp": "2026-01-01T00:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "checkout", description = "Cart pricing and payment sessions"),
        (name = "payments", description = "Payment gateway callbacks"),
        (name = "orders", description = "Customer order actions"),
        (name = "admin", description = "Back-office order and return management"),
        (name = "health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::checkout::create_checkout,
        crate::handlers::checkout::verify_session,
        crate::handlers::webhooks::payment_webhook,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::request_return,
        crate::handlers::admin::refund_order,
        crate::handlers::admin::update_order_status,
        crate::handlers::admin::manage_return,
        crate::handlers::health::health_check,
    ),
    components(
        schemas(
            crate::services::checkout::CheckoutRequest,
            crate::services::checkout::CartItem,
            crate::services::checkout::CheckoutResponse,
            crate::handlers::checkout::VerifySessionRequest,
            crate::services::reconciler::VerifyResponse,
            crate::services::reconciler::VerifyStatus,
            crate::handlers::orders::CancelOrderRequest,
            crate::handlers::orders::CancelOrderResponse,
            crate::handlers::orders::CreditNoteSummary,
            crate::handlers::orders::ReturnRequestBody,
            crate::handlers::orders::ReturnRequestResponse,
            crate::handlers::admin::AdminRefundRequest,
            crate::handlers::admin::AdminRefundResponse,
            crate::handlers::admin::RefundSummary,
            crate::handlers::admin::UpdateStatusRequest,
            crate::handlers::admin::OrderStatusResponse,
            crate::handlers::admin::ReturnActionRequest,
            crate::services::lifecycle::ReturnAction,
            crate::entities::order::OrderStatus,
            crate::entities::return_request::ReturnReason,
            crate::handlers::health::HealthResponse,
            crate::handlers::health::ComponentStatus,
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_document_lists_the_order_endpoints() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("Storefront API"));
        assert!(json.contains("/api/v1/checkout/verify"));
        assert!(json.contains("/api/v1/admin/orders/{id}/refund"));
        assert!(json.contains("bearer_auth"));
    }
}
