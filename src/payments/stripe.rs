use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    Address, CheckoutSession, CreateSessionRequest, CreatedSession, CustomerDetails, GatewayError,
    PaymentGateway, PurchasedLine, Refund, RefundRequest, SessionMetadata,
};

const LINE_ITEM_PAGE_SIZE: &str = "100";

/// Stripe REST client using form-encoded requests and basic auth.
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    secret_key: String,
    api_base: String,
}

impl std::fmt::Debug for StripeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeGateway")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl StripeGateway {
    pub fn new(secret_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            secret_key: secret_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_base, path)
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<StripeErrorEnvelope>(&body)
                .map(|e| e.error.message.unwrap_or_default())
                .unwrap_or(body);
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    /// Pages through a session's line items after `after` until the list is
    /// exhausted. The expanded session only carries the first page.
    async fn remaining_line_items(
        &self,
        session_id: &str,
        mut after: String,
    ) -> Result<Vec<StripeLineItem>, GatewayError> {
        let mut items = Vec::new();
        loop {
            let response = self
                .client
                .get(self.url(&format!("checkout/sessions/{session_id}/line_items")))
                .basic_auth(&self.secret_key, Some(""))
                .query(&[
                    ("limit", LINE_ITEM_PAGE_SIZE),
                    ("starting_after", after.as_str()),
                    ("expand[]", "data.price.product"),
                ])
                .send()
                .await?;
            let page: StripeList<StripeLineItem> = Self::decode(response).await?;
            let has_more = page.has_more;
            let last = page.data.last().and_then(|item| item.id.clone());
            items.extend(page.data);
            debug!(%session_id, fetched = items.len(), "Fetched line item page");

            match (has_more, last) {
                (false, _) => return Ok(items),
                (true, Some(id)) => after = id,
                (true, None) => {
                    return Err(GatewayError::Decode(
                        "line item page without ids".into(),
                    ))
                }
            }
        }
    }

    /// One-off amount coupon used to carry the server-computed discount.
    async fn create_coupon(&self, amount: i64, currency: &str) -> Result<String, GatewayError> {
        let response = self
            .client
            .post(self.url("coupons"))
            .basic_auth(&self.secret_key, Some(""))
            .form(&[
                ("amount_off", amount.to_string()),
                ("currency", currency.to_string()),
                ("duration", "once".to_string()),
                ("max_redemptions", "1".to_string()),
            ])
            .send()
            .await?;
        let coupon: StripeIdOnly = Self::decode(response).await?;
        Ok(coupon.id)
    }
}

pub(crate) fn session_form(request: &CreateSessionRequest, coupon: Option<&str>) -> Vec<(String, String)> {
    let mut form: Vec<(String, String)> = vec![
        ("mode".into(), "payment".into()),
        ("success_url".into(), request.success_url.clone()),
        ("cancel_url".into(), request.cancel_url.clone()),
        ("phone_number_collection[enabled]".into(), "true".into()),
    ];

    for (i, country) in request.shipping_countries.iter().enumerate() {
        form.push((
            format!("shipping_address_collection[allowed_countries][{i}]"),
            country.clone(),
        ));
    }

    if let Some(email) = &request.customer_email {
        form.push(("customer_email".into(), email.clone()));
    }

    for (i, line) in request.lines.iter().enumerate() {
        let prefix = format!("line_items[{i}]");
        form.push((format!("{prefix}[quantity]"), line.quantity.to_string()));
        form.push((
            format!("{prefix}[price_data][currency]"),
            request.currency.clone(),
        ));
        form.push((
            format!("{prefix}[price_data][unit_amount]"),
            line.unit_amount.to_string(),
        ));
        let name = match &line.size {
            Some(size) => format!("{} ({})", line.name, size),
            None => line.name.clone(),
        };
        form.push((format!("{prefix}[price_data][product_data][name]"), name));
        if let Some(image) = &line.image_url {
            form.push((
                format!("{prefix}[price_data][product_data][images][0]"),
                image.clone(),
            ));
        }
        form.push((
            format!("{prefix}[price_data][product_data][metadata][product_id]"),
            line.product_id.to_string(),
        ));
        if let Some(size) = &line.size {
            form.push((
                format!("{prefix}[price_data][product_data][metadata][size]"),
                size.clone(),
            ));
        }
    }

    if let Some(coupon) = coupon {
        form.push(("discounts[0][coupon]".into(), coupon.to_string()));
    }

    let mut metadata: Vec<_> = request.metadata.to_map().into_iter().collect();
    metadata.sort();
    for (key, value) in metadata {
        form.push((format!("metadata[{key}]"), value));
    }

    form
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(skip(self, request), fields(lines = request.lines.len()))]
    async fn create_checkout_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreatedSession, GatewayError> {
        let coupon = if request.discount_amount > 0 {
            Some(
                self.create_coupon(request.discount_amount, &request.currency)
                    .await?,
            )
        } else {
            None
        };

        let response = self
            .client
            .post(self.url("checkout/sessions"))
            .basic_auth(&self.secret_key, Some(""))
            .form(&session_form(request, coupon.as_deref()))
            .send()
            .await?;

        let session: StripeCreatedSession = Self::decode(response).await?;
        let url = session
            .url
            .ok_or_else(|| GatewayError::Decode("checkout session without url".into()))?;
        debug!(session_id = %session.id, "Created checkout session");
        Ok(CreatedSession {
            id: session.id,
            url,
        })
    }

    #[instrument(skip(self))]
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, GatewayError> {
        let response = self
            .client
            .get(self.url(&format!("checkout/sessions/{session_id}")))
            .basic_auth(&self.secret_key, Some(""))
            .query(&[
                ("expand[]", "line_items"),
                ("expand[]", "line_items.data.price.product"),
            ])
            .send()
            .await?;

        let mut raw: StripeSession = Self::decode(response).await?;
        if let Some(list) = raw.line_items.as_mut() {
            if list.has_more {
                let after = list.data.last().and_then(|item| item.id.clone()).ok_or_else(|| {
                    GatewayError::Decode("line item page without ids".into())
                })?;
                let rest = self.remaining_line_items(session_id, after).await?;
                list.data.extend(rest);
                list.has_more = false;
            }
        }
        raw.into_session()
    }

    #[instrument(skip(self, request), fields(order_number = %request.order_number))]
    async fn create_refund(&self, request: &RefundRequest) -> Result<Refund, GatewayError> {
        let response = self
            .client
            .post(self.url("refunds"))
            .basic_auth(&self.secret_key, Some(""))
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&[
                ("payment_intent", request.payment_id.clone()),
                ("amount", request.amount.to_string()),
                ("reason", "requested_by_customer".to_string()),
                ("metadata[order_number]", request.order_number.clone()),
            ])
            .send()
            .await?;

        let refund: StripeRefund = Self::decode(response).await?;
        Ok(Refund {
            id: refund.id,
            amount: refund.amount,
            status: refund.status.unwrap_or_else(|| "pending".to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeIdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeCreatedSession {
    id: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    amount: i64,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeSession {
    id: String,
    payment_status: String,
    payment_intent: Option<String>,
    currency: Option<String>,
    amount_subtotal: Option<i64>,
    amount_total: Option<i64>,
    #[serde(default)]
    total_details: Option<StripeTotalDetails>,
    #[serde(default)]
    customer_details: Option<StripeCustomerDetails>,
    #[serde(default)]
    shipping_details: Option<StripeShippingDetails>,
    #[serde(default)]
    collected_information: Option<StripeCollectedInformation>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    line_items: Option<StripeList<StripeLineItem>>,
}

#[derive(Debug, Deserialize, Default)]
struct StripeTotalDetails {
    #[serde(default)]
    amount_discount: i64,
    #[serde(default)]
    amount_shipping: i64,
    #[serde(default)]
    amount_tax: i64,
}

#[derive(Debug, Deserialize)]
struct StripeCustomerDetails {
    name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    address: Option<Address>,
}

#[derive(Debug, Deserialize)]
struct StripeShippingDetails {
    name: Option<String>,
    address: Option<Address>,
}

#[derive(Debug, Deserialize)]
struct StripeCollectedInformation {
    shipping_details: Option<StripeShippingDetails>,
}

#[derive(Debug, Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct StripeLineItem {
    #[serde(default)]
    id: Option<String>,
    description: Option<String>,
    quantity: Option<i32>,
    amount_total: Option<i64>,
    price: Option<StripePrice>,
}

#[derive(Debug, Deserialize)]
struct StripePrice {
    unit_amount: Option<i64>,
    product: Option<StripeProductRef>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StripeProductRef {
    Expanded(StripeProduct),
    Id(String),
}

#[derive(Debug, Deserialize)]
struct StripeProduct {
    name: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl StripeSession {
    fn into_session(self) -> Result<CheckoutSession, GatewayError> {
        let metadata = SessionMetadata::from_map(&self.metadata)?;
        let totals = self.total_details.unwrap_or_default();

        let shipping = self
            .collected_information
            .and_then(|c| c.shipping_details)
            .or(self.shipping_details);
        let (name, email, phone, billing_address) = match self.customer_details {
            Some(c) => (c.name, c.email, c.phone, c.address),
            None => (None, None, None, None),
        };
        let (shipping_name, shipping_address) = match shipping {
            Some(s) => (s.name, s.address),
            None => (None, None),
        };
        let customer = CustomerDetails {
            name,
            email,
            phone,
            shipping_name,
            address: shipping_address.or(billing_address),
        };

        let line_items = match self.line_items {
            Some(list) if list.has_more => {
                return Err(GatewayError::Decode(format!(
                    "checkout session {} has unfetched line items",
                    self.id
                )))
            }
            Some(list) => list.data.into_iter().map(into_purchased_line).collect(),
            None => Vec::new(),
        };

        Ok(CheckoutSession {
            id: self.id,
            payment_status: self.payment_status,
            payment_intent: self.payment_intent,
            currency: self.currency.unwrap_or_else(|| "eur".to_string()),
            amount_subtotal: self.amount_subtotal.unwrap_or_default(),
            amount_total: self.amount_total.unwrap_or_default(),
            amount_discount: totals.amount_discount,
            amount_shipping: totals.amount_shipping,
            amount_tax: totals.amount_tax,
            customer,
            metadata,
            line_items,
        })
    }
}

fn into_purchased_line(item: StripeLineItem) -> PurchasedLine {
    let quantity = item.quantity.unwrap_or(1);
    let (unit_amount, product) = match item.price {
        Some(price) => (price.unit_amount.unwrap_or_default(), price.product),
        None => (0, None),
    };
    let (product_name, product_meta) = match product {
        Some(StripeProductRef::Expanded(p)) => (p.name, p.metadata),
        Some(StripeProductRef::Id(_)) | None => (None, HashMap::new()),
    };

    PurchasedLine {
        product_id: product_meta
            .get("product_id")
            .and_then(|id| Uuid::parse_str(id).ok()),
        size: product_meta.get("size").cloned(),
        description: item
            .description
            .or(product_name)
            .unwrap_or_else(|| "item".to_string()),
        quantity,
        unit_amount,
        amount_total: item.amount_total.unwrap_or(unit_amount * i64::from(quantity)),
    }
}
