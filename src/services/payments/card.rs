//! Card processor gateway (Stripe-compatible payment intents). One
//! synchronous create-and-confirm round trip per charge; declines come back
//! as [`GatewayError::Declined`].

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::config::CardConfig;

use super::{CardCharge, CardPaymentGateway, GatewayError};

pub struct StripeCardGateway {
    http: reqwest::Client,
    cfg: CardConfig,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentResponse {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: Option<StripeErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

impl StripeCardGateway {
    pub fn new(cfg: CardConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
        }
    }
}

#[async_trait]
impl CardPaymentGateway for StripeCardGateway {
    #[instrument(skip(self, payment_token), fields(order_id = %order_id))]
    async fn charge(
        &self,
        order_id: Uuid,
        amount_minor_units: i64,
        currency: &str,
        payment_token: &str,
    ) -> Result<CardCharge, GatewayError> {
        let amount = amount_minor_units.to_string();
        let currency_lower = currency.to_lowercase();
        let order_ref = order_id.to_string();
        let params = [
            ("amount", amount.as_str()),
            ("currency", currency_lower.as_str()),
            ("payment_method", payment_token),
            ("confirm", "true"),
            ("description", order_ref.as_str()),
        ];

        let response = self
            .http
            .post(format!("{}/v1/payment_intents", self.cfg.base_url))
            .basic_auth(&self.cfg.secret_key, None::<&str>)
            .form(&params)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("card charge request failed: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            let message = response
                .json::<StripeErrorBody>()
                .await
                .ok()
                .and_then(|b| b.error)
                .and_then(|e| e.message.or(e.error_type))
                .unwrap_or_else(|| "card was declined".to_string());
            return Err(GatewayError::Declined(message));
        }
        if !status.is_success() {
            return Err(GatewayError::Unavailable(format!(
                "card processor returned {}",
                status
            )));
        }

        let intent: PaymentIntentResponse = response.json().await.map_err(|e| {
            GatewayError::Protocol(format!("malformed payment intent response: {}", e))
        })?;

        match intent.status.as_str() {
            "succeeded" => {
                debug!(reference = %intent.id, "card charge succeeded");
                Ok(CardCharge {
                    reference: intent.id,
                })
            }
            other => Err(GatewayError::Declined(format!(
                "charge not completed (status: {})",
                other
            ))),
        }
    }
}

/// Sandbox card gateway: approves or declines everything according to
/// configuration, without contacting a processor.
pub struct SandboxCardGateway {
    decline_all: bool,
}

impl SandboxCardGateway {
    pub fn new(decline_all: bool) -> Self {
        Self { decline_all }
    }
}

impl Default for SandboxCardGateway {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl CardPaymentGateway for SandboxCardGateway {
    async fn charge(
        &self,
        _order_id: Uuid,
        _amount_minor_units: i64,
        _currency: &str,
        _payment_token: &str,
    ) -> Result<CardCharge, GatewayError> {
        if self.decline_all {
            return Err(GatewayError::Declined(
                "sandbox gateway configured to decline".to_string(),
            ));
        }
        Ok(CardCharge {
            reference: format!("sandbox-pi-{}", Uuid::new_v4()),
        })
    }

    fn is_sandbox(&self) -> bool {
        true
    }
}
