//! M-Pesa Daraja gateway: OAuth token management, STK push initiation and
//! STK status query. The query maps Daraja result codes onto
//! [`PushPaymentStatus`]; a still-processing response is `Pending`, never an
//! error, so the polling loop can keep going.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::MpesaConfig;

use super::{GatewayError, PollCounters, PushPaymentGateway, PushPaymentStatus, StkPush};

/// Daraja error code returned while an STK push is still being processed.
const STILL_PROCESSING: &str = "500.001.1001";

/// Result codes Daraja reports for a push that will never complete.
const TERMINAL_FAILURE_CODES: &[&str] = &["1", "1031", "1032", "1037", "2001"];

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct DarajaGateway {
    http: reqwest::Client,
    cfg: MpesaConfig,
    token: RwLock<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushResponse {
    response_code: Option<String>,
    response_description: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    customer_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryResponse {
    result_code: Option<String>,
    result_desc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DarajaErrorBody {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

impl DarajaGateway {
    pub fn new(cfg: MpesaConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
            token: RwLock::new(None),
        }
    }

    /// Fetches (or reuses) an OAuth access token. Tokens are cached until
    /// shortly before their reported expiry.
    async fn access_token(&self) -> Result<String, GatewayError> {
        {
            let cached = self.token.read().await;
            if let Some(tok) = cached.as_ref() {
                if tok.expires_at > Instant::now() {
                    return Ok(tok.token.clone());
                }
            }
        }

        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.cfg.base_url
        );
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.cfg.consumer_key, Some(&self.cfg.consumer_secret))
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Unavailable(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("malformed token response: {}", e)))?;

        let ttl_secs: u64 = body.expires_in.parse().unwrap_or(3600);
        let token = CachedToken {
            token: body.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(ttl_secs.saturating_sub(60)),
        };
        *self.token.write().await = Some(token);
        Ok(body.access_token)
    }

    /// Daraja wants `base64(shortcode + passkey + timestamp)` with the same
    /// timestamp echoed alongside.
    fn password(&self, timestamp: &str) -> String {
        BASE64.encode(format!(
            "{}{}{}",
            self.cfg.shortcode, self.cfg.passkey, timestamp
        ))
    }
}

#[async_trait]
impl PushPaymentGateway for DarajaGateway {
    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn initiate(
        &self,
        order_id: Uuid,
        msisdn: &str,
        amount: Decimal,
    ) -> Result<StkPush, GatewayError> {
        let token = self.access_token().await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();

        // Daraja takes whole shillings
        let amount_shillings = amount
            .round()
            .to_i64()
            .ok_or_else(|| GatewayError::Protocol(format!("amount out of range: {}", amount)))?;

        let body = json!({
            "BusinessShortCode": self.cfg.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount_shillings,
            "PartyA": msisdn,
            "PartyB": self.cfg.shortcode,
            "PhoneNumber": msisdn,
            "CallBackURL": self.cfg.callback_url,
            "AccountReference": order_id.to_string(),
            "TransactionDesc": "Dukani order payment",
        });

        let response = self
            .http
            .post(format!(
                "{}/mpesa/stkpush/v1/processrequest",
                self.cfg.base_url
            ))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("stk push request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response
                .json::<DarajaErrorBody>()
                .await
                .ok()
                .and_then(|b| b.error_message)
                .unwrap_or_else(|| status.to_string());
            return Err(GatewayError::Unavailable(format!(
                "stk push rejected: {}",
                detail
            )));
        }

        let push: StkPushResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("malformed stk push response: {}", e)))?;

        match (push.response_code.as_deref(), push.checkout_request_id) {
            (Some("0"), Some(checkout_request_id)) => {
                debug!(%checkout_request_id, "stk push accepted");
                Ok(StkPush {
                    checkout_request_id,
                    customer_message: push.customer_message,
                })
            }
            (code, _) => Err(GatewayError::Unavailable(format!(
                "stk push not accepted: {}",
                push.response_description
                    .unwrap_or_else(|| code.unwrap_or("unknown").to_string())
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn query_status(
        &self,
        checkout_request_id: &str,
    ) -> Result<PushPaymentStatus, GatewayError> {
        let token = self.access_token().await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();

        let body = json!({
            "BusinessShortCode": self.cfg.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "CheckoutRequestID": checkout_request_id,
        });

        let response = self
            .http
            .post(format!("{}/mpesa/stkpushquery/v1/query", self.cfg.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("stk query request failed: {}", e)))?;

        if !response.status().is_success() {
            // Daraja answers the query with an error body while the push is
            // still in flight; that is a pending outcome, not a failure.
            let status = response.status();
            if let Ok(err) = response.json::<DarajaErrorBody>().await {
                if err.error_code.as_deref() == Some(STILL_PROCESSING) {
                    return Ok(PushPaymentStatus::Pending);
                }
                warn!(code = ?err.error_code, message = ?err.error_message, "stk query error");
            }
            return Err(GatewayError::Unavailable(format!(
                "stk query returned {}",
                status
            )));
        }

        let query: StkQueryResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("malformed stk query response: {}", e)))?;

        match query.result_code.as_deref() {
            Some("0") => Ok(PushPaymentStatus::Paid),
            Some(code) if TERMINAL_FAILURE_CODES.contains(&code) => {
                Ok(PushPaymentStatus::Failed(query.result_desc.unwrap_or_else(
                    || "payment was cancelled or failed".to_string(),
                )))
            }
            _ => Ok(PushPaymentStatus::Pending),
        }
    }
}

/// Sandbox push gateway: accepts every initiation and reports the payment
/// as paid after a configurable number of status queries, without contacting
/// Daraja.
pub struct SandboxPushGateway {
    paid_after_polls: u32,
    counters: Arc<PollCounters>,
}

impl SandboxPushGateway {
    pub fn new(paid_after_polls: u32) -> Self {
        Self {
            paid_after_polls: paid_after_polls.max(1),
            counters: Arc::new(PollCounters::default()),
        }
    }

    /// Number of status queries observed for a push.
    pub fn polls(&self, checkout_request_id: &str) -> u32 {
        self.counters.count(checkout_request_id)
    }
}

impl Default for SandboxPushGateway {
    fn default() -> Self {
        Self::new(2)
    }
}

#[async_trait]
impl PushPaymentGateway for SandboxPushGateway {
    async fn initiate(
        &self,
        order_id: Uuid,
        _msisdn: &str,
        _amount: Decimal,
    ) -> Result<StkPush, GatewayError> {
        Ok(StkPush {
            checkout_request_id: format!("sandbox-{}", Uuid::new_v4()),
            customer_message: Some(format!(
                "Sandbox STK push for order {}; no prompt was sent",
                order_id
            )),
        })
    }

    async fn query_status(
        &self,
        checkout_request_id: &str,
    ) -> Result<PushPaymentStatus, GatewayError> {
        let polls = self.counters.bump(checkout_request_id);
        if polls >= self.paid_after_polls {
            Ok(PushPaymentStatus::Paid)
        } else {
            Ok(PushPaymentStatus::Pending)
        }
    }

    fn is_sandbox(&self) -> bool {
        true
    }
}
