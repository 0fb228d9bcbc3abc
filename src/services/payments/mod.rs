//! Payment gateway adapters.
//!
//! Two capability traits cover the spec'd payment methods: mobile-money push
//! payments ([`PushPaymentGateway`], initiate + idempotent status query) and
//! synchronous card charges ([`CardPaymentGateway`], single round-trip, no
//! polling). Each has a live implementation talking to the real processor
//! and a sandbox variant selected by configuration; the checkout state
//! machine only ever sees the trait objects.

pub mod card;
pub mod mpesa;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::errors::ServiceError;

pub use card::{SandboxCardGateway, StripeCardGateway};
pub use mpesa::{DarajaGateway, SandboxPushGateway};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid phone number: {0}")]
    InvalidPhone(String),
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected gateway response: {0}")]
    Protocol(String),
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::InvalidPhone(msg) => ServiceError::InvalidPhone(msg),
            GatewayError::Declined(msg) => ServiceError::PaymentDeclined(msg),
            GatewayError::Unavailable(msg) => ServiceError::GatewayUnavailable(msg),
            GatewayError::Protocol(msg) => ServiceError::GatewayUnavailable(msg),
        }
    }
}

/// Accepted forms: local `07XXXXXXXX` / `01XXXXXXXX`, international
/// `254XXXXXXXXX`, or `+254XXXXXXXXX`.
static MSISDN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\+?254|0)((?:7|1)\d{8})$").expect("msisdn regex"));

/// Normalizes a Kenyan mobile number to the canonical `254XXXXXXXXX` form.
/// Idempotent: normalizing an already-canonical number is a no-op.
pub fn normalize_msisdn(raw: &str) -> Result<String, GatewayError> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    let captures = MSISDN_RE
        .captures(&compact)
        .ok_or_else(|| GatewayError::InvalidPhone(format!("not a valid mobile number: {}", raw)))?;
    Ok(format!("254{}", &captures[1]))
}

/// Outcome of a push-payment status query. The query is a read with no side
/// effects and is safe to repeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushPaymentStatus {
    Pending,
    Paid,
    Failed(String),
}

/// Result of initiating an STK push.
#[derive(Debug, Clone)]
pub struct StkPush {
    pub checkout_request_id: String,
    pub customer_message: Option<String>,
}

/// Result of a synchronous card charge.
#[derive(Debug, Clone)]
pub struct CardCharge {
    pub reference: String,
}

/// Mobile-money push payments: initiate once, then poll.
#[async_trait]
pub trait PushPaymentGateway: Send + Sync {
    /// Triggers the payment prompt on the customer's phone. `msisdn` must
    /// already be in canonical form.
    async fn initiate(
        &self,
        order_id: Uuid,
        msisdn: &str,
        amount: Decimal,
    ) -> Result<StkPush, GatewayError>;

    /// Queries the outcome of a previously initiated push. Idempotent read.
    async fn query_status(
        &self,
        checkout_request_id: &str,
    ) -> Result<PushPaymentStatus, GatewayError>;

    /// True when this adapter simulates payments instead of contacting the
    /// processor; surfaced as `mock`/`is_sandbox` flags in API responses.
    fn is_sandbox(&self) -> bool {
        false
    }
}

/// Synchronous card charges. Deliberately has no status-query capability:
/// the absence of polling is part of the contract, not a silent no-op.
#[async_trait]
pub trait CardPaymentGateway: Send + Sync {
    async fn charge(
        &self,
        order_id: Uuid,
        amount_minor_units: i64,
        currency: &str,
        payment_token: &str,
    ) -> Result<CardCharge, GatewayError>;

    fn is_sandbox(&self) -> bool {
        false
    }
}

/// Per-key monotonically increasing counters, shared by the sandbox
/// gateways to script "paid after N polls" behavior.
#[derive(Debug, Default)]
pub(crate) struct PollCounters {
    counts: Mutex<HashMap<String, u32>>,
}

impl PollCounters {
    pub(crate) fn bump(&self, key: &str) -> u32 {
        let mut counts = self.counts.lock().expect("poll counter lock");
        let entry = counts.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub(crate) fn count(&self, key: &str) -> u32 {
        let counts = self.counts.lock().expect("poll counter lock");
        counts.get(key).copied().unwrap_or(0)
    }
}
