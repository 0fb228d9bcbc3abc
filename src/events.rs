use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Events emitted by the checkout, order and payment services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Checkout events
    CheckoutStarted {
        session_id: Uuid,
        cart_id: Uuid,
    },
    CheckoutSubmitted {
        session_id: Uuid,
        order_id: Uuid,
    },
    CheckoutFailed {
        session_id: Uuid,
        reason: String,
    },

    // Order events
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Payment events
    PaymentInitiated {
        order_id: Uuid,
        attempt_id: Uuid,
        method: String,
    },
    PaymentCompleted(Uuid),
    PaymentFailed {
        order_id: Uuid,
        reason: String,
    },

    // Coupon / cart events
    CouponRedeemed {
        coupon_id: Uuid,
        order_id: Uuid,
    },
    CartCleared(Uuid),
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event; delivery is best-effort and never fails the caller's
    /// operation.
    pub async fn send(&self, event: Event) {
        if let Err(e) = self.sender.send(event).await {
            warn!("event channel closed, dropping event: {}", e);
        }
    }
}

/// Creates a bounded event channel along with its sender wrapper.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Event processing loop. Spawned once at startup; terminates when every
/// sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated(order_id) => {
                info!(order_id = %order_id, "order created");
            }
            Event::PaymentCompleted(order_id) => {
                info!(order_id = %order_id, "payment completed");
            }
            Event::PaymentFailed { order_id, reason } => {
                warn!(order_id = %order_id, reason = %reason, "payment failed");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(order_id = %order_id, from = %old_status, to = %new_status, "order status changed");
            }
            other => {
                info!(event = ?other, "event received");
            }
        }
    }

    info!("event processing loop stopped");
}
