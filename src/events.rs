//! Outbound settlement events and operator alerts.
//!
//! Components publish through [`SettlementNotifier`]; publishing never blocks
//! the settlement path.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::logging::ALERT_TARGET;
use crate::money::MoneyAmount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementEvent {
    DepositConfirmed {
        intent_id: Uuid,
        owner: String,
        actual_amount: MoneyAmount,
        tx_hash: String,
        block_number: u64,
    },
    /// Confirmed transfer with no matching intent after the grace window
    UnmatchedTransfer {
        tx_hash: String,
        log_index: u64,
        to_address: String,
        amount: MoneyAmount,
        block_number: u64,
    },
    PayoutResolved {
        payout_id: Uuid,
        tx_hash: String,
    },
    PayoutConfirmed {
        payout_id: Uuid,
        tx_hash: String,
        block_number: u64,
    },
    PayoutDeadLettered {
        payout_id: Uuid,
        attempts: u32,
        last_error: String,
    },
    Alert {
        severity: AlertSeverity,
        source: String,
        message: String,
    },
}

impl SettlementEvent {
    pub fn alert(severity: AlertSeverity, source: &str, message: impl Into<String>) -> Self {
        SettlementEvent::Alert {
            severity,
            source: source.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SettlementEvent::DepositConfirmed { .. } => "deposit_confirmed",
            SettlementEvent::UnmatchedTransfer { .. } => "unmatched_transfer",
            SettlementEvent::PayoutResolved { .. } => "payout_resolved",
            SettlementEvent::PayoutConfirmed { .. } => "payout_confirmed",
            SettlementEvent::PayoutDeadLettered { .. } => "payout_dead_lettered",
            SettlementEvent::Alert { .. } => "alert",
        }
    }
}

pub trait SettlementNotifier: Send + Sync {
    fn publish(&self, event: SettlementEvent);
}

/// Logs every event; alerts at WARN/ERROR.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl SettlementNotifier for TracingNotifier {
    fn publish(&self, event: SettlementEvent) {
        match &event {
            SettlementEvent::Alert {
                severity: AlertSeverity::Critical,
                source,
                message,
            } => error!(target: ALERT_TARGET, source, message, "CRITICAL alert"),
            SettlementEvent::Alert {
                severity: AlertSeverity::Warning,
                source,
                message,
            } => warn!(target: ALERT_TARGET, source, message, "Alert"),
            SettlementEvent::PayoutDeadLettered {
                payout_id,
                attempts,
                last_error,
            } => error!(
                target: ALERT_TARGET,
                payout_id = %payout_id,
                attempts,
                last_error,
                "Payout moved to dead letter queue"
            ),
            SettlementEvent::UnmatchedTransfer {
                tx_hash,
                log_index,
                amount,
                ..
            } => warn!(
                tx_hash,
                log_index,
                amount = %amount,
                "Unmatched deposit transfer requires manual review"
            ),
            other => info!(kind = other.kind(), event = ?other, "Settlement event"),
        }
    }
}

/// Delivers events to a bounded channel for an external consumer.
pub struct ChannelNotifier {
    tx: mpsc::Sender<SettlementEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SettlementEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl SettlementNotifier for ChannelNotifier {
    fn publish(&self, event: SettlementEvent) {
        if let Err(e) = self.tx.try_send(event) {
            let kind = match &e {
                mpsc::error::TrySendError::Full(ev) | mpsc::error::TrySendError::Closed(ev) => {
                    ev.kind()
                }
            };
            error!(kind, error = %e, "Settlement event dropped, consumer not keeping up");
        }
    }
}

/// Publishes to every inner notifier in order.
pub struct FanoutNotifier {
    notifiers: Vec<Arc<dyn SettlementNotifier>>,
}

impl FanoutNotifier {
    pub fn new(notifiers: Vec<Arc<dyn SettlementNotifier>>) -> Self {
        Self { notifiers }
    }
}

impl SettlementNotifier for FanoutNotifier {
    fn publish(&self, event: SettlementEvent) {
        for notifier in &self.notifiers {
            notifier.publish(event.clone());
        }
    }
}
