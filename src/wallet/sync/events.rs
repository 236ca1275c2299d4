//! Notification events for wallet synchronization.
//!
//! The scheduler reports balance increases and token receipts to a [`NotificationSink`]. Events
//! come from two paths: while a push subscription is active, from incoming transactions seen in
//! the mempool; otherwise, from the difference between the balances of two successive cycles.

use crate::wallet::{TokenBalance, WalletBalance};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Something the wallet owner should hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletNotification {
    /// Spendable XEC went up by `amount`.
    BalanceIncreased {
        wallet: String,
        amount: Decimal,
        new_balance: Decimal,
    },
    /// `amount` units of a token arrived.
    TokenReceived {
        wallet: String,
        token_id: String,
        ticker: String,
        name: String,
        amount: Decimal,
    },
}

/// Receiver of wallet notifications.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: WalletNotification);

    /// Name of this sink for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Logs every notification.
#[derive(Debug, Default, Clone)]
pub struct TracingNotificationSink;

#[async_trait::async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, notification: WalletNotification) {
        match notification {
            WalletNotification::BalanceIncreased {
                wallet,
                amount,
                new_balance,
            } => info!(
                "{}: received {} XEC, balance now {} XEC",
                wallet, amount, new_balance
            ),
            WalletNotification::TokenReceived {
                wallet,
                ticker,
                name,
                amount,
                ..
            } => info!("{}: received {} {} ({})", wallet, amount, ticker, name),
        }
    }

    fn name(&self) -> &'static str {
        "TracingNotificationSink"
    }
}

/// Forwards notifications into an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelNotificationSink {
    sender: mpsc::UnboundedSender<WalletNotification>,
}

impl ChannelNotificationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WalletNotification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait::async_trait]
impl NotificationSink for ChannelNotificationSink {
    async fn notify(&self, notification: WalletNotification) {
        if self.sender.send(notification).is_err() {
            warn!("Notification receiver dropped");
        }
    }

    fn name(&self) -> &'static str {
        "ChannelNotificationSink"
    }
}

/// Notifications implied by going from `previous` to `current` balances.
///
/// A spendable increase yields `BalanceIncreased`; a token that is new or grew yields
/// `TokenReceived` for the increase. Decreases are silent.
pub fn balance_delta_notifications(
    wallet: &str,
    previous: (&WalletBalance, &[TokenBalance]),
    current: (&WalletBalance, &[TokenBalance]),
) -> Vec<WalletNotification> {
    let (previous_balance, previous_tokens) = previous;
    let (current_balance, current_tokens) = current;
    let mut notifications = Vec::new();

    if current_balance.spendable_display > previous_balance.spendable_display {
        notifications.push(WalletNotification::BalanceIncreased {
            wallet: wallet.to_string(),
            amount: current_balance.spendable_display - previous_balance.spendable_display,
            new_balance: current_balance.spendable_display,
        });
    }

    let before: BTreeMap<&str, Decimal> = previous_tokens
        .iter()
        .map(|token| (token.token_id.as_str(), token.balance))
        .collect();

    for token in current_tokens {
        let held = before
            .get(token.token_id.as_str())
            .copied()
            .unwrap_or(Decimal::ZERO);
        if token.balance > held {
            notifications.push(WalletNotification::TokenReceived {
                wallet: wallet.to_string(),
                token_id: token.token_id.clone(),
                ticker: token.ticker.clone(),
                name: token.name.clone(),
                amount: token.balance - held,
            });
        }
    }

    notifications
}
