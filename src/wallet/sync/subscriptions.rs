//! Push subscription bookkeeping.

use crate::indexer::PushSubscription;
use crate::wallet::WalletSyncError;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Whether updates currently arrive through a live push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    #[default]
    Inactive,
    Active,
}

/// Script hashes added and removed by a reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
}

/// Make the server-side subscriptions equal `wanted`.
///
/// Stale entries are removed first, then missing ones are added. The subscription may only be
/// treated as active once this returns `Ok`.
pub async fn reconcile_subscriptions(
    subscription: &mut dyn PushSubscription,
    wanted: &BTreeSet<String>,
) -> Result<ReconcileReport, WalletSyncError> {
    let active: BTreeSet<String> = subscription.list_active_subscriptions().into_iter().collect();
    let mut report = ReconcileReport::default();

    for stale in active.difference(wanted) {
        subscription.unsubscribe(stale).await?;
        report.unsubscribed.push(stale.clone());
    }

    for missing in wanted.difference(&active) {
        subscription.subscribe(missing).await?;
        report.subscribed.push(missing.clone());
    }

    debug!(
        "Subscription reconciled: +{} -{}",
        report.subscribed.len(),
        report.unsubscribed.len()
    );
    info!("Push subscription covers {} scripts", wanted.len());
    Ok(report)
}
