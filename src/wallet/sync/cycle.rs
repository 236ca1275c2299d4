//! One synchronization cycle.
//!
//! A cycle fetches the current UTXO snapshot, reconciles the hydrated cache with it (incrementally
//! when possible, otherwise by full rehydration), recomputes balances, refreshes the recent
//! transaction history and turns queued mempool transactions into notifications.
//!
//! The cycle works on an owned copy of the wallet state. Any error returns before the copy is
//! handed back, so the scheduler's state is never partially updated.

use crate::indexer::{IndexerService, RawTx};
use crate::wallet::sync::balances::BalanceAggregator;
use crate::wallet::sync::differ::{SnapshotDiff, diff_snapshots};
use crate::wallet::sync::events::WalletNotification;
use crate::wallet::sync::history::TxHistoryParser;
use crate::wallet::sync::hydration::HydratedUtxoCache;
use crate::wallet::{
    Direction, TxHistoryEntry, UtxoSnapshot, WalletBalance, WalletHandle, WalletSyncError,
};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Stage of the scheduler's current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncPhase {
    #[default]
    Idle,
    Fetching,
    Reconciling,
    Aggregating,
}

/// Everything a cycle needs, owned.
#[derive(Debug, Clone)]
pub struct CycleInput {
    pub wallet: WalletHandle,
    pub previous_snapshot: Option<UtxoSnapshot>,
    /// `None` when there is no trusted cache and a full rehydration is required.
    pub cache: Option<HydratedUtxoCache>,
    pub aggregator: BalanceAggregator,
    /// Last published balance, used for push notifications on an unchanged snapshot.
    pub balance: WalletBalance,
    /// Mempool transactions reported by the push subscription since the last cycle.
    pub pending_txids: Vec<String>,
    pub history_count: usize,
    pub batch_size: usize,
}

/// New wallet state produced by a cycle that observed a change.
#[derive(Debug, Clone)]
pub struct CycleOutput {
    pub snapshot: UtxoSnapshot,
    pub cache: HydratedUtxoCache,
    pub aggregator: BalanceAggregator,
    pub balance: WalletBalance,
    pub history: Vec<TxHistoryEntry>,
    pub notifications: Vec<WalletNotification>,
    pub stats: CycleStats,
}

/// What the cycle did to the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub added: usize,
    pub consumed: usize,
    pub rehydrated: bool,
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// Snapshot and cache already agree; only push notifications may be emitted.
    Unchanged {
        notifications: Vec<WalletNotification>,
        /// Token metadata cache, including metadata resolved for the notifications.
        aggregator: BalanceAggregator,
    },
    Updated(Box<CycleOutput>),
}

/// Run one cycle against `indexer`.
pub async fn run_cycle(
    indexer: Arc<dyn IndexerService>,
    input: CycleInput,
    phase: Arc<watch::Sender<SyncPhase>>,
) -> Result<CycleOutcome, WalletSyncError> {
    let result = execute(indexer.as_ref(), input, &phase).await;
    phase.send_replace(SyncPhase::Idle);
    result
}

async fn execute(
    indexer: &dyn IndexerService,
    input: CycleInput,
    phase: &watch::Sender<SyncPhase>,
) -> Result<CycleOutcome, WalletSyncError> {
    let CycleInput {
        wallet,
        previous_snapshot,
        cache,
        mut aggregator,
        balance: previous_balance,
        pending_txids,
        history_count,
        batch_size,
    } = input;
    let parser = TxHistoryParser::new(wallet.script_hashes());

    phase.send_replace(SyncPhase::Fetching);
    let snapshot = indexer.get_utxo_snapshot(&wallet.addresses).await?;
    debug!(
        "Fetched snapshot of {} utxos from {}",
        snapshot.utxo_count(),
        indexer.endpoint()
    );

    let unchanged = previous_snapshot.as_ref() == Some(&snapshot)
        && cache
            .as_ref()
            .is_some_and(|cache| cache.verify_completeness(&snapshot));
    if unchanged {
        let notifications = incoming_notifications(
            indexer,
            &parser,
            &mut aggregator,
            &wallet.name,
            &previous_balance,
            &pending_txids,
        )
        .await;
        return Ok(CycleOutcome::Unchanged {
            notifications,
            aggregator,
        });
    }

    phase.send_replace(SyncPhase::Reconciling);
    let (cache, stats) = reconcile(
        indexer,
        previous_snapshot.as_ref(),
        cache,
        &snapshot,
        batch_size,
    )
    .await?;

    phase.send_replace(SyncPhase::Aggregating);
    let balance = aggregator.aggregate(indexer, cache.utxos()).await?;
    let history = fetch_history(indexer, &parser, &mut aggregator, &wallet, history_count).await?;
    let notifications = incoming_notifications(
        indexer,
        &parser,
        &mut aggregator,
        &wallet.name,
        &balance,
        &pending_txids,
    )
    .await;

    info!(
        "Cycle complete for {}: {} XEC spendable, {} utxos (+{} -{}{})",
        wallet.name,
        balance.spendable_display,
        cache.len(),
        stats.added,
        stats.consumed,
        if stats.rehydrated { ", rehydrated" } else { "" }
    );

    Ok(CycleOutcome::Updated(Box::new(CycleOutput {
        snapshot,
        cache,
        aggregator,
        balance,
        history,
        notifications,
        stats,
    })))
}

/// Bring the cache in line with `current`, falling back to full rehydration.
async fn reconcile(
    indexer: &dyn IndexerService,
    previous: Option<&UtxoSnapshot>,
    cache: Option<HydratedUtxoCache>,
    current: &UtxoSnapshot,
    batch_size: usize,
) -> Result<(HydratedUtxoCache, CycleStats), WalletSyncError> {
    if let (Some(mut cache), SnapshotDiff::Delta(delta)) =
        (cache, diff_snapshots(previous, Some(current)))
    {
        let consumed = delta.consumed.utxo_count();
        cache.apply_consumed(&delta.consumed);
        match cache.apply_added(indexer, &delta.added, batch_size).await {
            Ok(added) if cache.verify_completeness(current) => {
                return Ok((
                    cache,
                    CycleStats {
                        added,
                        consumed,
                        rehydrated: false,
                    },
                ));
            }
            Ok(_) => warn!(
                "{}",
                WalletSyncError::InconsistentState(
                    "cache does not match snapshot after incremental update".to_string()
                )
            ),
            Err(e) => warn!("Incremental update failed, rehydrating: {}", e),
        }
    }

    let cache = HydratedUtxoCache::rehydrate(indexer, current, batch_size).await?;
    if !cache.verify_completeness(current) {
        return Err(WalletSyncError::InconsistentState(format!(
            "Rehydrated cache holds {} utxos, snapshot holds {}",
            cache.len(),
            current.utxo_count()
        )));
    }

    let added = cache.len();
    Ok((
        cache,
        CycleStats {
            added,
            consumed: 0,
            rehydrated: true,
        },
    ))
}

/// Most recent transactions across all wallet addresses, newest first.
///
/// An address whose history page cannot be decoded is left out of the history for this cycle.
async fn fetch_history(
    indexer: &dyn IndexerService,
    parser: &TxHistoryParser,
    aggregator: &mut BalanceAggregator,
    wallet: &WalletHandle,
    count: usize,
) -> Result<Vec<TxHistoryEntry>, WalletSyncError> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let pages = join_all(
        wallet
            .addresses
            .iter()
            .map(|address| indexer.get_tx_history(&address.hash160, count)),
    )
    .await;

    let mut seen = HashSet::new();
    let mut txs: Vec<RawTx> = Vec::new();
    for (address, page) in wallet.addresses.iter().zip(pages) {
        match page.map_err(WalletSyncError::from) {
            Ok(page) => txs.extend(page.into_iter().filter(|tx| seen.insert(tx.txid.clone()))),
            Err(WalletSyncError::MalformedData(reason)) => warn!(
                "Skipping unreadable history of {}: {}",
                address.address, reason
            ),
            Err(e) => return Err(e),
        }
    }
    txs.sort_by_key(|tx| std::cmp::Reverse(tx.time_first_seen));
    txs.truncate(count);

    let mut history = Vec::with_capacity(txs.len());
    for tx in &txs {
        let decimals = token_decimals(indexer, aggregator, tx).await;
        history.push(parser.parse(tx, decimals));
    }
    Ok(history)
}

/// Decimals of the token moved by `tx`, if it is a token transaction whose metadata resolves.
async fn token_decimals(
    indexer: &dyn IndexerService,
    aggregator: &mut BalanceAggregator,
    tx: &RawTx,
) -> Option<u32> {
    let token_id = &tx.slp_tx_data.as_ref()?.slp_meta.token_id;
    match aggregator.resolve_token(indexer, token_id).await {
        Ok(token) => Some(token.decimals),
        Err(e) => {
            warn!("No metadata for token {} in tx {}: {}", token_id, tx.txid, e);
            None
        }
    }
}

/// Notifications for incoming transactions among `txids`. Failed lookups are logged and skipped.
async fn incoming_notifications(
    indexer: &dyn IndexerService,
    parser: &TxHistoryParser,
    aggregator: &mut BalanceAggregator,
    wallet: &str,
    balance: &WalletBalance,
    txids: &[String],
) -> Vec<WalletNotification> {
    let mut notifications = Vec::new();

    for txid in txids {
        let tx = match indexer.get_transaction(txid).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!("Could not fetch mempool tx {}: {}", txid, e);
                continue;
            }
        };

        let decimals = token_decimals(indexer, aggregator, &tx).await;
        let entry = parser.parse(&tx, decimals);
        if entry.direction != Direction::Incoming {
            continue;
        }

        let notification = match (&entry.token_id, entry.token_amount) {
            (Some(token_id), Some(amount)) => {
                let (ticker, name) = aggregator
                    .token(token_id)
                    .map(|token| (token.ticker.clone(), token.name.clone()))
                    .unwrap_or_default();
                WalletNotification::TokenReceived {
                    wallet: wallet.to_string(),
                    token_id: token_id.clone(),
                    ticker,
                    name,
                    amount,
                }
            }
            _ => WalletNotification::BalanceIncreased {
                wallet: wallet.to_string(),
                amount: entry.native_amount,
                new_balance: balance.spendable_display,
            },
        };
        notifications.push(notification);
    }

    notifications
}
