//! Wallet Synchronization Module
//!
//! This module keeps the state of one eCash wallet in step with a Chronik indexer. It is composed
//! of several submodules, each responsible for a specific aspect of the sync process:
//!
//! - `differ`: Compares two UTXO snapshots and yields the added and consumed outputs.
//! - `hydration`: Maintains the cache of token-classified UTXOs, updated incrementally from deltas.
//! - `balances`: Computes the spendable XEC balance and per-token balances from the cache.
//! - `history`: Classifies raw transactions as incoming or outgoing with their amounts.
//! - `cycle`: One full sync cycle: fetch, reconcile, aggregate, parse history.
//! - `scheduler`: Runs cycles on a cadence, one at a time, and owns the wallet state.
//! - `endpoints`: Rotates through redundant indexer endpoints on failure.
//! - `subscriptions`: Keeps the push subscription set equal to the wallet's scripts.
//! - `events`: Notifications for received XEC and tokens, and the sinks that consume them.
//! - `progress_tracker`: Counts cycle outcomes for periodic logging.
//! - `repositories` / `state_persistence`: Durable storage of the synchronized state.

/// Per-token and spendable balance aggregation
pub mod balances;
/// A single sync cycle
pub mod cycle;
/// UTXO snapshot differencing
pub mod differ;
/// Indexer endpoint failover
pub mod endpoints;
/// Wallet notifications and sinks
pub mod events;
/// Transaction history classification
pub mod history;
/// Hydrated UTXO cache
pub mod hydration;
/// Tracks synchronization progress and statistics
pub mod progress_tracker;
/// Key-value storage backends
pub mod repositories;
/// Cadence, mutual exclusion and wallet switching
pub mod scheduler;
/// Saving and restoring wallet state
pub mod state_persistence;
/// Push subscription reconciliation
pub mod subscriptions;

#[cfg(test)]
mod test_support;

pub use balances::BalanceAggregator;
pub use cycle::{CycleInput, CycleOutcome, CycleOutput, CycleStats, SyncPhase, run_cycle};
pub use differ::{SnapshotDiff, UtxoDelta, diff_snapshots};
pub use endpoints::EndpointFailoverManager;
pub use events::{
    ChannelNotificationSink, NotificationSink, TracingNotificationSink, WalletNotification,
};
pub use history::TxHistoryParser;
pub use hydration::HydratedUtxoCache;
pub use repositories::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use scheduler::{SchedulerCommand, SyncScheduler, WalletView};
pub use state_persistence::{CacheValidation, PersistedWalletState, StatePersistenceService};
pub use subscriptions::{ReconcileReport, SubscriptionStatus, reconcile_subscriptions};
