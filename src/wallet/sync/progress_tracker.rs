//! Progress tracking for wallet synchronization.
//!
//! This module provides the `SyncProgressTracker`, which records the outcome of every sync cycle
//! of the active wallet session: how many cycles changed state, how many were no-ops, how often
//! the cache had to be rebuilt and how many cycles failed. The scheduler logs a summary
//! periodically and on wallet switch.

use crate::wallet::sync::cycle::CycleStats;

use tracing::{info, warn};

/// Log a summary every this many cycles.
const LOG_EVERY_CYCLES: u64 = 100;

/// Service for tracking synchronization progress
#[derive(Debug, Clone, Default)]
pub struct SyncProgressTracker {
    /// Cycles that produced new wallet state
    cycles_updated: u64,
    /// Cycles that found the snapshot unchanged
    cycles_unchanged: u64,
    /// Cycles aborted by an error
    cycles_failed: u64,
    /// Cycles whose results arrived after a wallet switch
    cycles_discarded: u64,
    /// Full cache rebuilds
    rehydrations: u64,
    /// Outputs appended by incremental updates or rebuilds
    utxos_added: u64,
    /// Outputs removed by incremental updates
    utxos_consumed: u64,
    /// Most recent error message
    last_error: Option<String>,
}

impl SyncProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn total_cycles(&self) -> u64 {
        self.cycles_updated + self.cycles_unchanged + self.cycles_failed + self.cycles_discarded
    }

    pub fn record_updated(&mut self, stats: &CycleStats) {
        self.cycles_updated += 1;
        self.utxos_added += stats.added as u64;
        self.utxos_consumed += stats.consumed as u64;
        if stats.rehydrated {
            self.rehydrations += 1;
        }
        self.last_error = None;
        self.log_progress(false);
    }

    pub fn record_unchanged(&mut self) {
        self.cycles_unchanged += 1;
        self.last_error = None;
        self.log_progress(false);
    }

    pub fn record_failure(&mut self, error: &str) {
        self.cycles_failed += 1;
        self.last_error = Some(error.to_string());
        self.log_progress(false);
    }

    pub fn record_discarded(&mut self) {
        self.cycles_discarded += 1;
    }

    /// Log progress at regular intervals or when forced
    pub fn log_progress(&self, force: bool) {
        let total = self.total_cycles();
        if !force && (total == 0 || total % LOG_EVERY_CYCLES != 0) {
            return;
        }

        let stats = self.get_stats();
        if stats.cycles_failed > 0 && stats.last_error.is_some() {
            warn!("{}", stats.summary());
        } else {
            info!("{}", stats.summary());
        }
    }

    /// Get sync statistics as a SyncStats struct
    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            cycles_updated: self.cycles_updated,
            cycles_unchanged: self.cycles_unchanged,
            cycles_failed: self.cycles_failed,
            cycles_discarded: self.cycles_discarded,
            rehydrations: self.rehydrations,
            utxos_added: self.utxos_added,
            utxos_consumed: self.utxos_consumed,
            last_error: self.last_error.clone(),
        }
    }
}

/// Statistics about the sync session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub cycles_updated: u64,
    pub cycles_unchanged: u64,
    pub cycles_failed: u64,
    pub cycles_discarded: u64,
    pub rehydrations: u64,
    pub utxos_added: u64,
    pub utxos_consumed: u64,
    pub last_error: Option<String>,
}

impl SyncStats {
    /// Get a human-readable summary of the sync statistics
    pub fn summary(&self) -> String {
        format!(
            "Sync cycles: {} updated, {} unchanged, {} failed, {} discarded; {} rehydrations, +{} -{} utxos{}",
            self.cycles_updated,
            self.cycles_unchanged,
            self.cycles_failed,
            self.cycles_discarded,
            self.rehydrations,
            self.utxos_added,
            self.utxos_consumed,
            match &self.last_error {
                Some(error) => format!(" (last error: {})", error),
                None => String::new(),
            }
        )
    }
}
