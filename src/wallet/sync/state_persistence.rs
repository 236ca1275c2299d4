//! State persistence service for wallet synchronization.
//!
//! This module provides the `StatePersistenceService`, which saves the synchronized state of a
//! wallet (snapshot, hydrated cache, token table, balances and history) to a [`KeyValueStore`]
//! and restores it on activation. Restored state is validated in one step: anything missing,
//! undecodable, of another format version or belonging to a different address set yields
//! [`CacheValidation::NeedsRebuild`], and the scheduler starts from a full rehydration.

use crate::wallet::sync::hydration::HydratedUtxoCache;
use crate::wallet::sync::repositories::KeyValueStore;
use crate::wallet::{
    AddressHandle, AddressMap, HydratedUtxo, TokenBalance, TxHistoryEntry, UtxoSnapshot,
    WalletBalance, WalletHandle, WalletSyncError,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Format version of [`PersistedWalletState`].
pub const STATE_VERSION: u32 = 1;

/// Everything persisted for one wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedWalletState {
    pub version: u32,
    pub wallet_name: String,
    pub addresses: Vec<AddressHandle>,
    pub snapshot: UtxoSnapshot,
    pub hydrated: AddressMap<HydratedUtxo>,
    pub tokens: Vec<TokenBalance>,
    pub balance: WalletBalance,
    pub history: Vec<TxHistoryEntry>,
    pub saved_at: DateTime<Utc>,
}

/// Outcome of validating stored state against the wallet being activated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValidation {
    Valid(Box<PersistedWalletState>),
    NeedsRebuild(String),
}

/// Service for saving and restoring wallet state.
pub struct StatePersistenceService {
    store: Arc<dyn KeyValueStore>,
}

impl StatePersistenceService {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn state_key(wallet_name: &str) -> String {
        format!("wallet_state_{}", wallet_name)
    }

    /// Save the state of `state.wallet_name`, replacing what was stored before.
    pub async fn save_state(&self, state: &PersistedWalletState) -> Result<(), WalletSyncError> {
        let bytes = serde_json::to_vec(state)?;
        self.store
            .set(&Self::state_key(&state.wallet_name), &bytes)
            .await?;

        info!(
            "Saved state of wallet {} ({} utxos, {} tokens)",
            state.wallet_name,
            state.hydrated.utxo_count(),
            state.tokens.len()
        );
        Ok(())
    }

    /// Load and validate the stored state of `wallet`.
    pub async fn restore_state(
        &self,
        wallet: &WalletHandle,
    ) -> Result<CacheValidation, WalletSyncError> {
        let Some(bytes) = self.store.get(&Self::state_key(&wallet.name)).await? else {
            return Ok(CacheValidation::NeedsRebuild("no stored state".to_string()));
        };

        let state: PersistedWalletState = match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!("Stored state of wallet {} is undecodable: {}", wallet.name, e);
                return Ok(CacheValidation::NeedsRebuild(format!(
                    "undecodable state: {}",
                    e
                )));
            }
        };

        let validation = validate_stored_state(state, wallet);
        match &validation {
            CacheValidation::Valid(state) => info!(
                "Restored state of wallet {} saved at {}",
                wallet.name,
                state.saved_at.to_rfc3339()
            ),
            CacheValidation::NeedsRebuild(reason) => {
                warn!("Discarding stored state of wallet {}: {}", wallet.name, reason)
            }
        }
        Ok(validation)
    }
}

/// Check that `state` belongs to `wallet` and is internally consistent.
pub fn validate_stored_state(
    state: PersistedWalletState,
    wallet: &WalletHandle,
) -> CacheValidation {
    if state.version != STATE_VERSION {
        return CacheValidation::NeedsRebuild(format!(
            "format version {} (expected {})",
            state.version, STATE_VERSION
        ));
    }

    if state.wallet_name != wallet.name {
        return CacheValidation::NeedsRebuild(format!(
            "state belongs to wallet {}",
            state.wallet_name
        ));
    }

    let stored: BTreeSet<&AddressHandle> = state.addresses.iter().collect();
    let expected: BTreeSet<&AddressHandle> = wallet.addresses.iter().collect();
    if stored != expected {
        return CacheValidation::NeedsRebuild("stale address set".to_string());
    }

    if state.snapshot.addresses().any(|address| !expected.contains(address)) {
        return CacheValidation::NeedsRebuild("snapshot covers unknown addresses".to_string());
    }

    let cache = HydratedUtxoCache::from_map(state.hydrated.clone());
    if !cache.verify_completeness(&state.snapshot) {
        return CacheValidation::NeedsRebuild("hydrated cache does not match snapshot".to_string());
    }

    CacheValidation::Valid(Box::new(state))
}
