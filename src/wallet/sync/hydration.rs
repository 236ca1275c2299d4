//! Hydrated UTXO cache.
//!
//! Keeps every wallet UTXO together with its token classification so balances can be
//! recomputed without asking the indexer about outputs it already described. The cache is
//! updated incrementally from a [`UtxoDelta`](super::differ::UtxoDelta) and checked against
//! the latest snapshot after every update; any disagreement means a full rebuild.

use crate::indexer::{IndexerService, RawUtxo, UtxoEnrichment};
use crate::wallet::{
    AddressHandle, AddressMap, HydratedUtxo, UtxoIdentity, UtxoSnapshot, WalletSyncError,
};

use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Enriched UTXO store of one wallet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HydratedUtxoCache {
    utxos: AddressMap<HydratedUtxo>,
}

impl HydratedUtxoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap previously persisted hydrated UTXOs.
    pub fn from_map(utxos: AddressMap<HydratedUtxo>) -> Self {
        Self { utxos }
    }

    pub fn utxos(&self) -> &AddressMap<HydratedUtxo> {
        &self.utxos
    }

    pub fn len(&self) -> usize {
        self.utxos.utxo_count()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    /// Remove spent outputs. Unknown outputs are logged and skipped.
    pub fn apply_consumed(&mut self, consumed: &UtxoSnapshot) {
        for (address, spent) in consumed {
            for utxo in spent {
                let entries = self.utxos.entry_mut(address);
                match entries.iter().position(|h| h.identity() == utxo.identity()) {
                    Some(index) => {
                        entries.remove(index);
                    }
                    None => warn!(
                        "Consumed utxo {}:{} not found in cache for {}",
                        utxo.txid, utxo.output_index, address.address
                    ),
                }
            }
        }
        self.utxos.prune_empty();
    }

    /// Enrich new outputs and append them to their address.
    ///
    /// Outputs already cached are neither fetched nor appended again. The cache is left untouched
    /// when any enrichment request fails. Returns the number of outputs appended.
    pub async fn apply_added(
        &mut self,
        indexer: &dyn IndexerService,
        added: &UtxoSnapshot,
        batch_size: usize,
    ) -> Result<usize, WalletSyncError> {
        let mut pending: Vec<(&AddressHandle, RawUtxo)> = Vec::new();
        for (address, utxos) in added {
            let cached = self.utxos.get(address).unwrap_or_default();
            let mut seen: HashSet<_> = cached.iter().map(UtxoIdentity::identity).collect();
            for utxo in utxos {
                if seen.insert(utxo.identity()) {
                    pending.push((address, utxo.clone()));
                } else {
                    debug!(
                        "Skipping already cached utxo {}:{}",
                        utxo.txid, utxo.output_index
                    );
                }
            }
        }

        if pending.is_empty() {
            return Ok(0);
        }

        let (addresses, raw): (Vec<&AddressHandle>, Vec<RawUtxo>) = pending.into_iter().unzip();
        let hydrated = hydrate_all(indexer, raw, batch_size).await?;
        let appended = hydrated.len();

        for (address, utxo) in addresses.into_iter().zip(hydrated) {
            self.utxos.entry_mut(address).push(utxo);
        }

        debug!("Appended {} hydrated utxos", appended);
        Ok(appended)
    }

    /// True when the cache holds exactly the outputs of `current`, address by address.
    pub fn verify_completeness(&self, current: &UtxoSnapshot) -> bool {
        if self.utxos.utxo_count() != current.utxo_count() {
            debug!(
                "Cache holds {} utxos, snapshot holds {}",
                self.utxos.utxo_count(),
                current.utxo_count()
            );
            return false;
        }

        let addresses: HashSet<&AddressHandle> =
            self.utxos.addresses().chain(current.addresses()).collect();

        addresses.into_iter().all(|address| {
            let mut cached: Vec<_> = self
                .utxos
                .get(address)
                .unwrap_or_default()
                .iter()
                .map(UtxoIdentity::identity)
                .collect();
            let mut expected: Vec<_> = current
                .get(address)
                .unwrap_or_default()
                .iter()
                .map(UtxoIdentity::identity)
                .collect();
            cached.sort();
            expected.sort();
            cached == expected
        })
    }

    /// Build a fresh cache by enriching every output of `current`.
    pub async fn rehydrate(
        indexer: &dyn IndexerService,
        current: &UtxoSnapshot,
        batch_size: usize,
    ) -> Result<Self, WalletSyncError> {
        let mut cache = Self::new();
        let appended = cache.apply_added(indexer, current, batch_size).await?;
        info!("Rehydrated {} utxos from {}", appended, indexer.endpoint());
        Ok(cache)
    }
}

/// Enrich `utxos` in batches requested concurrently. Output order matches input order.
async fn hydrate_all(
    indexer: &dyn IndexerService,
    utxos: Vec<RawUtxo>,
    batch_size: usize,
) -> Result<Vec<HydratedUtxo>, WalletSyncError> {
    let batches = try_join_all(
        utxos
            .chunks(batch_size.max(1))
            .map(|batch| indexer.hydrate_utxos(batch)),
    )
    .await?;

    let mut enrichments: HashMap<(String, u32), UtxoEnrichment> = HashMap::new();
    for enrichment in batches.into_iter().flatten() {
        let key = (enrichment.txid.clone(), enrichment.output_index);
        if enrichments.insert(key, enrichment).is_some() {
            return Err(WalletSyncError::MalformedData(
                "Indexer returned duplicate enrichment for one outpoint".to_string(),
            ));
        }
    }

    utxos
        .into_iter()
        .map(|utxo| {
            let enrichment = enrichments
                .get(&(utxo.txid.clone(), utxo.output_index))
                .ok_or_else(|| {
                    WalletSyncError::MalformedData(format!(
                        "No enrichment returned for utxo {}:{}",
                        utxo.txid, utxo.output_index
                    ))
                })?;
            Ok(HydratedUtxo::new(utxo, enrichment))
        })
        .collect()
}
