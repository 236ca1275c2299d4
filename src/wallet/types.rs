use crate::indexer::{IndexerError, RawUtxo, UtxoEnrichment};

use rust_decimal::Decimal;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map;

/// One derivation-path address controlled by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressHandle {
    /// Human readable address, e.g. `ecash:qq...`.
    pub address: String,
    /// Hex encoded hash160 of the public key, used by the indexer to locate the script.
    pub hash160: String,
    /// Derivation path identifier, e.g. `1899`.
    pub path: String,
}

impl AddressHandle {
    /// Build a handle, checking that `hash160` is 20 bytes of hex.
    pub fn new(
        address: impl Into<String>,
        hash160: impl Into<String>,
        path: impl Into<String>,
    ) -> Result<Self, WalletSyncError> {
        let hash160 = hash160.into().to_lowercase();
        let bytes = hex::decode(&hash160).map_err(|e| {
            WalletSyncError::Config(format!("Invalid hash160 '{}': {}", hash160, e))
        })?;
        if bytes.len() != 20 {
            return Err(WalletSyncError::Config(format!(
                "hash160 '{}' is {} bytes, expected 20",
                hash160,
                bytes.len()
            )));
        }

        Ok(Self {
            address: address.into(),
            hash160,
            path: path.into(),
        })
    }
}

/// The wallet whose state is being synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletHandle {
    pub name: String,
    pub addresses: Vec<AddressHandle>,
}

impl WalletHandle {
    pub fn new(name: impl Into<String>, addresses: Vec<AddressHandle>) -> Self {
        Self {
            name: name.into(),
            addresses,
        }
    }

    /// Script hashes of all wallet addresses, in address order.
    pub fn script_hashes(&self) -> Vec<String> {
        self.addresses.iter().map(|a| a.hash160.clone()).collect()
    }
}

/// Identity of a UTXO for diffing: `(txid, output_index, value)`.
///
/// Confirmation height is deliberately absent, it changes when a mempool output is mined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtxoId<'a> {
    pub txid: &'a str,
    pub output_index: u32,
    pub value: u64,
}

/// Anything that can be identified as a UTXO.
pub trait UtxoIdentity {
    fn identity(&self) -> UtxoId<'_>;
}

impl UtxoIdentity for RawUtxo {
    fn identity(&self) -> UtxoId<'_> {
        UtxoId {
            txid: &self.txid,
            output_index: self.output_index,
            value: self.value,
        }
    }
}

/// A UTXO enriched with its token classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HydratedUtxo {
    #[serde(flatten)]
    pub utxo: RawUtxo,
    pub is_token_utxo: bool,
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(default)]
    pub token_amount: Option<u64>,
}

impl HydratedUtxo {
    pub fn new(utxo: RawUtxo, enrichment: &UtxoEnrichment) -> Self {
        Self {
            utxo,
            is_token_utxo: enrichment.is_token,
            token_id: enrichment.token_id.clone(),
            token_amount: enrichment.token_amount,
        }
    }

    /// A plain native-currency UTXO.
    pub fn native(utxo: RawUtxo) -> Self {
        Self {
            utxo,
            is_token_utxo: false,
            token_id: None,
            token_amount: None,
        }
    }
}

impl UtxoIdentity for HydratedUtxo {
    fn identity(&self) -> UtxoId<'_> {
        self.utxo.identity()
    }
}

/// Ordered per-address lists, the shape shared by snapshots, deltas and the hydrated cache.
///
/// Serialized as a list of `{address, utxos}` entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMap<T> {
    entries: BTreeMap<AddressHandle, Vec<T>>,
}

/// Full UTXO set of the wallet addresses at one point in time.
pub type UtxoSnapshot = AddressMap<RawUtxo>;

impl<T> Default for AddressMap<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> AddressMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &AddressHandle) -> Option<&[T]> {
        self.entries.get(address).map(Vec::as_slice)
    }

    /// Mutable list for `address`, created empty if missing.
    pub fn entry_mut(&mut self, address: &AddressHandle) -> &mut Vec<T> {
        self.entries.entry(address.clone()).or_default()
    }

    pub fn contains_address(&self, address: &AddressHandle) -> bool {
        self.entries.contains_key(address)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, AddressHandle, Vec<T>> {
        self.entries.iter()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &AddressHandle> {
        self.entries.keys()
    }

    /// Every item across all addresses.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.entries.values().flatten()
    }

    /// Total number of items across all addresses.
    pub fn utxo_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// True when no address holds any item.
    pub fn is_empty(&self) -> bool {
        self.utxo_count() == 0
    }

    /// Drop addresses whose list is empty.
    pub fn prune_empty(&mut self) {
        self.entries.retain(|_, items| !items.is_empty());
    }
}

impl<T> FromIterator<(AddressHandle, Vec<T>)> for AddressMap<T> {
    fn from_iter<I: IntoIterator<Item = (AddressHandle, Vec<T>)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (address, items) in iter {
            map.entry_mut(&address).extend(items);
        }
        map
    }
}

impl<'a, T> IntoIterator for &'a AddressMap<T> {
    type Item = (&'a AddressHandle, &'a Vec<T>);
    type IntoIter = btree_map::Iter<'a, AddressHandle, Vec<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[derive(Serialize)]
struct AddressEntryRef<'a, T> {
    address: &'a AddressHandle,
    utxos: &'a [T],
}

#[derive(Deserialize)]
struct AddressEntry<T> {
    address: AddressHandle,
    utxos: Vec<T>,
}

impl<T: Serialize> Serialize for AddressMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            self.entries
                .iter()
                .map(|(address, utxos)| AddressEntryRef { address, utxos }),
        )
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for AddressMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let entries = Vec::<AddressEntry<T>>::deserialize(deserializer)?;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.address, entry.utxos))
            .collect())
    }
}

/// Spendable native balance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub spendable_satoshis: u64,
    pub spendable_display: Decimal,
}

/// Balance and cached metadata of one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub token_id: String,
    pub decimals: u32,
    pub name: String,
    pub ticker: String,
    pub balance: Decimal,
}

/// Direction of a transaction relative to the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// A classified wallet transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHistoryEntry {
    pub txid: String,
    pub direction: Direction,
    /// Native amount in display units.
    pub native_amount: Decimal,
    #[serde(default)]
    pub token_id: Option<String>,
    /// Token amount, in display units when the token decimals were known.
    #[serde(default)]
    pub token_amount: Option<Decimal>,
}

impl TxHistoryEntry {
    pub fn is_incoming(&self) -> bool {
        self.direction == Direction::Incoming
    }
}

/// Error types for wallet state synchronization
#[derive(Debug, thiserror::Error)]
pub enum WalletSyncError {
    /// Transient indexer failure; the cycle is aborted and the endpoint rotated.
    #[error("Network error: {0}")]
    Network(String),

    /// Incrementally updated cache disagrees with the snapshot; triggers a rebuild.
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    /// A transaction, UTXO or token record could not be understood.
    #[error("Malformed data: {0}")]
    MalformedData(String),

    /// Every configured endpoint failed within one rotation.
    #[error("All {attempts} indexer endpoints failed")]
    ExhaustedEndpoints { attempts: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<IndexerError> for WalletSyncError {
    fn from(error: IndexerError) -> Self {
        if error.is_malformed() {
            WalletSyncError::MalformedData(error.to_string())
        } else {
            WalletSyncError::Network(error.to_string())
        }
    }
}
