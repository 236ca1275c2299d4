//! Capabilities the sync engine needs from the indexer.
//!
//! The engine only talks to these traits. `ChronikIndexerClient` and `ChronikWsConnector`
//! are the network implementations; tests plug in in-memory fakes.

use super::types::{IndexerError, PushEvent, RawTx, RawUtxo, TokenGenesis, UtxoEnrichment};
use crate::wallet::{AddressHandle, UtxoSnapshot};

/// Query side of the indexer.
#[async_trait::async_trait]
pub trait IndexerService: Send + Sync {
    /// Fetch the full UTXO set of every given address.
    async fn get_utxo_snapshot(
        &self,
        addresses: &[AddressHandle],
    ) -> Result<UtxoSnapshot, IndexerError>;

    /// Classify a batch of UTXOs as token or non-token outputs.
    async fn hydrate_utxos(&self, utxos: &[RawUtxo]) -> Result<Vec<UtxoEnrichment>, IndexerError>;

    /// Fetch a single transaction.
    async fn get_transaction(&self, txid: &str) -> Result<RawTx, IndexerError>;

    /// Fetch decimals, name and ticker of a token from its genesis transaction.
    async fn get_token_genesis(&self, token_id: &str) -> Result<TokenGenesis, IndexerError>;

    /// Fetch the most recent transactions touching a script hash.
    async fn get_tx_history(&self, script_hash: &str, count: usize)
    -> Result<Vec<RawTx>, IndexerError>;

    /// Endpoint identifier, used in logs.
    fn endpoint(&self) -> &str;
}

/// A live push subscription.
#[async_trait::async_trait]
pub trait PushSubscription: Send {
    async fn subscribe(&mut self, script_hash: &str) -> Result<(), IndexerError>;

    async fn unsubscribe(&mut self, script_hash: &str) -> Result<(), IndexerError>;

    /// Script hashes the connection is currently subscribed to.
    fn list_active_subscriptions(&self) -> Vec<String>;

    /// Next event from the connection. `None` means the connection is gone.
    async fn next_event(&mut self) -> Option<Result<PushEvent, IndexerError>>;
}

/// Opens push subscriptions; called again on every reconnect.
#[async_trait::async_trait]
pub trait SubscriptionConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushSubscription>, IndexerError>;
}
