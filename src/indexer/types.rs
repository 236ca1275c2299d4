//! Types for the Chronik indexer integration: UTXOs, transactions, token genesis
//! records and push-subscription events.

use serde::{Deserialize, Serialize};

/// An unspent output as reported by the indexer for one script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUtxo {
    /// Transaction that created the output.
    pub txid: String,
    /// Position of the output in its transaction.
    #[serde(rename = "outIdx")]
    pub output_index: u32,
    /// Value in satoshis.
    pub value: u64,
    /// Block height, `None` while the output is still in the mempool.
    #[serde(rename = "blockHeight", default)]
    pub confirmation_height: Option<u32>,
}

/// Token classification of a single UTXO, returned by the enrichment query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoEnrichment {
    pub txid: String,
    #[serde(rename = "outIdx")]
    pub output_index: u32,
    /// Whether the output carries a valid token (amount or mint baton).
    pub is_token: bool,
    #[serde(default)]
    pub token_id: Option<String>,
    /// Raw token amount in base units.
    #[serde(default)]
    pub token_amount: Option<u64>,
}

/// Input of an indexed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInput {
    /// Hex encoded output script of the spent output.
    pub output_script: String,
    pub value: u64,
}

/// Token data attached to a transaction output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlpToken {
    /// Base-unit amount as a decimal string.
    pub amount: String,
    #[serde(default)]
    pub is_mint_baton: bool,
}

/// Output of an indexed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxOutput {
    /// Hex encoded output script.
    pub output_script: String,
    pub value: u64,
    #[serde(default)]
    pub slp_token: Option<SlpToken>,
}

/// Token metadata of a token transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlpMeta {
    pub token_id: String,
    #[serde(default)]
    pub tx_type: Option<String>,
}

/// Genesis information of a token, only present on genesis transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisInfo {
    pub token_ticker: String,
    pub token_name: String,
    pub decimals: u32,
}

/// Token section of an indexed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlpTxData {
    pub slp_meta: SlpMeta,
    #[serde(default)]
    pub genesis_info: Option<GenesisInfo>,
}

/// A transaction as returned by the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTx {
    pub txid: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    #[serde(default)]
    pub slp_tx_data: Option<SlpTxData>,
    /// Unix time the indexer first saw the transaction.
    #[serde(default)]
    pub time_first_seen: i64,
}

/// Decimals, name and ticker of a token, taken from its genesis transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGenesis {
    pub decimals: u32,
    pub name: String,
    pub ticker: String,
}

impl From<GenesisInfo> for TokenGenesis {
    fn from(info: GenesisInfo) -> Self {
        Self {
            decimals: info.decimals,
            name: info.token_name,
            ticker: info.token_ticker,
        }
    }
}

/// Kind of a push-subscription message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushEventKind {
    /// A transaction touching a subscribed script entered the mempool.
    AddedToMempool,
    /// A previously seen transaction was mined.
    Confirmed,
    /// A new block was connected to the chain.
    BlockConnected,
}

/// Event delivered by the push subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub kind: PushEventKind,
    #[serde(default)]
    pub txid: Option<String>,
}

/// Error types for indexer queries and push subscriptions
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("GraphQL error: {0}")]
    GraphQLError(String),

    #[error("No data returned")]
    NoData,

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Session error: {0}")]
    SessionError(String),
}

impl IndexerError {
    /// Whether the error means the response itself could not be understood, as opposed
    /// to the service failing to answer.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            IndexerError::Malformed(_) | IndexerError::JsonError(_) | IndexerError::NoData
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_event_deserializes_chronik_message() {
        let event: PushEvent =
            serde_json::from_str(r#"{"type":"AddedToMempool","txid":"ab"}"#).unwrap();
        assert_eq!(event.kind, PushEventKind::AddedToMempool);
        assert_eq!(event.txid.as_deref(), Some("ab"));

        let block: PushEvent = serde_json::from_str(r#"{"type":"BlockConnected"}"#).unwrap();
        assert_eq!(block.kind, PushEventKind::BlockConnected);
        assert!(block.txid.is_none());
    }

    #[test]
    fn unconfirmed_utxo_has_no_height() {
        let utxo: RawUtxo =
            serde_json::from_str(r#"{"txid":"aa","outIdx":1,"value":546}"#).unwrap();
        assert_eq!(utxo.output_index, 1);
        assert_eq!(utxo.confirmation_height, None);
    }

    #[test]
    fn malformed_classification() {
        assert!(IndexerError::NoData.is_malformed());
        assert!(IndexerError::Malformed("x".into()).is_malformed());
        assert!(!IndexerError::ServiceUnavailable("down".into()).is_malformed());
    }
}
