//!
//! GraphQL client for the Chronik indexer.
//!
//! This module provides an async client for querying script UTXO sets, transactions, token
//! genesis records and script history over HTTP. All methods are async and designed for use
//! with Tokio.

use super::service::IndexerService;
use super::types::*;
use crate::wallet::{AddressHandle, UtxoSnapshot};

use futures::future::try_join_all;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const TX_FIELDS: &str = r#"
	txid
	timeFirstSeen
	inputs { outputScript value }
	outputs { outputScript value slpToken { amount isMintBaton } }
	slpTxData {
		slpMeta { tokenId txType }
		genesisInfo { tokenTicker tokenName decimals }
	}
"#;

/// Chronik GraphQL indexer client
#[derive(Clone)]
pub struct ChronikIndexerClient {
	/// The underlying HTTP client for GraphQL queries.
	http_client: Client,
	/// The GraphQL HTTP endpoint.
	indexer_url: String,
}

impl ChronikIndexerClient {
	/// Create a new indexer client.
	///
	/// # Arguments
	/// * `indexer_url` - The HTTP endpoint for GraphQL queries.
	/// * `timeout` - Per-request timeout.
	pub fn new(indexer_url: String, timeout: Duration) -> Result<Self, IndexerError> {
		let http_client = Client::builder().timeout(timeout).build()?;

		Ok(Self {
			http_client,
			indexer_url,
		})
	}

	/// Execute a GraphQL query.
	///
	/// # Arguments
	/// * `query` - The GraphQL query string.
	/// * `variables` - Optional variables for the query.
	///
	/// # Returns
	/// The JSON response from the indexer, or an `IndexerError` if the request fails.
	/// Gateway and availability status codes map to `IndexerError::ServiceUnavailable`.
	pub async fn execute_query(
		&self,
		query: &str,
		variables: Option<serde_json::Value>,
	) -> Result<serde_json::Value, IndexerError> {
		let request_body = json!({
			"query": query,
			"variables": variables
		});

		let response = self
			.http_client
			.post(&self.indexer_url)
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await
			.map_err(|e| {
				if e.is_connect() || e.is_timeout() {
					IndexerError::ServiceUnavailable(format!("{}: {}", self.indexer_url, e))
				} else {
					IndexerError::HttpError(e)
				}
			})?;

		let status = response.status();
		if matches!(
			status,
			StatusCode::TOO_MANY_REQUESTS
				| StatusCode::BAD_GATEWAY
				| StatusCode::SERVICE_UNAVAILABLE
				| StatusCode::GATEWAY_TIMEOUT
		) {
			return Err(IndexerError::ServiceUnavailable(format!(
				"{} answered {}",
				self.indexer_url, status
			)));
		}
		if !status.is_success() {
			return Err(IndexerError::GraphQLError(format!("HTTP error: {}", status)));
		}

		let response_json: serde_json::Value = response.json().await?;

		if let Some(errors) = response_json.get("errors") {
			return Err(IndexerError::GraphQLError(format!(
				"GraphQL errors: {}",
				errors
			)));
		}

		Ok(response_json)
	}

	/// Execute a query and deserialize `data.<field>` of the response.
	async fn query_field<T: DeserializeOwned>(
		&self,
		field: &str,
		query: &str,
		variables: serde_json::Value,
	) -> Result<T, IndexerError> {
		let response = self.execute_query(query, Some(variables)).await?;
		let value = response
			.get("data")
			.and_then(|data| data.get(field))
			.filter(|value| !value.is_null())
			.cloned()
			.ok_or(IndexerError::NoData)?;

		serde_json::from_value(value).map_err(|e| {
			IndexerError::Malformed(format!("Unexpected shape for '{}': {}", field, e))
		})
	}

	/// Fetch the UTXOs of one p2pkh script.
	pub async fn get_script_utxos(&self, script_hash: &str) -> Result<Vec<RawUtxo>, IndexerError> {
		let query = r#"
            query ScriptUtxos($payload: String!) {
                scriptUtxos(scriptType: "p2pkh", payload: $payload) {
                    txid
                    outIdx
                    value
                    blockHeight
                }
            }
        "#;

		let utxos: Vec<RawUtxo> = self
			.query_field("scriptUtxos", query, json!({ "payload": script_hash }))
			.await?;

		debug!("Fetched {} utxos for script {}", utxos.len(), script_hash);
		Ok(utxos)
	}
}

#[async_trait::async_trait]
impl IndexerService for ChronikIndexerClient {
	async fn get_utxo_snapshot(
		&self,
		addresses: &[AddressHandle],
	) -> Result<UtxoSnapshot, IndexerError> {
		let per_address = try_join_all(
			addresses
				.iter()
				.map(|address| self.get_script_utxos(&address.hash160)),
		)
		.await?;

		Ok(addresses.iter().cloned().zip(per_address).collect())
	}

	async fn hydrate_utxos(&self, utxos: &[RawUtxo]) -> Result<Vec<UtxoEnrichment>, IndexerError> {
		if utxos.is_empty() {
			return Ok(Vec::new());
		}

		let query = r#"
            query ValidateUtxos($outpoints: [OutPointInput!]!) {
                validateUtxos(outpoints: $outpoints) {
                    txid
                    outIdx
                    isToken
                    tokenId
                    tokenAmount
                }
            }
        "#;

		let outpoints: Vec<serde_json::Value> = utxos
			.iter()
			.map(|utxo| json!({ "txid": utxo.txid, "outIdx": utxo.output_index }))
			.collect();

		self.query_field("validateUtxos", query, json!({ "outpoints": outpoints }))
			.await
	}

	async fn get_transaction(&self, txid: &str) -> Result<RawTx, IndexerError> {
		let query = format!(
			r#"
            query Tx($txid: String!) {{
                tx(txid: $txid) {{ {} }}
            }}
            "#,
			TX_FIELDS
		);

		self.query_field("tx", &query, json!({ "txid": txid })).await
	}

	async fn get_token_genesis(&self, token_id: &str) -> Result<TokenGenesis, IndexerError> {
		// The token id is the txid of its genesis transaction
		let genesis_tx = self.get_transaction(token_id).await?;

		genesis_tx
			.slp_tx_data
			.and_then(|data| data.genesis_info)
			.map(TokenGenesis::from)
			.ok_or_else(|| {
				IndexerError::Malformed(format!("Transaction {} carries no genesis info", token_id))
			})
	}

	async fn get_tx_history(
		&self,
		script_hash: &str,
		count: usize,
	) -> Result<Vec<RawTx>, IndexerError> {
		let query = format!(
			r#"
            query History($payload: String!, $pageSize: Int!) {{
                scriptHistory(
                    scriptType: "p2pkh", payload: $payload, page: 0, pageSize: $pageSize
                ) {{
                    txs {{ {} }}
                }}
            }}
            "#,
			TX_FIELDS
		);

		#[derive(serde::Deserialize)]
		struct HistoryPage {
			txs: Vec<serde_json::Value>,
		}

		let page: HistoryPage = self
			.query_field(
				"scriptHistory",
				&query,
				json!({ "payload": script_hash, "pageSize": count }),
			)
			.await?;

		Ok(decode_history(script_hash, page.txs))
	}

	fn endpoint(&self) -> &str {
		&self.indexer_url
	}
}

/// Decode the transactions of a history page, dropping those that do not decode.
fn decode_history(script_hash: &str, txs: Vec<serde_json::Value>) -> Vec<RawTx> {
	txs.into_iter()
		.filter_map(|tx| {
			let txid = tx
				.get("txid")
				.and_then(|txid| txid.as_str())
				.unwrap_or("<unknown>")
				.to_string();
			match serde_json::from_value::<RawTx>(tx) {
				Ok(tx) => Some(tx),
				Err(e) => {
					warn!(
						"Skipping undecodable tx {} in history of {}: {}",
						txid, script_hash, e
					);
					None
				}
			}
		})
		.collect()
}
