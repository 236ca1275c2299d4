//! Balance aggregation.
//!
//! Turns the hydrated UTXO set into the spendable native balance and per-token balances. Token
//! metadata (decimals, name, ticker) is fetched once per token from its genesis record and then
//! served from the aggregator's own table, which also keeps tokens whose balance dropped to zero.

use crate::indexer::IndexerService;
use crate::utils::scale_amount;
use crate::wallet::{
    AddressMap, HydratedUtxo, TokenBalance, WalletBalance, WalletSyncError, XEC_DECIMALS,
};

use itertools::Itertools;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Largest number of token decimals an exact decimal can represent.
const MAX_TOKEN_DECIMALS: u32 = 28;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceAggregator {
    tokens: BTreeMap<String, TokenBalance>,
}

impl BalanceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a persisted token table.
    pub fn from_tokens(tokens: impl IntoIterator<Item = TokenBalance>) -> Self {
        Self {
            tokens: tokens
                .into_iter()
                .map(|token| (token.token_id.clone(), token))
                .collect(),
        }
    }

    pub fn tokens(&self) -> impl Iterator<Item = &TokenBalance> {
        self.tokens.values()
    }

    pub fn token(&self, token_id: &str) -> Option<&TokenBalance> {
        self.tokens.get(token_id)
    }

    /// Sum of non-token outputs, in satoshis and in XEC.
    pub fn spendable_balance(
        utxos: &AddressMap<HydratedUtxo>,
    ) -> Result<WalletBalance, WalletSyncError> {
        let satoshis: u64 = utxos
            .items()
            .filter(|utxo| !utxo.is_token_utxo)
            .map(|utxo| utxo.utxo.value)
            .sum();

        Ok(WalletBalance {
            spendable_satoshis: satoshis,
            spendable_display: scale_amount(satoshis.into(), XEC_DECIMALS)?,
        })
    }

    /// Recompute all balances from `utxos`.
    ///
    /// Unknown tokens are looked up once. A token whose genesis record is malformed is skipped for
    /// this round; a network failure aborts and leaves the token table unchanged.
    pub async fn aggregate(
        &mut self,
        indexer: &dyn IndexerService,
        utxos: &AddressMap<HydratedUtxo>,
    ) -> Result<WalletBalance, WalletSyncError> {
        let balance = Self::spendable_balance(utxos)?;

        let grouped = utxos
            .items()
            .filter(|utxo| utxo.is_token_utxo)
            .filter_map(|utxo| match &utxo.token_id {
                Some(token_id) => Some((token_id.clone(), utxo.token_amount.unwrap_or(0))),
                None => {
                    warn!(
                        "Token utxo {}:{} carries no token id",
                        utxo.utxo.txid, utxo.utxo.output_index
                    );
                    None
                }
            })
            .into_group_map();

        let mut tokens = self.tokens.clone();
        for token in tokens.values_mut() {
            token.balance = Decimal::ZERO;
        }

        for (token_id, amounts) in grouped {
            if !tokens.contains_key(&token_id) {
                match fetch_metadata(indexer, &token_id).await {
                    Ok(token) => {
                        tokens.insert(token_id.clone(), token);
                    }
                    Err(WalletSyncError::MalformedData(reason)) => {
                        warn!("Skipping token {}: {}", token_id, reason);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(token) = tokens.get_mut(&token_id) {
                let raw: u128 = amounts.into_iter().map(u128::from).sum();
                token.balance = scale_amount(raw, token.decimals)?;
            }
        }

        self.tokens = tokens;
        Ok(balance)
    }

    /// Metadata of `token_id`, fetched and cached when unknown.
    pub async fn resolve_token(
        &mut self,
        indexer: &dyn IndexerService,
        token_id: &str,
    ) -> Result<&TokenBalance, WalletSyncError> {
        if !self.tokens.contains_key(token_id) {
            let token = fetch_metadata(indexer, token_id).await?;
            self.tokens.insert(token_id.to_string(), token);
        }

        self.tokens.get(token_id).ok_or_else(|| {
            WalletSyncError::InconsistentState(format!("Token {} vanished from cache", token_id))
        })
    }
}

async fn fetch_metadata(
    indexer: &dyn IndexerService,
    token_id: &str,
) -> Result<TokenBalance, WalletSyncError> {
    let genesis = indexer.get_token_genesis(token_id).await?;
    if genesis.decimals > MAX_TOKEN_DECIMALS {
        return Err(WalletSyncError::MalformedData(format!(
            "Token {} declares {} decimals",
            token_id, genesis.decimals
        )));
    }

    debug!(
        "Cached metadata for token {} ({}, {} decimals)",
        token_id, genesis.ticker, genesis.decimals
    );
    Ok(TokenBalance {
        token_id: token_id.to_string(),
        decimals: genesis.decimals,
        name: genesis.name,
        ticker: genesis.ticker,
        balance: Decimal::ZERO,
    })
}
