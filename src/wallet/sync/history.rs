//! Transaction history classification.

use crate::indexer::{RawTx, TxOutput};
use crate::utils::scale_amount;
use crate::wallet::{Direction, TxHistoryEntry, XEC_DECIMALS};

use rust_decimal::Decimal;
use tracing::warn;

/// Classifies raw transactions relative to a set of wallet script hashes.
#[derive(Debug, Clone)]
pub struct TxHistoryParser {
    wallet_hashes: Vec<String>,
}

impl TxHistoryParser {
    pub fn new(wallet_hashes: Vec<String>) -> Self {
        Self { wallet_hashes }
    }

    fn is_wallet_script(&self, script: &str) -> bool {
        self.wallet_hashes.iter().any(|hash| script.contains(hash.as_str()))
    }

    /// Classify `tx`.
    ///
    /// Outgoing when any input spends a wallet script. Incoming amounts count outputs paid to
    /// the wallet; outgoing amounts count outputs paid elsewhere, so change is excluded.
    /// `token_decimals` scales the token amount; without it the amount stays in base units.
    pub fn parse(&self, tx: &RawTx, token_decimals: Option<u32>) -> TxHistoryEntry {
        let direction = if tx
            .inputs
            .iter()
            .any(|input| self.is_wallet_script(&input.output_script))
        {
            Direction::Outgoing
        } else {
            Direction::Incoming
        };

        let counted: Vec<&TxOutput> = tx
            .outputs
            .iter()
            .filter(|output| match direction {
                Direction::Incoming => self.is_wallet_script(&output.output_script),
                Direction::Outgoing => !self.is_wallet_script(&output.output_script),
            })
            .collect();

        let satoshis: u64 = counted.iter().map(|output| output.value).sum();
        let native_amount = scale_amount(satoshis.into(), XEC_DECIMALS).unwrap_or_else(|e| {
            warn!("Tx {}: {}", tx.txid, e);
            Decimal::from(satoshis)
        });

        let token_id = tx
            .slp_tx_data
            .as_ref()
            .map(|data| data.slp_meta.token_id.clone());

        let token_amount = token_id
            .as_ref()
            .map(|_| self.token_amount(&tx.txid, &counted, token_decimals));

        TxHistoryEntry {
            txid: tx.txid.clone(),
            direction,
            native_amount,
            token_id,
            token_amount,
        }
    }

    fn token_amount(&self, txid: &str, outputs: &[&TxOutput], decimals: Option<u32>) -> Decimal {
        let raw: u128 = outputs
            .iter()
            .filter_map(|output| output.slp_token.as_ref())
            .map(|token| match token.amount.parse::<u128>() {
                Ok(amount) => amount,
                Err(e) => {
                    warn!(
                        "Tx {}: undecodable token amount '{}' counted as zero: {}",
                        txid, token.amount, e
                    );
                    0
                }
            })
            .sum();

        match decimals {
            Some(decimals) => scale_amount(raw, decimals).unwrap_or_else(|e| {
                warn!("Tx {}: {}", txid, e);
                Decimal::from(raw)
            }),
            None => Decimal::from(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::{SlpMeta, SlpToken, SlpTxData, TxInput};
    use std::str::FromStr;

    const WALLET: &str = "1111111111111111111111111111111111111111";
    const OTHER: &str = "2222222222222222222222222222222222222222";

    fn p2pkh(hash: &str) -> String {
        format!("76a914{}88ac", hash)
    }

    fn input(hash: &str, value: u64) -> TxInput {
        TxInput {
            output_script: p2pkh(hash),
            value,
        }
    }

    fn output(hash: &str, value: u64, token: Option<&str>) -> TxOutput {
        TxOutput {
            output_script: p2pkh(hash),
            value,
            slp_token: token.map(|amount| SlpToken {
                amount: amount.to_string(),
                is_mint_baton: false,
            }),
        }
    }

    fn tx(inputs: Vec<TxInput>, outputs: Vec<TxOutput>, token_id: Option<&str>) -> RawTx {
        RawTx {
            txid: "feed".to_string(),
            inputs,
            outputs,
            slp_tx_data: token_id.map(|id| SlpTxData {
                slp_meta: SlpMeta {
                    token_id: id.to_string(),
                    tx_type: Some("SEND".to_string()),
                },
                genesis_info: None,
            }),
            time_first_seen: 0,
        }
    }

    fn parser() -> TxHistoryParser {
        TxHistoryParser::new(vec![WALLET.to_string()])
    }

    #[test]
    fn incoming_counts_wallet_outputs() {
        let raw = tx(
            vec![input(OTHER, 10_000)],
            vec![output(WALLET, 4_200, None), output(OTHER, 5_500, None)],
            None,
        );

        let entry = parser().parse(&raw, None);
        assert_eq!(entry.direction, Direction::Incoming);
        assert_eq!(entry.native_amount, Decimal::from_str("42.00").unwrap());
        assert!(entry.token_id.is_none());
    }

    #[test]
    fn outgoing_counts_external_outputs() {
        let raw = tx(
            vec![input(WALLET, 10_000)],
            vec![output(OTHER, 3_000, None), output(WALLET, 6_800, None)],
            None,
        );

        let entry = parser().parse(&raw, None);
        assert_eq!(entry.direction, Direction::Outgoing);
        assert_eq!(entry.native_amount.to_string(), "30.00");
    }

    #[test]
    fn tokens_sent_elsewhere_give_zero_delta() {
        let raw = tx(
            vec![input(OTHER, 2_000)],
            vec![
                output(OTHER, 0, None),
                output(WALLET, 546, None),
                output(OTHER, 546, Some("500")),
            ],
            Some("tok"),
        );

        let entry = parser().parse(&raw, Some(2));
        assert_eq!(entry.direction, Direction::Incoming);
        assert_eq!(entry.native_amount.to_string(), "5.46");
        assert_eq!(entry.token_id.as_deref(), Some("tok"));
        assert_eq!(entry.token_amount, Some(Decimal::ZERO));
    }

    #[test]
    fn received_tokens_are_scaled() {
        let raw = tx(
            vec![input(OTHER, 2_000)],
            vec![output(WALLET, 546, Some("100")), output(WALLET, 546, Some("250"))],
            Some("tok"),
        );

        let entry = parser().parse(&raw, Some(2));
        assert_eq!(entry.token_amount.map(|a| a.to_string()).as_deref(), Some("3.50"));

        let unscaled = parser().parse(&raw, None);
        assert_eq!(unscaled.token_amount, Some(Decimal::from(350)));
    }

    #[test]
    fn undecodable_token_amount_counts_as_zero() {
        let raw = tx(
            vec![input(OTHER, 2_000)],
            vec![output(WALLET, 546, Some("not-a-number")), output(WALLET, 546, Some("7"))],
            Some("tok"),
        );

        let entry = parser().parse(&raw, Some(0));
        assert_eq!(entry.token_amount, Some(Decimal::from(7)));
    }
}
