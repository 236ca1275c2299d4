//! In-memory indexer and push subscription used by the sync unit tests.

use crate::indexer::{
    IndexerError, IndexerService, PushEvent, PushSubscription, RawTx, RawUtxo, SlpMeta, SlpToken,
    SlpTxData, TokenGenesis, TxInput, TxOutput, UtxoEnrichment,
};
use crate::wallet::{AddressHandle, HydratedUtxo, UtxoSnapshot, WalletHandle};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const OTHER_HASH: &str = "9999999999999999999999999999999999999999";

pub fn handle(path: &str, byte: u8) -> AddressHandle {
    AddressHandle::new(format!("ecash:q{}", path), hex::encode([byte; 20]), path).unwrap()
}

pub fn single_address_wallet() -> (WalletHandle, AddressHandle) {
    let address = handle("1899", 1);
    (WalletHandle::new("main", vec![address.clone()]), address)
}

pub fn utxo(txid: &str, output_index: u32, value: u64) -> RawUtxo {
    RawUtxo {
        txid: txid.to_string(),
        output_index,
        value,
        confirmation_height: None,
    }
}

pub fn token_utxo(txid: &str, output_index: u32, token_id: &str, amount: u64) -> HydratedUtxo {
    HydratedUtxo {
        utxo: utxo(txid, output_index, 546),
        is_token_utxo: true,
        token_id: Some(token_id.to_string()),
        token_amount: Some(amount),
    }
}

pub fn p2pkh(hash160: &str) -> String {
    format!("76a914{}88ac", hash160)
}

/// A transaction paying `value` to `hash160` from a foreign script.
pub fn incoming_tx(txid: &str, hash160: &str, value: u64, time_first_seen: i64) -> RawTx {
    RawTx {
        txid: txid.to_string(),
        inputs: vec![TxInput {
            output_script: p2pkh(OTHER_HASH),
            value: value + 1000,
        }],
        outputs: vec![
            TxOutput {
                output_script: p2pkh(hash160),
                value,
                slp_token: None,
            },
            TxOutput {
                output_script: p2pkh(OTHER_HASH),
                value: 800,
                slp_token: None,
            },
        ],
        slp_tx_data: None,
        time_first_seen,
    }
}

/// A token transaction sending `amount` base units of `token_id` to `hash160`.
pub fn incoming_token_tx(txid: &str, hash160: &str, token_id: &str, amount: u64) -> RawTx {
    let mut tx = incoming_tx(txid, hash160, 546, 1);
    tx.outputs[0].slp_token = Some(SlpToken {
        amount: amount.to_string(),
        is_mint_baton: false,
    });
    tx.slp_tx_data = Some(SlpTxData {
        slp_meta: SlpMeta {
            token_id: token_id.to_string(),
            tx_type: Some("SEND".to_string()),
        },
        genesis_info: None,
    });
    tx
}

#[derive(Default)]
pub struct FakeIndexer {
    endpoint: String,
    snapshot: Mutex<UtxoSnapshot>,
    token_outputs: Mutex<HashMap<(String, u32), (String, u64)>>,
    genesis: Mutex<HashMap<String, TokenGenesis>>,
    txs: Mutex<HashMap<String, RawTx>>,
    history: Mutex<HashMap<String, Vec<RawTx>>>,
    malformed_history: Mutex<HashSet<String>>,
    failing: AtomicBool,
    history_failing: AtomicBool,
    hydrate_calls: AtomicUsize,
    genesis_calls: AtomicUsize,
}

impl FakeIndexer {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..Self::default()
        }
    }

    pub fn set_snapshot(&self, snapshot: UtxoSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    pub fn add_token_utxo(&self, txid: &str, output_index: u32, token_id: &str, amount: u64) {
        self.token_outputs.lock().unwrap().insert(
            (txid.to_string(), output_index),
            (token_id.to_string(), amount),
        );
    }

    pub fn add_genesis(&self, token_id: &str, decimals: u32, name: &str, ticker: &str) {
        self.genesis.lock().unwrap().insert(
            token_id.to_string(),
            TokenGenesis {
                decimals,
                name: name.to_string(),
                ticker: ticker.to_string(),
            },
        );
    }

    pub fn add_tx(&self, tx: RawTx) {
        self.txs.lock().unwrap().insert(tx.txid.clone(), tx);
    }

    pub fn set_history(&self, hash160: &str, txs: Vec<RawTx>) {
        self.history
            .lock()
            .unwrap()
            .insert(hash160.to_string(), txs);
    }

    /// Make the history page of `hash160` undecodable.
    pub fn set_malformed_history(&self, hash160: &str) {
        self.malformed_history
            .lock()
            .unwrap()
            .insert(hash160.to_string());
    }

    /// Fail history queries with a network error while other queries succeed.
    pub fn set_history_failing(&self, failing: bool) {
        self.history_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn hydrate_calls(&self) -> usize {
        self.hydrate_calls.load(Ordering::SeqCst)
    }

    pub fn genesis_calls(&self) -> usize {
        self.genesis_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), IndexerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(IndexerError::ServiceUnavailable(format!(
                "{} is down",
                self.endpoint
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl IndexerService for FakeIndexer {
    async fn get_utxo_snapshot(
        &self,
        addresses: &[AddressHandle],
    ) -> Result<UtxoSnapshot, IndexerError> {
        self.check_available()?;
        let snapshot = self.snapshot.lock().unwrap();
        Ok(addresses
            .iter()
            .filter_map(|address| {
                snapshot
                    .get(address)
                    .map(|utxos| (address.clone(), utxos.to_vec()))
            })
            .collect())
    }

    async fn hydrate_utxos(&self, utxos: &[RawUtxo]) -> Result<Vec<UtxoEnrichment>, IndexerError> {
        self.check_available()?;
        self.hydrate_calls.fetch_add(1, Ordering::SeqCst);
        let tokens = self.token_outputs.lock().unwrap();
        Ok(utxos
            .iter()
            .map(|utxo| {
                let token = tokens.get(&(utxo.txid.clone(), utxo.output_index));
                UtxoEnrichment {
                    txid: utxo.txid.clone(),
                    output_index: utxo.output_index,
                    is_token: token.is_some(),
                    token_id: token.map(|(id, _)| id.clone()),
                    token_amount: token.map(|(_, amount)| *amount),
                }
            })
            .collect())
    }

    async fn get_transaction(&self, txid: &str) -> Result<RawTx, IndexerError> {
        self.check_available()?;
        self.txs
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or(IndexerError::NoData)
    }

    async fn get_token_genesis(&self, token_id: &str) -> Result<TokenGenesis, IndexerError> {
        self.check_available()?;
        self.genesis_calls.fetch_add(1, Ordering::SeqCst);
        self.genesis
            .lock()
            .unwrap()
            .get(token_id)
            .cloned()
            .ok_or_else(|| IndexerError::Malformed(format!("no genesis for {}", token_id)))
    }

    async fn get_tx_history(
        &self,
        script_hash: &str,
        count: usize,
    ) -> Result<Vec<RawTx>, IndexerError> {
        self.check_available()?;
        if self.history_failing.load(Ordering::SeqCst) {
            return Err(IndexerError::ServiceUnavailable(format!(
                "{} history timed out",
                self.endpoint
            )));
        }
        if self.malformed_history.lock().unwrap().contains(script_hash) {
            return Err(IndexerError::Malformed(format!(
                "Unexpected shape for 'scriptHistory' of {}",
                script_hash
            )));
        }
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(script_hash)
            .map(|txs| txs.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Push subscription fed through a channel.
pub struct FakeSubscription {
    active: Arc<Mutex<BTreeSet<String>>>,
    events: mpsc::UnboundedReceiver<Result<PushEvent, IndexerError>>,
}

/// Test side of a [`FakeSubscription`].
pub struct FakeSubscriptionHandle {
    pub events: mpsc::UnboundedSender<Result<PushEvent, IndexerError>>,
    active: Arc<Mutex<BTreeSet<String>>>,
}

impl FakeSubscriptionHandle {
    pub fn active(&self) -> Vec<String> {
        self.active.lock().unwrap().iter().cloned().collect()
    }

    /// The server ending operation `script_hash` on its own.
    pub fn end_operation(&self, script_hash: &str) {
        self.active.lock().unwrap().remove(script_hash);
    }
}

impl FakeSubscription {
    pub fn new(active: &[&str]) -> (Self, FakeSubscriptionHandle) {
        let active = Arc::new(Mutex::new(
            active.iter().map(|hash| hash.to_string()).collect(),
        ));
        let (sender, events) = mpsc::unbounded_channel();
        (
            Self {
                active: active.clone(),
                events,
            },
            FakeSubscriptionHandle {
                events: sender,
                active,
            },
        )
    }
}

#[async_trait::async_trait]
impl PushSubscription for FakeSubscription {
    async fn subscribe(&mut self, script_hash: &str) -> Result<(), IndexerError> {
        self.active.lock().unwrap().insert(script_hash.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, script_hash: &str) -> Result<(), IndexerError> {
        self.active.lock().unwrap().remove(script_hash);
        Ok(())
    }

    fn list_active_subscriptions(&self) -> Vec<String> {
        self.active.lock().unwrap().iter().cloned().collect()
    }

    async fn next_event(&mut self) -> Option<Result<PushEvent, IndexerError>> {
        self.events.recv().await
    }
}
