//! Sync engine configuration from environment variables.
//!
//! Every setting has a default, so an empty environment yields a working configuration against
//! the public indexer.

use crate::wallet::{AddressHandle, WalletHandle, WalletSyncError};

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_INDEXER_URL: &str = "https://chronik.fabien.cash";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    /// Redundant indexer endpoints, tried in order
    pub indexer_urls: Vec<String>,
    /// Push subscription endpoint; polling only when absent
    pub ws_url: Option<String>,
    /// Directory of the durable state store
    pub data_dir: PathBuf,
    /// Poll interval while no push subscription is active
    pub refresh_disconnected: Duration,
    /// Poll interval while a push subscription is active
    pub refresh_connected: Duration,
    /// Interval right after a push event announced a new transaction
    pub refresh_triggered: Duration,
    /// UTXOs per enrichment request
    pub hydration_batch_size: usize,
    /// Transactions kept in the recent history
    pub tx_history_count: usize,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            indexer_urls: vec![DEFAULT_INDEXER_URL.to_string()],
            ws_url: None,
            data_dir: PathBuf::from("./data"),
            refresh_disconnected: Duration::from_millis(1000),
            refresh_connected: Duration::from_millis(30_000),
            refresh_triggered: Duration::from_millis(10),
            hydration_batch_size: 20,
            tx_history_count: 10,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `ECASH_INDEXER_URLS`: comma-separated indexer endpoints
    /// - `ECASH_WS_URL`: push subscription endpoint (optional)
    /// - `ECASH_DATA_DIR`: state directory (default `./data`)
    /// - `ECASH_REFRESH_DISCONNECTED_MS`, `ECASH_REFRESH_CONNECTED_MS`,
    ///   `ECASH_REFRESH_TRIGGERED_MS`
    /// - `ECASH_HYDRATION_BATCH_SIZE`, `ECASH_TX_HISTORY_COUNT`
    pub fn from_env() -> Result<Self, WalletSyncError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WalletSyncError> {
        let defaults = Self::default();

        let indexer_urls = match lookup("ECASH_INDEXER_URLS") {
            Some(raw) => {
                let urls: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect();
                if urls.is_empty() {
                    return Err(WalletSyncError::Config(
                        "ECASH_INDEXER_URLS contains no endpoint".to_string(),
                    ));
                }
                urls
            }
            None => defaults.indexer_urls,
        };
        info!("Indexer endpoints: {}", indexer_urls.join(", "));

        let ws_url = lookup("ECASH_WS_URL").filter(|url| !url.trim().is_empty());
        if let Some(ref url) = ws_url {
            info!("Push subscription endpoint: {}", url);
        }

        let data_dir = lookup("ECASH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let millis = |key: &str, default: Duration| -> Result<Duration, WalletSyncError> {
            Ok(parse_var::<u64>(&lookup, key)?
                .map(Duration::from_millis)
                .unwrap_or(default))
        };

        let hydration_batch_size = parse_var::<usize>(&lookup, "ECASH_HYDRATION_BATCH_SIZE")?
            .unwrap_or(defaults.hydration_batch_size);
        if hydration_batch_size == 0 {
            return Err(WalletSyncError::Config(
                "ECASH_HYDRATION_BATCH_SIZE must be positive".to_string(),
            ));
        }

        Ok(Self {
            indexer_urls,
            ws_url,
            data_dir,
            refresh_disconnected: millis(
                "ECASH_REFRESH_DISCONNECTED_MS",
                defaults.refresh_disconnected,
            )?,
            refresh_connected: millis("ECASH_REFRESH_CONNECTED_MS", defaults.refresh_connected)?,
            refresh_triggered: millis("ECASH_REFRESH_TRIGGERED_MS", defaults.refresh_triggered)?,
            hydration_batch_size,
            tx_history_count: parse_var::<usize>(&lookup, "ECASH_TX_HISTORY_COUNT")?
                .unwrap_or(defaults.tx_history_count),
            request_timeout: defaults.request_timeout,
        })
    }
}

/// Read the wallet to synchronize from `ECASH_WALLET_NAME` and `ECASH_WALLET_ADDRESSES`.
///
/// Addresses are comma separated `path|address|hash160` triples.
pub fn wallet_from_env() -> Result<WalletHandle, WalletSyncError> {
    wallet_from_lookup(|key| env::var(key).ok())
}

pub fn wallet_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<WalletHandle, WalletSyncError> {
    let name = lookup("ECASH_WALLET_NAME").unwrap_or_else(|| "default".to_string());
    let raw = lookup("ECASH_WALLET_ADDRESSES")
        .ok_or_else(|| WalletSyncError::Config("ECASH_WALLET_ADDRESSES is not set".to_string()))?;

    let addresses = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split('|').map(str::trim).collect();
            match parts.as_slice() {
                [path, address, hash160] => AddressHandle::new(*address, *hash160, *path),
                _ => Err(WalletSyncError::Config(format!(
                    "Expected path|address|hash160, got '{}'",
                    entry
                ))),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    if addresses.is_empty() {
        return Err(WalletSyncError::Config(
            "ECASH_WALLET_ADDRESSES contains no address".to_string(),
        ));
    }

    Ok(WalletHandle::new(name, addresses))
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, WalletSyncError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| WalletSyncError::Config(format!("Invalid {} '{}': {}", key, raw, e)))
        })
        .transpose()
}
