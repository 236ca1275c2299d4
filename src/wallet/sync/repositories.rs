use crate::wallet::WalletSyncError;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Durable byte store keyed by string
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, WalletSyncError>;
	async fn set(&self, key: &str, value: &[u8]) -> Result<(), WalletSyncError>;
}

/// File-based implementation of KeyValueStore, one file per key
pub struct FileKeyValueStore {
	data_dir: PathBuf,
}

impl FileKeyValueStore {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn get_filename(&self, key: &str) -> PathBuf {
		self.data_dir
			.join(format!("kv_{}.json", hex::encode(key.as_bytes())))
	}
}

#[async_trait::async_trait]
impl KeyValueStore for FileKeyValueStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, WalletSyncError> {
		let filename = self.get_filename(key);

		match tokio::fs::read(&filename).await {
			Ok(bytes) => {
				debug!("Loaded {} bytes for '{}' from {:?}", bytes.len(), key, filename);
				Ok(Some(bytes))
			}
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
			Err(e) => Err(WalletSyncError::Storage(format!(
				"Failed to read {:?}: {}",
				filename, e
			))),
		}
	}

	async fn set(&self, key: &str, value: &[u8]) -> Result<(), WalletSyncError> {
		tokio::fs::create_dir_all(&self.data_dir)
			.await
			.map_err(|e| {
				WalletSyncError::Storage(format!(
					"Failed to create data directory {:?}: {}",
					self.data_dir, e
				))
			})?;

		// Write a sibling file, then rename it over the target
		let filename = self.get_filename(key);
		let tmp_filename = filename.with_extension("json.tmp");
		tokio::fs::write(&tmp_filename, value)
			.await
			.map_err(|e| {
				WalletSyncError::Storage(format!("Failed to write {:?}: {}", tmp_filename, e))
			})?;
		tokio::fs::rename(&tmp_filename, &filename)
			.await
			.map_err(|e| {
				WalletSyncError::Storage(format!("Failed to replace {:?}: {}", filename, e))
			})?;

		info!("Saved '{}' to {:?}", key, filename);
		Ok(())
	}
}

/// In-memory implementation of KeyValueStore
#[derive(Default)]
pub struct MemoryKeyValueStore {
	entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryKeyValueStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, WalletSyncError> {
		Ok(self.entries.lock().await.get(key).cloned())
	}

	async fn set(&self, key: &str, value: &[u8]) -> Result<(), WalletSyncError> {
		self.entries
			.lock()
			.await
			.insert(key.to_string(), value.to_vec());
		Ok(())
	}
}
