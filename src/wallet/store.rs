use crate::wallet::{Txn, WalletSyncError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

/// Wallet transaction storage.
#[async_trait::async_trait]
pub trait Datastore: Send + Sync {
	async fn get(&self, txid: &str) -> Result<Option<Txn>, WalletSyncError>;
	/// Insert or overwrite the record with `txn.txid`.
	async fn put(&self, txn: Txn) -> Result<(), WalletSyncError>;
	async fn update_height(
		&self,
		txid: &str,
		height: u64,
		timestamp: DateTime<Utc>,
	) -> Result<(), WalletSyncError>;
	async fn get_all(&self, include_unconfirmed: bool) -> Result<Vec<Txn>, WalletSyncError>;
}

/// Durable key-value cache.
#[async_trait::async_trait]
pub trait Cacher: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, WalletSyncError>;
	async fn set(&self, key: &str, value: &[u8]) -> Result<(), WalletSyncError>;
}

/// Recognizes stored transactions that are signed wrappers around a message.
///
/// Account chains may announce a transaction under the id of the unsigned
/// message while the wallet stored it under the id of the signed envelope.
pub trait SignedMessageDecoder: Send + Sync {
	/// `(message id, signed id)` of a serialized signed message, or `None` if
	/// `raw` is not one.
	fn decode_ids(&self, raw: &[u8]) -> Option<(String, String)>;
}

/// In-memory implementation of Datastore
#[derive(Default)]
pub struct MemoryDatastore {
	txns: RwLock<HashMap<String, Txn>>,
}

impl MemoryDatastore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl Datastore for MemoryDatastore {
	async fn get(&self, txid: &str) -> Result<Option<Txn>, WalletSyncError> {
		Ok(self.txns.read().await.get(txid).cloned())
	}

	async fn put(&self, txn: Txn) -> Result<(), WalletSyncError> {
		self.txns.write().await.insert(txn.txid.clone(), txn);
		Ok(())
	}

	async fn update_height(
		&self,
		txid: &str,
		height: u64,
		timestamp: DateTime<Utc>,
	) -> Result<(), WalletSyncError> {
		let mut txns = self.txns.write().await;
		let txn = txns
			.get_mut(txid)
			.ok_or_else(|| WalletSyncError::NotFound(txid.to_string()))?;
		txn.height = height;
		txn.timestamp = timestamp;
		Ok(())
	}

	async fn get_all(&self, include_unconfirmed: bool) -> Result<Vec<Txn>, WalletSyncError> {
		Ok(self
			.txns
			.read()
			.await
			.values()
			.filter(|t| include_unconfirmed || t.height > 0)
			.cloned()
			.collect())
	}
}

/// In-memory implementation of Cacher
#[derive(Default)]
pub struct MemoryCache {
	entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl Cacher for MemoryCache {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, WalletSyncError> {
		Ok(self.entries.read().await.get(key).cloned())
	}

	async fn set(&self, key: &str, value: &[u8]) -> Result<(), WalletSyncError> {
		self.entries
			.write()
			.await
			.insert(key.to_string(), value.to_vec());
		Ok(())
	}
}

/// File-based implementation of Cacher, one JSON file per key
pub struct FileCache {
	data_dir: PathBuf,
}

impl FileCache {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn get_filename(&self, key: &str) -> PathBuf {
		self.data_dir.join(format!("{}.json", key))
	}
}

#[async_trait::async_trait]
impl Cacher for FileCache {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, WalletSyncError> {
		match tokio::fs::read(self.get_filename(key)).await {
			Ok(bytes) => Ok(Some(bytes)),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	async fn set(&self, key: &str, value: &[u8]) -> Result<(), WalletSyncError> {
		tokio::fs::create_dir_all(&self.data_dir).await?;

		// Write to a temp file and rename so a crash never leaves half a cursor.
		let filename = self.get_filename(key);
		let tmp = self.data_dir.join(format!("{}.json.tmp", key));
		tokio::fs::write(&tmp, value).await?;
		tokio::fs::rename(&tmp, &filename).await?;

		debug!("Saved cache entry {:?}", filename);
		Ok(())
	}
}
