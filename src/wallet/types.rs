use crate::indexer::IndexerError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted chain cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashAndHeight {
	pub height: u64,
	pub hash: String,
	pub timestamp: DateTime<Utc>,
}

/// A wallet transaction record as kept by the [`Datastore`](super::Datastore).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Txn {
	pub txid: String,
	/// Net value for the wallet in base units. Negative when funds left it.
	pub value: i64,
	/// Confirmed height, 0 while unconfirmed.
	pub height: u64,
	pub timestamp: DateTime<Utc>,
	pub watch_only: bool,
	/// Serialized transaction, used for rebroadcasts.
	pub bytes: Vec<u8>,
}

/// An input as reported to transaction listeners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
	pub outpoint_hash: String,
	pub outpoint_index: u32,
	pub linked_address: String,
	pub value: i64,
}

/// An output as reported to transaction listeners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
	pub address: String,
	pub value: i64,
	pub index: u32,
}

/// What listeners receive for every relevant transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCallback {
	pub txid: String,
	pub inputs: Vec<TransactionInput>,
	pub outputs: Vec<TransactionOutput>,
	pub height: u64,
	pub timestamp: DateTime<Utc>,
	pub value: i64,
	pub watch_only: bool,
}

/// Error types for the chain-sync service and its collaborators
#[derive(Debug, thiserror::Error)]
pub enum WalletSyncError {
	#[error("Indexer error: {0}")]
	IndexerError(#[from] IndexerError),

	#[error("Transaction not found: {0}")]
	NotFound(String),

	#[error("Serialization error: {0}")]
	SerializationError(#[from] serde_json::Error),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}
