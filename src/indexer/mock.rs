//! Scriptable [`ApiClient`] for service tests.

use super::{ApiClient, Block, BlockList, ErrorSink, IndexerError, Transaction, Utxo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct MockApiClient {
	pub best_block: Mutex<Option<Block>>,
	/// Served by `get_transaction`.
	pub transactions: Mutex<HashMap<String, Transaction>>,
	/// Served by `get_transactions` regardless of the addresses asked for.
	pub address_transactions: Mutex<Vec<Transaction>>,
	pub broadcasts: Mutex<Vec<Vec<u8>>>,
	pub listened: Mutex<Vec<String>>,
	pub best_block_calls: AtomicUsize,
	pub get_transactions_calls: AtomicUsize,
	pub block_tx: broadcast::Sender<Block>,
	pub transaction_tx: broadcast::Sender<Transaction>,
}

impl MockApiClient {
	pub fn new() -> Self {
		Self {
			best_block: Mutex::new(None),
			transactions: Mutex::new(HashMap::new()),
			address_transactions: Mutex::new(Vec::new()),
			broadcasts: Mutex::new(Vec::new()),
			listened: Mutex::new(Vec::new()),
			best_block_calls: AtomicUsize::new(0),
			get_transactions_calls: AtomicUsize::new(0),
			block_tx: broadcast::channel(16).0,
			transaction_tx: broadcast::channel(16).0,
		}
	}

	pub fn set_best_block(&self, block: Block) {
		*lock(&self.best_block) = Some(block);
	}

	pub fn add_transaction(&self, tx: Transaction) {
		lock(&self.transactions).insert(tx.txid.clone(), tx);
	}

	pub fn broadcasts(&self) -> Vec<Vec<u8>> {
		lock(&self.broadcasts).clone()
	}
}

#[async_trait]
impl ApiClient for MockApiClient {
	async fn get_best_block(&self) -> Result<Block, IndexerError> {
		self.best_block_calls.fetch_add(1, Ordering::SeqCst);
		lock(&self.best_block).clone().ok_or(IndexerError::ServerError {
			status: 503,
			body: String::new(),
		})
	}

	async fn get_transaction(&self, txid: &str) -> Result<Transaction, IndexerError> {
		lock(&self.transactions)
			.get(txid)
			.cloned()
			.ok_or(IndexerError::StatusError {
				status: 404,
				body: txid.to_string(),
			})
	}

	async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, IndexerError> {
		Ok(self.get_transaction(txid).await?.raw_bytes)
	}

	async fn get_transactions(&self, _addresses: &[String]) -> Result<Vec<Transaction>, IndexerError> {
		self.get_transactions_calls.fetch_add(1, Ordering::SeqCst);
		Ok(lock(&self.address_transactions).clone())
	}

	async fn get_utxos(&self, _addresses: &[String]) -> Result<Vec<Utxo>, IndexerError> {
		Ok(Vec::new())
	}

	async fn get_blocks_before(&self, _to: DateTime<Utc>, _limit: u32) -> Result<BlockList, IndexerError> {
		Ok(BlockList::default())
	}

	async fn estimate_fee(&self, _nb_blocks: u32) -> Result<u64, IndexerError> {
		Ok(0)
	}

	async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, IndexerError> {
		lock(&self.broadcasts).push(raw_tx.to_vec());
		Ok(hex::encode(raw_tx))
	}

	fn listen_addresses(&self, addresses: &[String]) {
		lock(&self.listened).extend(addresses.iter().cloned());
	}

	fn block_notify(&self) -> broadcast::Receiver<Block> {
		self.block_tx.subscribe()
	}

	fn transaction_notify(&self) -> broadcast::Receiver<Transaction> {
		self.transaction_tx.subscribe()
	}

	fn start(&self, _error_sink: ErrorSink) {}

	fn close(&self) {}
}
