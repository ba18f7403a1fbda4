//! Chain-sync service for a single coin.
//!
//! The service keeps a persisted `{height, hash}` cursor of the best block,
//! ingests transactions touching the wallet address into the [`Datastore`],
//! detects reorganizations when new blocks arrive, and rebroadcasts our own
//! transactions while they stay unconfirmed. Relevant transactions are handed to
//! the registered listeners.
//!
//! Every block or transaction notification is processed on its own task, so
//! block and transaction handling may overlap. Errors are logged and abandon
//! only the event that caused them.

use crate::indexer::{ApiClient, Block, Transaction};
use crate::wallet::listeners::ListenerRegistry;
use crate::wallet::store::{Cacher, Datastore, SignedMessageDecoder};
use crate::wallet::{
	HashAndHeight, TransactionCallback, TransactionInput, TransactionOutput, Txn, WalletSyncError,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Per-coin settings of [`WalletSyncService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
	/// Coin code, also part of the cursor cache key.
	pub coin: String,
	/// The wallet address to track.
	pub address: String,
	/// Decimal places between a coin and its base unit.
	pub coin_decimals: u32,
}

impl Default for ServiceConfig {
	fn default() -> Self {
		Self {
			coin: "BTC".to_string(),
			address: String::new(),
			coin_decimals: 8,
		}
	}
}

/// Cache key of the persisted cursor for `coin`.
pub fn best_height_key(coin: &str) -> String {
	format!("best-height-{}", coin)
}

/// Net effect of a transaction on the wallet.
#[derive(Debug, Default)]
struct NetFlow {
	value: i64,
	hits: usize,
	inputs: Vec<TransactionInput>,
	outputs: Vec<TransactionOutput>,
}

#[derive(Clone)]
pub struct WalletSyncService {
	inner: Arc<ServiceInner>,
}

struct ServiceInner {
	config: ServiceConfig,
	client: Arc<dyn ApiClient>,
	datastore: Arc<dyn Datastore>,
	cache: Arc<dyn Cacher>,
	decoder: Option<Arc<dyn SignedMessageDecoder>>,
	tip: RwLock<HashAndHeight>,
	listeners: ListenerRegistry,
	done: watch::Sender<bool>,
	running: AtomicBool,
}

fn from_unix(secs: i64) -> DateTime<Utc> {
	DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

impl WalletSyncService {
	/// Create a service, restoring the cursor from `cache` when present.
	///
	/// # Arguments
	/// * `config` - Coin, wallet address and decimals.
	/// * `client` - Indexer backend for this coin.
	/// * `datastore` - Where wallet transactions are recorded.
	/// * `cache` - Durable store for the chain cursor.
	/// * `decoder` - Optional signed-message decoder for account chains.
	pub async fn new(
		config: ServiceConfig,
		client: Arc<dyn ApiClient>,
		datastore: Arc<dyn Datastore>,
		cache: Arc<dyn Cacher>,
		decoder: Option<Arc<dyn SignedMessageDecoder>>,
	) -> Self {
		let tip = match cache.get(&best_height_key(&config.coin)).await {
			Ok(Some(bytes)) => match serde_json::from_slice::<HashAndHeight>(&bytes) {
				Ok(tip) => tip,
				Err(e) => {
					error!("Failed unmarshaling cached {} block height: {}", config.coin, e);
					HashAndHeight::default()
				}
			},
			Ok(None) => {
				info!("Cached {} block height missing: using default", config.coin);
				HashAndHeight::default()
			}
			Err(e) => {
				warn!("Error reading cached {} block height: {}", config.coin, e);
				HashAndHeight::default()
			}
		};

		let (done, _) = watch::channel(false);
		Self {
			inner: Arc::new(ServiceInner {
				config,
				client,
				datastore,
				cache,
				decoder,
				tip: RwLock::new(tip),
				listeners: ListenerRegistry::new(),
				done,
				running: AtomicBool::new(false),
			}),
		}
	}

	fn coin(&self) -> &str {
		&self.inner.config.coin
	}

	/// Start consuming block and transaction notifications.
	pub fn start(&self) {
		info!("Starting {} sync service", self.coin());
		self.inner.done.send_replace(false);
		if self.inner.running.swap(true, Ordering::SeqCst) {
			return;
		}
		let service = self.clone();
		let span = info_span!("sync", coin = %self.coin());
		tokio::spawn(service.run().instrument(span));
	}

	/// Stop the event loop. Safe to call repeatedly.
	pub fn stop(&self) {
		self.inner.done.send_replace(true);
	}

	async fn run(self) {
		loop {
			let stopped = self.event_loop().await;
			if !self.resume_after_exit(stopped) {
				break;
			}
			debug!("{} sync service restarted while stopping", self.coin());
		}
		debug!("{} sync service stopped", self.coin());
	}

	/// Release the running flag. Returns true when a `start` arrived after the
	/// loop saw the stop, in which case the flag is held again.
	fn resume_after_exit(&self, stopped: bool) -> bool {
		self.inner.running.store(false, Ordering::SeqCst);
		stopped && !*self.inner.done.borrow() && !self.inner.running.swap(true, Ordering::SeqCst)
	}

	/// Consume notifications until stopped (true) or the client goes away (false).
	async fn event_loop(&self) -> bool {
		let client = &self.inner.client;
		let mut transactions = client.transaction_notify();
		let mut blocks = client.block_notify();
		let mut done = self.inner.done.subscribe();
		client.listen_addresses(std::slice::from_ref(&self.inner.config.address));

		loop {
			if *done.borrow_and_update() {
				return true;
			}
			tokio::select! {
				changed = done.changed() => {
					if changed.is_err() {
						return true;
					}
				}
				tx = transactions.recv() => match tx {
					Ok(tx) => {
						let service = self.clone();
						tokio::spawn(
							async move { service.process_incoming_transaction(tx).await }
								.in_current_span(),
						);
					}
					Err(RecvError::Lagged(n)) => warn!("Missed {} transaction notifications", n),
					Err(RecvError::Closed) => return false,
				},
				block = blocks.recv() => match block {
					Ok(block) => {
						let service = self.clone();
						tokio::spawn(
							async move { service.process_incoming_block(block).await }
								.in_current_span(),
						);
					}
					Err(RecvError::Lagged(n)) => warn!("Missed {} block notifications", n),
					Err(RecvError::Closed) => return false,
				},
			}
		}
	}

	/// Current cursor as `(height, hash)`.
	pub async fn chain_tip(&self) -> (u64, String) {
		let tip = self.inner.tip.read().await;
		(tip.height, tip.hash.clone())
	}

	pub fn add_transaction_listener<F>(&self, listener: F)
	where
		F: Fn(TransactionCallback) + Send + Sync + 'static,
	{
		self.inner.listeners.register(Arc::new(listener));
	}

	/// Hand `callback` to every listener concurrently.
	pub fn invoke_transaction_listeners(&self, callback: &TransactionCallback) {
		self.inner.listeners.dispatch(callback);
	}

	/// Ingest a transaction fresh off the wire or from our own broadcast.
	pub async fn process_incoming_transaction(&self, tx: Transaction) {
		debug!("New incoming {} transaction: {}", self.coin(), tx.txid);
		let chain_height = self.inner.tip.read().await.height;
		self.save_single_tx_to_db(tx, chain_height).await;
	}

	/// Refresh the cursor from the best block, then re-sync the wallet's
	/// transactions even if the height query failed.
	pub async fn update_state(&self) {
		debug!("Updating {} chain state", self.coin());
		match self.inner.client.get_best_block().await {
			Ok(best) => {
				debug!("{} chain height: {}", self.coin(), best.height);
				let mut tip = self.inner.tip.write().await;
				if let Err(e) = self.save_hash_and_height(&mut tip, &best.hash, best.height).await {
					error!("Error updating {} blockchain height: {}", self.coin(), e);
				}
			}
			Err(e) => error!("Error querying API for {} chain height: {}", self.coin(), e),
		}

		self.sync_txs().await;
	}

	async fn sync_txs(&self) {
		debug!("Querying for {} transactions", self.coin());
		let addresses = std::slice::from_ref(&self.inner.config.address);
		match self.inner.client.get_transactions(addresses).await {
			Ok(txs) => {
				debug!("Downloaded {} {} transactions", txs.len(), self.coin());
				let chain_height = self.inner.tip.read().await.height;
				for tx in txs {
					self.save_single_tx_to_db(tx, chain_height).await;
				}
			}
			Err(e) => error!("Error downloading txs for {}: {}", self.coin(), e),
		}
	}

	/// Advance the cursor to `block`, rescanning on a reorg, otherwise
	/// rechecking every unconfirmed transaction.
	pub async fn process_incoming_block(&self, block: Block) {
		info!(
			"Received new {} block at height {}: {}",
			self.coin(),
			block.height,
			block.hash
		);

		let current_best = {
			let mut tip = self.inner.tip.write().await;
			let current_best = tip.hash.clone();
			if let Err(e) = self.save_hash_and_height(&mut tip, &block.hash, block.height).await {
				error!("Error updating {} blockchain height: {}", self.coin(), e);
			}
			current_best
		};

		if current_best != block.previous_block_hash && current_best != block.hash {
			warn!("{} chain reorg detected: rescanning wallet", self.coin());
			self.update_state().await;
			return;
		}

		let txns = match self.inner.datastore.get_all(true).await {
			Ok(txns) => txns,
			Err(e) => {
				error!("Error loading {} txs from db: {}", self.coin(), e);
				return;
			}
		};
		let rechecks = txns
			.into_iter()
			.filter(|txn| txn.height == 0)
			.map(|txn| self.recheck_unconfirmed(txn, block.height));
		join_all(rechecks).await;
	}

	async fn recheck_unconfirmed(&self, txn: Txn, block_height: u64) {
		debug!("Rechecking unconfirmed {} txid {}", self.coin(), txn.txid);
		let tx = match self.inner.client.get_transaction(&txn.txid).await {
			Ok(tx) => tx,
			Err(e) => {
				error!("Error fetching unconfirmed {} tx {}: {}", self.coin(), txn.txid, e);
				return;
			}
		};
		if tx.confirmations > 0 {
			self.save_single_tx_to_db(tx, block_height).await;
			return;
		}

		// Incoming transactions are not ours to rebroadcast.
		if txn.value > 0 {
			return;
		}
		match self.inner.client.broadcast(&txn.bytes).await {
			Ok(txid) => info!("Rebroadcast unconfirmed {} tx {}", self.coin(), txid),
			Err(e) => error!("Error rebroadcasting {} tx {}: {}", self.coin(), txn.txid, e),
		}
	}

	/// Record `tx` if it is relevant to the wallet, logging any failure.
	pub async fn save_single_tx_to_db(&self, tx: Transaction, chain_height: u64) {
		let txid = tx.txid.clone();
		if let Err(e) = self.ingest(tx, chain_height).await {
			error!("Error saving {} txid ({}): {}", self.coin(), txid, e);
		}
	}

	async fn ingest(&self, tx: Transaction, chain_height: u64) -> Result<(), WalletSyncError> {
		let height = if tx.confirmations > 0 {
			chain_height.saturating_sub(u64::from(tx.confirmations) - 1)
		} else {
			0
		};

		let flow = self.net_flow(&tx);
		if flow.hits == 0 || flow.value == 0 {
			warn!("Abort saving irrelevant txid ({}) to db", tx.txid);
			return Ok(());
		}

		let mut callback = TransactionCallback {
			txid: tx.txid.clone(),
			inputs: flow.inputs,
			outputs: flow.outputs,
			height,
			timestamp: from_unix(tx.time),
			value: flow.value,
			watch_only: false,
		};

		match self.inner.datastore.get(&tx.txid).await? {
			None => {
				let timestamp = if tx.confirmations > 0 {
					from_unix(tx.block_time)
				} else {
					Utc::now()
				};
				let (txid, bytes) = self.match_signed_message(&tx).await?;
				self.inner
					.datastore
					.put(Txn {
						txid: txid.clone(),
						value: flow.value,
						height,
						timestamp,
						watch_only: flow.hits == 0,
						bytes,
					})
					.await?;

				callback.txid = txid;
				callback.timestamp = timestamp;
				self.invoke_transaction_listeners(&callback);
			}
			Some(saved) if height > 0 => {
				self.inner
					.datastore
					.update_height(&tx.txid, height, from_unix(tx.block_time))
					.await?;
				if saved.height != height {
					callback.timestamp = saved.timestamp;
					self.invoke_transaction_listeners(&callback);
				}
			}
			Some(_) => debug!("{} txid {} already recorded", self.coin(), tx.txid),
		}
		Ok(())
	}

	/// Id and bytes to store `tx` under. A stored signed message wrapping `tx`
	/// takes precedence over the announced id.
	async fn match_signed_message(
		&self,
		tx: &Transaction,
	) -> Result<(String, Vec<u8>), WalletSyncError> {
		if let Some(decoder) = &self.inner.decoder {
			for stored in self.inner.datastore.get_all(true).await? {
				if let Some((message_id, signed_id)) = decoder.decode_ids(&stored.bytes) {
					if message_id == tx.txid {
						debug!("Matched {} to signed message {}", tx.txid, signed_id);
						return Ok((signed_id, stored.bytes));
					}
				}
			}
		}
		Ok((tx.txid.clone(), tx.raw_bytes.clone()))
	}

	fn to_base_units(&self, value: f64) -> i64 {
		(value * 10f64.powi(self.inner.config.coin_decimals as i32)).round() as i64
	}

	/// Hits and net value of `tx` for the wallet address.
	///
	/// Own inputs with a value are debited. Own outputs are credited, except on
	/// account chains (inputs without values) where a send debits the outputs
	/// going elsewhere.
	fn net_flow(&self, tx: &Transaction) -> NetFlow {
		let own = self.inner.config.address.as_str();
		let mut flow = NetFlow::default();
		let mut sender = false;
		let mut valued_inputs = false;

		for input in &tx.inputs {
			let is_own = !input.addr.is_empty() && input.addr == own;
			if is_own {
				sender = true;
				flow.hits += 1;
			}
			let Some(value) = input.value else {
				continue;
			};
			let value = self.to_base_units(value);
			flow.inputs.push(TransactionInput {
				outpoint_hash: input.txid.clone(),
				outpoint_index: input.vout,
				linked_address: input.addr.clone(),
				value,
			});
			if is_own {
				valued_inputs = true;
				flow.value -= value;
			}
		}

		for (index, output) in tx.outputs.iter().enumerate() {
			let Some(address) = output.address() else {
				continue;
			};
			let value = self.to_base_units(output.value);
			flow.outputs.push(TransactionOutput {
				address: address.to_string(),
				value,
				index: index as u32,
			});

			let is_own = address == own;
			if is_own {
				flow.hits += 1;
			}
			match (sender, is_own) {
				(false, true) => flow.value += value,
				(true, true) if valued_inputs => flow.value += value,
				(true, false) if !valued_inputs => flow.value -= value,
				_ => {}
			}
		}
		flow
	}

	async fn save_hash_and_height(
		&self,
		tip: &mut HashAndHeight,
		hash: &str,
		height: u64,
	) -> Result<(), WalletSyncError> {
		*tip = HashAndHeight {
			height,
			hash: hash.to_string(),
			timestamp: Utc::now(),
		};
		let bytes = serde_json::to_vec_pretty(&*tip)?;
		self.inner
			.cache
			.set(&best_height_key(self.coin()), &bytes)
			.await
	}
}
