//! Blockbook client with push notifications and reconnect supervision.
//!
//! REST queries go through a [`Requester`]; per-address queries fan out with a
//! bounded number of requests in flight. New blocks and address activity arrive
//! over a socket.io push channel which is rebuilt by a watchdog whenever it
//! drops. All methods are async and designed for use with Tokio.

use super::fanout::fetch_bounded;
use super::request::{HttpRequester, Requester, validate_scheme};
use super::socket::{
	ADDRESS_TXID_EVENT, HASHBLOCK_EVENT, PushChannel, PushEvent, PushEventSender, PushTransport,
	SUBSCRIBE_EVENT, SocketIoTransport,
};
use super::types::*;
use super::watchdog::{StopSignal, WatchdogExit, retry_until_deadline, supervise};
use super::{ApiClient, ErrorSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

const NOTIFY_CAPACITY: usize = 256;

/// Tunables of [`BlockbookClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Client-side timeout of every REST call.
	pub request_timeout: Duration,
	/// Per-address fetches allowed in flight at once.
	pub max_concurrent_requests: usize,
	/// How long a dial may take to produce a connected channel.
	pub connect_timeout: Duration,
	/// Total time spent retrying a connect before giving up.
	pub reconnect_deadline: Duration,
	pub reconnect_retry_interval: Duration,
	pub watchdog_tick: Duration,
	/// Outbound HTTP proxy.
	pub proxy_url: Option<String>,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			request_timeout: Duration::from_secs(30),
			max_concurrent_requests: 25,
			connect_timeout: Duration::from_secs(10),
			reconnect_deadline: Duration::from_secs(10),
			reconnect_retry_interval: Duration::from_secs(2),
			watchdog_tick: Duration::from_secs(1),
			proxy_url: None,
		}
	}
}

/// Blockbook indexer client
#[derive(Clone)]
pub struct BlockbookClient {
	inner: Arc<ClientInner>,
}

struct ClientInner {
	coin: String,
	api_url: Url,
	config: ClientConfig,
	requester: Arc<dyn Requester>,
	transport: Arc<dyn PushTransport>,
	block_tx: broadcast::Sender<Block>,
	transaction_tx: broadcast::Sender<Transaction>,
	/// Live push channel, if connected.
	socket: RwLock<Option<Arc<dyn PushChannel>>>,
	/// Every address ever passed to `listen_addresses`. Lock before `socket`.
	listened: Mutex<BTreeSet<String>>,
	stopped: StopSignal,
	/// Bumped on every successful connect so events of a dead channel are ignored.
	generation: AtomicU64,
	done: watch::Sender<bool>,
	error_sink: Mutex<Option<ErrorSink>>,
	close_reported: AtomicBool,
	watchdog: Mutex<Watchdog>,
}

/// The running supervision task. `epoch` tells a finishing task whether the
/// slot still belongs to it.
#[derive(Default)]
struct Watchdog {
	epoch: u64,
	task: Option<JoinHandle<()>>,
}

#[derive(Deserialize)]
struct BackendInfo {
	blocks: u64,
	#[serde(rename = "bestBlockHash")]
	best_block_hash: String,
}

#[derive(Deserialize)]
struct IndexInfo {
	backend: BackendInfo,
}

#[derive(Deserialize)]
struct BlockIndex {
	#[serde(rename = "blockHash")]
	block_hash: String,
}

#[derive(Deserialize)]
struct AddressPage {
	#[serde(rename = "totalPages", default)]
	total_pages: u32,
	#[serde(default)]
	transactions: Vec<String>,
}

#[derive(Deserialize)]
struct BroadcastResult {
	txid: String,
}

#[derive(Deserialize)]
struct FeeRate(#[serde(deserialize_with = "deserialize_amount")] f64);

/// Input as the `tx` endpoint returns it: the spending address is the first
/// entry of `addresses`.
#[derive(Deserialize)]
struct WireInput {
	#[serde(default)]
	txid: String,
	#[serde(default)]
	vout: u32,
	#[serde(default)]
	sequence: u32,
	#[serde(default)]
	n: u32,
	#[serde(rename = "scriptSig", default)]
	script_sig: Script,
	#[serde(default)]
	addresses: Vec<String>,
	#[serde(default)]
	addr: String,
	#[serde(default, deserialize_with = "deserialize_optional_amount")]
	value: Option<f64>,
}

#[derive(Deserialize)]
struct WireTransaction {
	txid: String,
	#[serde(default)]
	version: i32,
	#[serde(default)]
	locktime: u32,
	#[serde(default)]
	vin: Vec<WireInput>,
	#[serde(default)]
	vout: Vec<Output>,
	#[serde(default)]
	blockhash: String,
	#[serde(default)]
	blockheight: i64,
	#[serde(default)]
	confirmations: u32,
	#[serde(default)]
	time: i64,
	#[serde(default)]
	blocktime: i64,
	#[serde(default)]
	hex: String,
}

impl TryFrom<WireTransaction> for Transaction {
	type Error = IndexerError;

	fn try_from(wire: WireTransaction) -> Result<Self, Self::Error> {
		let inputs = wire
			.vin
			.into_iter()
			.map(|i| Input {
				addr: i.addresses.into_iter().next().unwrap_or(i.addr),
				txid: i.txid,
				vout: i.vout,
				sequence: i.sequence,
				n: i.n,
				script_sig: i.script_sig,
				value: i.value,
			})
			.collect();

		Ok(Transaction {
			raw_bytes: hex::decode(&wire.hex)?,
			txid: wire.txid,
			version: wire.version,
			locktime: wire.locktime,
			inputs,
			outputs: wire.vout,
			block_hash: wire.blockhash,
			block_height: wire.blockheight,
			confirmations: wire.confirmations,
			time: wire.time,
			block_time: wire.blocktime,
		})
	}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BlockbookClient {
	/// Create a new client for one coin.
	///
	/// # Arguments
	/// * `coin` - Coin code, used in log messages.
	/// * `api_url` - Base URL of the blockbook REST API (`http` or `https`).
	/// * `config` - Timeouts, concurrency and proxy settings.
	///
	/// # Returns
	/// A client whose push channel is not started yet, or an `IndexerError` if
	/// the URL is unusable.
	pub fn new(coin: &str, api_url: &str, config: ClientConfig) -> Result<Self, IndexerError> {
		let api_url = Url::parse(api_url).map_err(|e| IndexerError::InvalidUrl(e.to_string()))?;
		validate_scheme(&api_url)?;

		let requester = HttpRequester::new(
			api_url.clone(),
			config.request_timeout,
			config.proxy_url.as_deref(),
		)?;
		let transport = SocketIoTransport::new(&api_url);
		Ok(Self::with_parts(
			coin,
			api_url,
			config,
			Arc::new(requester),
			Arc::new(transport),
		))
	}

	/// Create a client from explicit request and push implementations.
	pub fn with_parts(
		coin: &str,
		api_url: Url,
		config: ClientConfig,
		requester: Arc<dyn Requester>,
		transport: Arc<dyn PushTransport>,
	) -> Self {
		let (block_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
		let (transaction_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
		let (done, _) = watch::channel(false);

		Self {
			inner: Arc::new(ClientInner {
				coin: coin.to_string(),
				api_url,
				config,
				requester,
				transport,
				block_tx,
				transaction_tx,
				socket: RwLock::new(None),
				listened: Mutex::new(BTreeSet::new()),
				stopped: StopSignal::default(),
				generation: AtomicU64::new(0),
				done,
				error_sink: Mutex::new(None),
				close_reported: AtomicBool::new(false),
				watchdog: Mutex::new(Watchdog::default()),
			}),
		}
	}

	/// Whether the push channel is currently up.
	pub fn is_connected(&self) -> bool {
		self.inner
			.socket
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.is_some()
	}

	fn is_done(&self) -> bool {
		*self.inner.done.borrow()
	}

	fn report(&self, outcome: Result<(), IndexerError>) {
		if let Some(sink) = lock(&self.inner.error_sink).as_ref() {
			// The owner may have dropped its receiver.
			let _ = sink.send(outcome);
		}
	}

	fn teardown_socket(&self) {
		// Taken first so a concurrent connect cannot install a socket behind us.
		let _listened = lock(&self.inner.listened);
		let socket = self
			.inner
			.socket
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		if let Some(socket) = socket {
			socket.close();
		}
	}

	/// Connect the push channel and register subscriptions.
	///
	/// Retries on a fixed interval until the reconnect deadline passes.
	pub async fn setup_listeners(&self) -> Result<(), IndexerError> {
		let config = &self.inner.config;
		let (channel, events) = retry_until_deadline(
			config.reconnect_retry_interval,
			config.reconnect_deadline,
			|| self.connect_once(),
		)
		.await?;

		let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
		{
			let listened = lock(&self.inner.listened);
			if self.is_done() {
				channel.close();
				return Err(IndexerError::Closed);
			}
			*self
				.inner
				.socket
				.write()
				.unwrap_or_else(PoisonError::into_inner) = Some(channel.clone());
			self.subscribe(channel.as_ref(), &listened);
		}

		let client = self.clone();
		tokio::spawn(client.dispatch(generation, events).in_current_span());
		info!("Connected to websocket endpoint for {}", self.inner.coin);
		Ok(())
	}

	fn subscribe(&self, channel: &dyn PushChannel, addresses: &BTreeSet<String>) {
		if let Err(e) = channel.emit(SUBSCRIBE_EVENT, vec![json!(HASHBLOCK_EVENT)]) {
			warn!("Error subscribing to blocks: {}", e);
		}
		if addresses.is_empty() {
			return;
		}
		let addresses: Vec<&String> = addresses.iter().collect();
		if let Err(e) = channel.emit(
			SUBSCRIBE_EVENT,
			vec![json!(ADDRESS_TXID_EVENT), json!(addresses)],
		) {
			warn!("Error subscribing to addresses: {}", e);
		}
	}

	async fn connect_once(
		&self,
	) -> Result<(Arc<dyn PushChannel>, mpsc::UnboundedReceiver<PushEvent>), IndexerError> {
		if self.is_done() {
			return Err(IndexerError::Closed);
		}
		let (events_tx, mut events) = mpsc::unbounded_channel();
		match tokio::time::timeout(
			self.inner.config.connect_timeout,
			self.await_ready(events_tx, &mut events),
		)
		.await
		{
			Ok(Ok(channel)) => Ok((channel, events)),
			Ok(Err(e)) => Err(e),
			Err(_) => {
				warn!(
					"Timeout connecting to websocket endpoint {}",
					self.inner.api_url
				);
				Err(IndexerError::PushChannel(
					"timed out waiting for connection".to_string(),
				))
			}
		}
	}

	async fn await_ready(
		&self,
		events_tx: PushEventSender,
		events: &mut mpsc::UnboundedReceiver<PushEvent>,
	) -> Result<Arc<dyn PushChannel>, IndexerError> {
		let channel = self.inner.transport.dial(events_tx).await?;
		loop {
			match events.recv().await {
				Some(PushEvent::Connected) => return Ok(channel),
				Some(PushEvent::Error(e)) => {
					channel.close();
					return Err(IndexerError::PushChannel(e));
				}
				Some(PushEvent::Disconnected) | None => {
					channel.close();
					return Err(IndexerError::PushChannel(
						"connection closed before it was ready".to_string(),
					));
				}
				Some(other) => debug!("Ignoring {:?} before connect", other),
			}
		}
	}

	async fn dispatch(self, generation: u64, mut events: mpsc::UnboundedReceiver<PushEvent>) {
		while let Some(event) = events.recv().await {
			match event {
				PushEvent::Connected => debug!("Push channel connected"),
				PushEvent::Disconnected => {
					info!("Push channel for {} disconnected", self.inner.coin);
					self.signal_stopped(generation);
				}
				PushEvent::Error(e) => {
					warn!("Push channel for {} failed: {}", self.inner.coin, e);
					self.signal_stopped(generation);
				}
				PushEvent::HashBlock => {
					let client = self.clone();
					tokio::spawn(async move { client.publish_best_block().await }.in_current_span());
				}
				PushEvent::AddressTxid(txids) => {
					for txid in txids {
						let client = self.clone();
						tokio::spawn(
							async move { client.publish_transaction(&txid).await }.in_current_span(),
						);
					}
				}
			}
		}
	}

	fn signal_stopped(&self, generation: u64) {
		if self.inner.generation.load(Ordering::SeqCst) == generation {
			self.inner.stopped.raise();
		}
	}

	async fn publish_best_block(&self) {
		match self.get_best_block().await {
			Ok(block) => {
				debug!("New best block {} at {}", block.hash, block.height);
				let _ = self.inner.block_tx.send(block);
			}
			Err(e) => error!("Error downloading best block: {}", e),
		}
	}

	async fn publish_transaction(&self, txid: &str) {
		match self.get_transaction(txid).await {
			Ok(mut tx) => {
				tx.time = Utc::now().timestamp();
				let _ = self.inner.transaction_tx.send(tx);
			}
			Err(e) => error!("Error downloading tx {}: {}", txid, e),
		}
	}

	async fn run(self, epoch: u64) {
		let exit = match self.setup_listeners().await {
			Ok(()) => {
				supervise(
					&self.inner.stopped,
					self.inner.config.watchdog_tick,
					self.inner.done.subscribe(),
					|| self.reconnect(),
				)
				.await
			}
			Err(_) if self.is_done() => WatchdogExit::Closed,
			Err(e) => WatchdogExit::Failed(e),
		};
		{
			let mut watchdog = lock(&self.inner.watchdog);
			if watchdog.epoch == epoch {
				watchdog.task = None;
			}
		}

		if let WatchdogExit::Failed(e) = exit {
			error!(
				"Giving up on push channel for {} until restarted: {}",
				self.inner.coin, e
			);
			self.report(Err(e));
		}
	}

	async fn reconnect(&self) -> Result<(), IndexerError> {
		self.teardown_socket();
		self.inner.stopped.drain();
		self.setup_listeners().await
	}

	async fn address_transactions(&self, address: &str) -> Result<Vec<Transaction>, IndexerError> {
		let mut transactions = Vec::new();
		let mut page = 1u32;
		loop {
			let body = self
				.inner
				.requester
				.get(&format!("/address/{}", address), &[("page", page.to_string())])
				.await?;
			let listing: AddressPage = serde_json::from_str(&body)?;
			let fetched =
				try_join_all(listing.transactions.iter().map(|txid| self.get_transaction(txid)))
					.await?;
			transactions.extend(fetched);

			if listing.total_pages <= page {
				break;
			}
			page += 1;
		}
		Ok(transactions)
	}

	async fn address_utxos(&self, address: &str) -> Result<Vec<Utxo>, IndexerError> {
		let body = self
			.inner
			.requester
			.get(&format!("/utxo/{}", address), &[])
			.await?;
		let utxos: Vec<Utxo> = serde_json::from_str(&body)?;
		try_join_all(utxos.into_iter().map(|u| self.enrich_utxo(u))).await
	}

	async fn enrich_utxo(&self, mut utxo: Utxo) -> Result<Utxo, IndexerError> {
		let tx = self.get_transaction(&utxo.txid).await?;
		let output = tx.outputs.get(utxo.vout as usize).ok_or_else(|| {
			IndexerError::InvalidResponse("transaction has invalid number of outputs".to_string())
		})?;
		utxo.script_pub_key = output.script_pub_key.hex.clone();
		if let Some(address) = output.address() {
			utxo.address = address.to_string();
		}
		Ok(utxo)
	}
}

#[async_trait]
impl ApiClient for BlockbookClient {
	async fn get_best_block(&self) -> Result<Block, IndexerError> {
		let body = self.inner.requester.get("", &[]).await?;
		let info: IndexInfo = serde_json::from_str(&body)?;

		let body = self
			.inner
			.requester
			.get(
				&format!("/block-index/{}", info.backend.blocks.saturating_sub(1)),
				&[],
			)
			.await?;
		let previous: BlockIndex = serde_json::from_str(&body)?;

		Ok(Block {
			hash: info.backend.best_block_hash,
			height: info.backend.blocks,
			previous_block_hash: previous.block_hash,
			..Default::default()
		})
	}

	async fn get_transaction(&self, txid: &str) -> Result<Transaction, IndexerError> {
		let body = self
			.inner
			.requester
			.get(&format!("tx/{}", txid), &[])
			.await?;
		let wire: WireTransaction = serde_json::from_str(&body)?;
		Transaction::try_from(wire)
	}

	async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, IndexerError> {
		Ok(self.get_transaction(txid).await?.raw_bytes)
	}

	async fn get_transactions(&self, addresses: &[String]) -> Result<Vec<Transaction>, IndexerError> {
		let client = self.clone();
		fetch_bounded(
			addresses.to_vec(),
			self.inner.config.max_concurrent_requests,
			move |address| {
				let client = client.clone();
				async move { client.address_transactions(&address).await }
			},
		)
		.await
	}

	async fn get_utxos(&self, addresses: &[String]) -> Result<Vec<Utxo>, IndexerError> {
		let client = self.clone();
		fetch_bounded(
			addresses.to_vec(),
			self.inner.config.max_concurrent_requests,
			move |address| {
				let client = client.clone();
				async move { client.address_utxos(&address).await }
			},
		)
		.await
	}

	async fn get_blocks_before(&self, to: DateTime<Utc>, limit: u32) -> Result<BlockList, IndexerError> {
		let query = [
			("blockDate", to.format("%Y-%m-%d").to_string()),
			("startTimestamp", to.timestamp().to_string()),
			("limit", limit.to_string()),
		];
		let body = self.inner.requester.get("blocks", &query).await?;
		Ok(serde_json::from_str(&body)?)
	}

	async fn estimate_fee(&self, nb_blocks: u32) -> Result<u64, IndexerError> {
		let body = self
			.inner
			.requester
			.get("utils/estimatefee", &[("nbBlocks", nb_blocks.to_string())])
			.await?;
		let rates: HashMap<String, FeeRate> = serde_json::from_str(&body)?;
		// A missing or negative estimate means the backend has none.
		let fee = rates
			.get(&nb_blocks.to_string())
			.map_or(0.0, |rate| rate.0)
			.max(0.0);
		Ok((fee * 1e8).round() as u64)
	}

	async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, IndexerError> {
		let body = self
			.inner
			.requester
			.get(&format!("sendtx/{}", hex::encode(raw_tx)), &[])
			.await?;
		let result: BroadcastResult = serde_json::from_str(&body)?;
		Ok(result.txid)
	}

	fn listen_addresses(&self, addresses: &[String]) {
		let mut listened = lock(&self.inner.listened);
		let fresh: Vec<&String> = addresses
			.iter()
			.filter(|a| listened.insert((*a).clone()))
			.collect();
		if fresh.is_empty() {
			return;
		}

		let socket = self
			.inner
			.socket
			.read()
			.unwrap_or_else(PoisonError::into_inner);
		match socket.as_ref() {
			Some(channel) => {
				if let Err(e) =
					channel.emit(SUBSCRIBE_EVENT, vec![json!(ADDRESS_TXID_EVENT), json!(fresh)])
				{
					warn!("Error subscribing to addresses: {}", e);
				}
			}
			None => debug!(
				"Push channel for {} not connected, queued {} address(es)",
				self.inner.coin,
				fresh.len()
			),
		}
	}

	fn block_notify(&self) -> broadcast::Receiver<Block> {
		self.inner.block_tx.subscribe()
	}

	fn transaction_notify(&self) -> broadcast::Receiver<Transaction> {
		self.inner.transaction_tx.subscribe()
	}

	fn start(&self, error_sink: ErrorSink) {
		*lock(&self.inner.error_sink) = Some(error_sink);
		self.inner.close_reported.store(false, Ordering::SeqCst);
		self.inner.done.send_replace(false);

		let mut watchdog = lock(&self.inner.watchdog);
		if watchdog.task.as_ref().is_some_and(|task| !task.is_finished()) {
			debug!("Push channel for {} already supervised", self.inner.coin);
			return;
		}
		watchdog.epoch += 1;
		let epoch = watchdog.epoch;
		let client = self.clone();
		let span = info_span!("push", coin = %self.inner.coin);
		watchdog.task = Some(tokio::spawn(client.run(epoch).instrument(span)));
	}

	fn close(&self) {
		self.inner.done.send_replace(true);
		if let Some(task) = lock(&self.inner.watchdog).task.take() {
			task.abort();
		}
		self.teardown_socket();
		if !self.inner.close_reported.swap(true, Ordering::SeqCst) {
			self.report(Ok(()));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::indexer::socket::encode_event;
	use serde_json::Value;
	use std::sync::atomic::AtomicUsize;

	const TXID_A: &str = "aa00000000000000000000000000000000000000000000000000000000000001";
	const TXID_B: &str = "bb00000000000000000000000000000000000000000000000000000000000002";

	/// Serves canned bodies keyed by `endpoint?query`, tracking concurrency.
	#[derive(Default)]
	struct StubRequester {
		responses: Mutex<HashMap<String, String>>,
		delay: Option<Duration>,
		in_flight: AtomicUsize,
		peak: AtomicUsize,
		calls: AtomicUsize,
	}

	impl StubRequester {
		fn with_delay(delay: Duration) -> Self {
			Self {
				delay: Some(delay),
				..Default::default()
			}
		}

		fn respond(&self, key: &str, body: Value) {
			lock(&self.responses).insert(key.to_string(), body.to_string());
		}
	}

	#[async_trait]
	impl Requester for StubRequester {
		async fn get(&self, endpoint: &str, query: &[(&str, String)]) -> Result<String, IndexerError> {
			let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			self.peak.fetch_max(now, Ordering::SeqCst);
			self.calls.fetch_add(1, Ordering::SeqCst);
			if let Some(delay) = self.delay {
				tokio::time::sleep(delay).await;
			}
			self.in_flight.fetch_sub(1, Ordering::SeqCst);

			let mut key = endpoint.trim_matches('/').to_string();
			if !query.is_empty() {
				let pairs: Vec<String> = query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
				key = format!("{}?{}", key, pairs.join("&"));
			}
			lock(&self.responses)
				.get(&key)
				.cloned()
				.ok_or(IndexerError::StatusError {
					status: 404,
					body: key,
				})
		}
	}

	struct StubChannel {
		emitted: Arc<Mutex<Vec<String>>>,
		closed: AtomicBool,
	}

	impl PushChannel for StubChannel {
		fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), IndexerError> {
			lock(&self.emitted).push(encode_event(event, args));
			Ok(())
		}

		fn close(&self) {
			self.closed.store(true, Ordering::SeqCst);
		}
	}

	/// Connects instantly unless `refuse` is set; keeps the event sender of the
	/// latest connection so tests can push events.
	#[derive(Default)]
	struct StubTransport {
		dials: AtomicUsize,
		refuse: AtomicBool,
		events: Mutex<Option<PushEventSender>>,
		emitted: Arc<Mutex<Vec<String>>>,
	}

	impl StubTransport {
		fn push(&self, event: PushEvent) {
			if let Some(events) = lock(&self.events).as_ref() {
				events.send(event).unwrap();
			}
		}
	}

	#[async_trait]
	impl PushTransport for StubTransport {
		async fn dial(&self, events: PushEventSender) -> Result<Arc<dyn PushChannel>, IndexerError> {
			self.dials.fetch_add(1, Ordering::SeqCst);
			if self.refuse.load(Ordering::SeqCst) {
				return Err(IndexerError::PushChannel("connection refused".to_string()));
			}
			events.send(PushEvent::Connected).unwrap();
			*lock(&self.events) = Some(events);
			Ok(Arc::new(StubChannel {
				emitted: self.emitted.clone(),
				closed: AtomicBool::new(false),
			}))
		}
	}

	fn client_with(requester: Arc<StubRequester>, transport: Arc<StubTransport>) -> BlockbookClient {
		BlockbookClient::with_parts(
			"TBTC",
			Url::parse("https://tbtc.blockbook.example/api").unwrap(),
			ClientConfig::default(),
			requester,
			transport,
		)
	}

	fn tx_json(txid: &str, address: &str, value: &str) -> Value {
		json!({
			"txid": txid,
			"version": 1,
			"vin": [{"txid": "prev", "vout": 0, "addresses": ["sender"], "value": "1.0"}],
			"vout": [{"value": value, "n": 0, "scriptPubKey": {"hex": "76a914", "addresses": [address]}}],
			"blockhash": "blockhash",
			"blockheight": 100,
			"confirmations": 3,
			"time": 1600000000,
			"blocktime": 1600000000,
			"hex": "0100"
		})
	}

	#[tokio::test]
	async fn test_get_best_block() {
		let requester = Arc::new(StubRequester::default());
		requester.respond(
			"",
			json!({"blockbook": {}, "backend": {"blocks": 100, "bestBlockHash": "best"}}),
		);
		requester.respond("block-index/99", json!({"blockHash": "prev"}));
		let client = client_with(requester, Arc::default());

		let block = client.get_best_block().await.unwrap();
		assert_eq!(block.hash, "best");
		assert_eq!(block.height, 100);
		assert_eq!(block.previous_block_hash, "prev");
	}

	#[tokio::test]
	async fn test_get_transaction_decodes_addresses_and_raw() {
		let requester = Arc::new(StubRequester::default());
		requester.respond(&format!("tx/{}", TXID_A), tx_json(TXID_A, "addr1", "0.5"));
		let client = client_with(requester, Arc::default());

		let tx = client.get_transaction(TXID_A).await.unwrap();
		assert_eq!(tx.inputs[0].addr, "sender");
		assert_eq!(tx.inputs[0].value, Some(1.0));
		assert_eq!(tx.outputs[0].value, 0.5);
		assert_eq!(tx.raw_bytes, vec![0x01, 0x00]);
		assert_eq!(client.get_raw_transaction(TXID_A).await.unwrap(), vec![0x01, 0x00]);
	}

	#[tokio::test]
	async fn test_get_transactions_follows_pages() {
		let requester = Arc::new(StubRequester::default());
		requester.respond(
			"address/addr1?page=1",
			json!({"page": 1, "totalPages": 2, "transactions": [TXID_A]}),
		);
		requester.respond(
			"address/addr1?page=2",
			json!({"page": 2, "totalPages": 2, "transactions": [TXID_B]}),
		);
		requester.respond(&format!("tx/{}", TXID_A), tx_json(TXID_A, "addr1", "1"));
		requester.respond(&format!("tx/{}", TXID_B), tx_json(TXID_B, "addr1", "2"));
		let client = client_with(requester, Arc::default());

		let mut txids: Vec<String> = client
			.get_transactions(&["addr1".to_string()])
			.await
			.unwrap()
			.into_iter()
			.map(|tx| tx.txid)
			.collect();
		txids.sort();
		assert_eq!(txids, vec![TXID_A.to_string(), TXID_B.to_string()]);
	}

	#[tokio::test]
	async fn test_get_transactions_partial_failure() {
		let requester = Arc::new(StubRequester::default());
		let addresses: Vec<String> = (0..10).map(|i| format!("addr{}", i)).collect();
		for address in addresses.iter().filter(|a| *a != "addr7") {
			requester.respond(
				&format!("address/{}?page=1", address),
				json!({"page": 1, "totalPages": 1, "transactions": []}),
			);
		}
		let client = client_with(requester, Arc::default());

		let res = client.get_transactions(&addresses).await;
		assert!(matches!(res, Err(IndexerError::StatusError { status: 404, .. })));
	}

	#[tokio::test]
	async fn test_get_transactions_bounded_concurrency() {
		let requester = Arc::new(StubRequester::with_delay(Duration::from_millis(10)));
		let addresses: Vec<String> = (0..100).map(|i| format!("addr{}", i)).collect();
		for address in &addresses {
			requester.respond(
				&format!("address/{}?page=1", address),
				json!({"page": 1, "totalPages": 1, "transactions": []}),
			);
		}
		let client = client_with(requester.clone(), Arc::default());

		let txs = client.get_transactions(&addresses).await.unwrap();
		assert!(txs.is_empty());
		assert_eq!(requester.calls.load(Ordering::SeqCst), 100);
		assert!(requester.peak.load(Ordering::SeqCst) <= 25);
	}

	#[tokio::test]
	async fn test_get_utxos_enriches_from_owning_transaction() {
		let requester = Arc::new(StubRequester::default());
		requester.respond(
			"utxo/addr1",
			json!([{"txid": TXID_A, "vout": 0, "amount": "0.5", "satoshis": 50000000, "confirmations": 3, "height": 100}]),
		);
		requester.respond(&format!("tx/{}", TXID_A), tx_json(TXID_A, "addr1", "0.5"));
		let client = client_with(requester.clone(), Arc::default());

		let utxos = client.get_utxos(&["addr1".to_string()]).await.unwrap();
		assert_eq!(utxos.len(), 1);
		assert_eq!(utxos[0].address, "addr1");
		assert_eq!(utxos[0].script_pub_key, "76a914");
		assert_eq!(utxos[0].amount, 0.5);
		assert_eq!(utxos[0].at_height, 100);

		requester.respond(
			"utxo/addr1",
			json!([{"txid": TXID_A, "vout": 4, "amount": 1.0}]),
		);
		let res = client.get_utxos(&["addr1".to_string()]).await;
		assert!(matches!(res, Err(IndexerError::InvalidResponse(_))));
	}

	#[tokio::test]
	async fn test_broadcast_and_estimate_fee() {
		let requester = Arc::new(StubRequester::default());
		requester.respond("sendtx/0100", json!({"txid": TXID_A}));
		requester.respond("utils/estimatefee?nbBlocks=2", json!({"2": "0.00012"}));
		requester.respond("utils/estimatefee?nbBlocks=6", json!({"6": -1}));
		let client = client_with(requester, Arc::default());

		assert_eq!(client.broadcast(&[0x01, 0x00]).await.unwrap(), TXID_A);
		assert_eq!(client.estimate_fee(2).await.unwrap(), 12000);
		assert_eq!(client.estimate_fee(6).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn test_get_blocks_before() {
		let requester = Arc::new(StubRequester::default());
		requester.respond(
			"blocks?blockDate=2020-09-13&startTimestamp=1600000000&limit=2",
			json!({"blocks": [{"hash": "h1", "height": 10}, {"hash": "h0", "height": 9}], "length": 2}),
		);
		let client = client_with(requester, Arc::default());

		let to = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
		let list = client.get_blocks_before(to, 2).await.unwrap();
		assert_eq!(list.length, 2);
		assert_eq!(list.blocks[1].hash, "h0");
	}

	#[tokio::test]
	async fn test_subscriptions_are_queued_until_connected() {
		let transport = Arc::new(StubTransport::default());
		let client = client_with(Arc::default(), transport.clone());
		client.listen_addresses(&["addr1".to_string(), "addr1".to_string()]);
		assert!(lock(&transport.emitted).is_empty());

		client.setup_listeners().await.unwrap();
		assert!(client.is_connected());

		client.listen_addresses(&["addr1".to_string(), "addr2".to_string()]);
		let emitted = lock(&transport.emitted).clone();
		assert!(emitted.contains(&r#"42["subscribe","bitcoind/hashblock"]"#.to_string()));
		assert!(emitted.contains(&r#"42["subscribe","bitcoind/addresstxid",["addr1"]]"#.to_string()));
		assert!(emitted.contains(&r#"42["subscribe","bitcoind/addresstxid",["addr2"]]"#.to_string()));
		client.close();
	}

	#[tokio::test]
	async fn test_push_events_reach_notify_queues() {
		let requester = Arc::new(StubRequester::default());
		requester.respond(
			"",
			json!({"backend": {"blocks": 100, "bestBlockHash": "best"}}),
		);
		requester.respond("block-index/99", json!({"blockHash": "prev"}));
		requester.respond(&format!("tx/{}", TXID_A), tx_json(TXID_A, "addr1", "1"));
		let transport = Arc::new(StubTransport::default());
		let client = client_with(requester, transport.clone());
		let mut blocks = client.block_notify();
		let mut transactions = client.transaction_notify();

		client.setup_listeners().await.unwrap();
		transport.push(PushEvent::HashBlock);
		transport.push(PushEvent::AddressTxid(vec![TXID_A.to_string()]));

		let block = blocks.recv().await.unwrap();
		assert_eq!(block.hash, "best");
		let tx = transactions.recv().await.unwrap();
		assert_eq!(tx.txid, TXID_A);
		assert!(tx.time > 1600000000);
	}

	#[tokio::test]
	async fn test_close_reports_once() {
		let client = client_with(Arc::default(), Arc::default());
		let (sink, mut errors) = mpsc::unbounded_channel();
		client.start(sink);
		client.close();
		client.close();

		assert!(matches!(errors.recv().await, Some(Ok(()))));
		tokio::task::yield_now().await;
		assert!(errors.try_recv().is_err());
		assert!(!client.is_connected());
	}

	#[tokio::test]
	async fn test_watchdog_gives_up_once() {
		tokio::time::pause();
		let transport = Arc::new(StubTransport::default());
		let client = client_with(Arc::default(), transport.clone());
		let (sink, mut errors) = mpsc::unbounded_channel();
		client.start(sink);

		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(transport.dials.load(Ordering::SeqCst), 1);
		assert!(client.is_connected());

		transport.refuse.store(true, Ordering::SeqCst);
		transport.push(PushEvent::Disconnected);
		transport.push(PushEvent::Error("reset by peer".to_string()));
		tokio::time::sleep(Duration::from_millis(1100)).await;
		assert!(transport.dials.load(Ordering::SeqCst) >= 2);

		tokio::time::sleep(Duration::from_secs(30)).await;
		assert!(matches!(errors.try_recv(), Ok(Err(IndexerError::PushChannel(_)))));
		assert!(errors.try_recv().is_err());

		let dials = transport.dials.load(Ordering::SeqCst);
		tokio::time::sleep(Duration::from_secs(30)).await;
		assert_eq!(transport.dials.load(Ordering::SeqCst), dials);
		assert!(errors.try_recv().is_err());

		// Restarting recovers.
		transport.refuse.store(false, Ordering::SeqCst);
		let (sink, _errors) = mpsc::unbounded_channel();
		client.start(sink);
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert!(client.is_connected());
	}

	#[tokio::test]
	async fn test_start_after_close_reconnects() {
		tokio::time::pause();
		let transport = Arc::new(StubTransport::default());
		let client = client_with(Arc::default(), transport.clone());
		let (sink, mut errors) = mpsc::unbounded_channel();
		client.start(sink);
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert!(client.is_connected());

		client.close();
		assert!(matches!(errors.recv().await, Some(Ok(()))));
		assert!(!client.is_connected());

		let (sink, mut errors) = mpsc::unbounded_channel();
		client.start(sink);
		tokio::time::sleep(Duration::from_secs(30)).await;
		assert_eq!(transport.dials.load(Ordering::SeqCst), 2);
		assert!(client.is_connected());
		assert!(errors.try_recv().is_err());

		// The new watchdog still supervises the channel.
		transport.push(PushEvent::Disconnected);
		tokio::time::sleep(Duration::from_millis(1100)).await;
		assert_eq!(transport.dials.load(Ordering::SeqCst), 3);
		assert!(client.is_connected());
		client.close();
	}
}
