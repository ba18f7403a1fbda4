//! Indexer integration module for blockbook-style backends
//!
//! This module provides the client and types for talking to a blockbook indexer:
//! REST queries for blocks, transactions and UTXOs, plus a socket.io push channel
//! that announces new blocks and activity on watched addresses.

/// Blockbook REST + push client
mod client;
/// Bounded per-address fan-out
mod fanout;
#[cfg(test)]
pub(crate) mod mock;
/// HTTP request layer
mod request;
/// socket.io push channel
pub mod socket;
/// Type definitions for indexer data structures
mod types;
/// Push channel reconnect supervision
mod watchdog;

pub use client::{BlockbookClient, ClientConfig};
pub use request::{HttpRequester, Requester, validate_scheme};
pub use types::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};

/// Where the client reports its lifecycle outcome: `Ok(())` once on close, or
/// the error that made the push channel give up.
pub type ErrorSink = mpsc::UnboundedSender<Result<(), IndexerError>>;

/// Everything the sync service needs from an indexer backend.
#[async_trait]
pub trait ApiClient: Send + Sync {
	/// Current best block, with the hash of its parent.
	async fn get_best_block(&self) -> Result<Block, IndexerError>;

	async fn get_transaction(&self, txid: &str) -> Result<Transaction, IndexerError>;

	/// Serialized transaction bytes.
	async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, IndexerError>;

	/// All transactions touching any of `addresses`. Fails as a whole if any
	/// address fails.
	async fn get_transactions(&self, addresses: &[String]) -> Result<Vec<Transaction>, IndexerError>;

	/// Unspent outputs of `addresses`, with script and owning address filled in.
	async fn get_utxos(&self, addresses: &[String]) -> Result<Vec<Utxo>, IndexerError>;

	/// Up to `limit` blocks mined before `to`.
	async fn get_blocks_before(&self, to: DateTime<Utc>, limit: u32) -> Result<BlockList, IndexerError>;

	/// Fee per kilobyte in base units for confirmation within `nb_blocks`.
	async fn estimate_fee(&self, nb_blocks: u32) -> Result<u64, IndexerError>;

	/// Publish a serialized transaction, returning its id.
	async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, IndexerError>;

	/// Watch `addresses` for new activity. Repeated addresses are ignored.
	fn listen_addresses(&self, addresses: &[String]);

	fn block_notify(&self) -> broadcast::Receiver<Block>;

	fn transaction_notify(&self) -> broadcast::Receiver<Transaction>;

	/// Open the push channel and supervise it.
	fn start(&self, error_sink: ErrorSink);

	/// Tear down the push channel. Idempotent.
	fn close(&self);
}
