//! Transaction listener registry.
//!
//! Listeners are plain callbacks registered by the wallet façade. Every
//! dispatch runs each listener on its own blocking task, so a slow or panicking
//! listener never holds up the others or the sync service. Panics are caught by
//! the task and logged.

use crate::wallet::TransactionCallback;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::error;

/// A registered transaction listener.
pub type TransactionListener = Arc<dyn Fn(TransactionCallback) + Send + Sync>;

/// Ordered list of transaction listeners.
#[derive(Default)]
pub struct ListenerRegistry {
	listeners: RwLock<Vec<TransactionListener>>,
}

impl ListenerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Append a listener.
	pub fn register(&self, listener: TransactionListener) {
		self.listeners
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push(listener);
	}

	/// Hand `callback` to every listener without waiting for any of them.
	pub fn dispatch(&self, callback: &TransactionCallback) {
		let listeners = self
			.listeners
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone();

		for (index, listener) in listeners.into_iter().enumerate() {
			let callback = callback.clone();
			let txid = callback.txid.clone();
			let handle = tokio::task::spawn_blocking(move || listener(callback));
			tokio::spawn(async move {
				if let Err(e) = handle.await {
					error!("Transaction listener {} failed on {}: {}", index, txid, e);
				}
			});
		}
	}
}
