//! Bounded-concurrency fan-out of per-address fetches.
//!
//! One task is spawned per address. Each task takes a slot from a counting
//! semaphore before fetching and gives it back when done, so no more than
//! `limit` fetches are ever in flight. Results land on a shared queue drained
//! by the caller, which gives up on the first error. Tasks still running at
//! that point are left to finish on their own; their results are discarded.

use super::types::IndexerError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tracing::error;

pub(crate) async fn fetch_bounded<T, F, Fut>(
	addresses: Vec<String>,
	limit: usize,
	fetch: F,
) -> Result<Vec<T>, IndexerError>
where
	T: Send + 'static,
	F: Fn(String) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<Vec<T>, IndexerError>> + Send + 'static,
{
	let semaphore = Arc::new(Semaphore::new(limit.max(1)));
	let fetch = Arc::new(fetch);
	let (result_tx, mut result_rx) = mpsc::unbounded_channel();

	for address in addresses {
		let semaphore = semaphore.clone();
		let fetch = fetch.clone();
		let result_tx = result_tx.clone();
		tokio::spawn(async move {
			let result = match semaphore.acquire_owned().await {
				Ok(_permit) => fetch(address.clone()).await,
				Err(_) => Err(IndexerError::Closed),
			};
			if let Err(e) = &result {
				error!("Error fetching address {}: {}", address, e);
			}
			// The collector may already have returned on another failure.
			let _ = result_tx.send(result);
		});
	}
	drop(result_tx);

	let mut collected = Vec::new();
	while let Some(result) = result_rx.recv().await {
		collected.extend(result?);
	}
	Ok(collected)
}
