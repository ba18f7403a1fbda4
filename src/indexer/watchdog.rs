//! Reconnect supervision for the push channel.
//!
//! Push handlers raise a [`StopSignal`] when the connection dies. The watchdog
//! polls that flag once per tick, so any number of signals raised between two
//! ticks cause a single reconnect. Reconnects retry on a fixed interval until a
//! deadline; if the deadline passes the watchdog exits with the last error and
//! stays down until the owner starts the client again.

use super::types::IndexerError;
use backoff::Clock;
use backoff::exponential::ExponentialBackoff;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Coalesced "connection stopped" flag. Raising never blocks.
#[derive(Debug, Default)]
pub(crate) struct StopSignal(AtomicBool);

impl StopSignal {
	pub(crate) fn raise(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	/// Consume a pending signal, if any.
	pub(crate) fn take(&self) -> bool {
		self.0.swap(false, Ordering::SeqCst)
	}

	/// Discard signals left over from a connection that is already gone.
	pub(crate) fn drain(&self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

/// Why the watchdog loop returned.
#[derive(Debug)]
pub(crate) enum WatchdogExit {
	/// The owner closed the client.
	Closed,
	/// Reconnecting failed past the deadline.
	Failed(IndexerError),
}

/// Poll `signal` every `tick` and call `reconnect` when it was raised.
pub(crate) async fn supervise<F, Fut>(
	signal: &StopSignal,
	tick: Duration,
	mut done: watch::Receiver<bool>,
	mut reconnect: F,
) -> WatchdogExit
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<(), IndexerError>>,
{
	let mut ticker = tokio::time::interval(tick);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		if *done.borrow() {
			return WatchdogExit::Closed;
		}
		tokio::select! {
			changed = done.changed() => {
				if changed.is_err() || *done.borrow() {
					return WatchdogExit::Closed;
				}
			}
			_ = ticker.tick() => {
				if !signal.take() {
					continue;
				}
				warn!("Push channel stopped, reconnecting");
				match reconnect().await {
					Ok(()) => debug!("Push channel reconnected"),
					Err(_) if *done.borrow() => return WatchdogExit::Closed,
					Err(e) => return WatchdogExit::Failed(e),
				}
			}
		}
	}
}

/// Backoff clock that follows tokio's (pausable) time source.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TokioClock;

impl Clock for TokioClock {
	fn now(&self) -> Instant {
		tokio::time::Instant::now().into_std()
	}
}

/// Fixed-interval retry policy bounded by an overall deadline.
pub(crate) fn fixed_retry(interval: Duration, deadline: Duration) -> ExponentialBackoff<TokioClock> {
	let clock = TokioClock;
	ExponentialBackoff {
		current_interval: interval,
		initial_interval: interval,
		randomization_factor: 0.0,
		multiplier: 1.0,
		max_interval: interval,
		start_time: clock.now(),
		max_elapsed_time: Some(deadline),
		clock,
	}
}

/// Run `attempt` until it succeeds or the retry policy gives up.
pub(crate) async fn retry_until_deadline<T, F, Fut>(
	interval: Duration,
	deadline: Duration,
	mut attempt: F,
) -> Result<T, IndexerError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, IndexerError>>,
{
	backoff::future::retry(fixed_retry(interval, deadline), || {
		let fut = attempt();
		async move {
			fut.await.map_err(|e| match e {
				IndexerError::Closed => backoff::Error::permanent(e),
				e => {
					warn!("Connect attempt failed: {}", e);
					backoff::Error::transient(e)
				}
			})
		}
	})
	.await
}
