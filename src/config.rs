//! Runtime settings.
//!
//! Read from an optional `wallet-sync.toml` next to the binary, then from
//! `WALLET_SYNC__*` environment variables (e.g. `WALLET_SYNC__API_URL`).

use crate::indexer::ClientConfig;
use crate::wallet::ServiceConfig;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
	/// Blockbook REST base URL.
	pub api_url: String,
	pub coin: String,
	/// Wallet address to track.
	pub address: String,
	#[serde(default)]
	pub proxy_url: Option<String>,
	pub request_timeout_secs: u64,
	pub max_concurrent_requests: usize,
	pub connect_timeout_secs: u64,
	pub reconnect_deadline_secs: u64,
	pub reconnect_retry_secs: u64,
	pub watchdog_tick_millis: u64,
	pub coin_decimals: u32,
	/// Where the chain cursor is cached.
	pub data_dir: PathBuf,
}

impl Settings {
	pub fn new() -> Result<Self, ConfigError> {
		Self::from_file("wallet-sync")
	}

	/// Load settings from `name` (extension optional) and the environment.
	pub fn from_file(name: &str) -> Result<Self, ConfigError> {
		let config = Config::builder()
			.set_default("api_url", "https://btc1.trezor.io/api")?
			.set_default("coin", "BTC")?
			.set_default("address", "")?
			.set_default("request_timeout_secs", 30)?
			.set_default("max_concurrent_requests", 25)?
			.set_default("connect_timeout_secs", 10)?
			.set_default("reconnect_deadline_secs", 10)?
			.set_default("reconnect_retry_secs", 2)?
			.set_default("watchdog_tick_millis", 1000)?
			.set_default("coin_decimals", 8)?
			.set_default("data_dir", "data")?
			.add_source(File::with_name(name).required(false))
			.add_source(Environment::with_prefix("WALLET_SYNC").separator("__"))
			.build()?;

		config.try_deserialize()
	}

	pub fn client_config(&self) -> ClientConfig {
		ClientConfig {
			request_timeout: Duration::from_secs(self.request_timeout_secs),
			max_concurrent_requests: self.max_concurrent_requests,
			connect_timeout: Duration::from_secs(self.connect_timeout_secs),
			reconnect_deadline: Duration::from_secs(self.reconnect_deadline_secs),
			reconnect_retry_interval: Duration::from_secs(self.reconnect_retry_secs),
			watchdog_tick: Duration::from_millis(self.watchdog_tick_millis),
			proxy_url: self.proxy_url.clone().filter(|p| !p.is_empty()),
		}
	}

	pub fn service_config(&self) -> ServiceConfig {
		ServiceConfig {
			coin: self.coin.clone(),
			address: self.address.clone(),
			coin_decimals: self.coin_decimals,
		}
	}
}
