use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use wallet_chain_sync::config::Settings;
use wallet_chain_sync::indexer::{ApiClient, BlockbookClient};
use wallet_chain_sync::wallet::{FileCache, MemoryDatastore, WalletSyncService};

fn format_amount(base_units: i64, decimals: u32) -> String {
	format!(
		"{:.*}",
		decimals as usize,
		base_units as f64 / 10f64.powi(decimals as i32)
	)
}

#[tokio::main]
async fn main() {
	// Initialize tracing subscriber with debug logging for this crate
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive("wallet_chain_sync=debug".parse().unwrap())
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	let settings = match Settings::new() {
		Ok(settings) => settings,
		Err(e) => {
			error!("Failed to load settings: {}", e);
			return;
		}
	};
	info!(
		"Starting {} wallet sync against {}",
		settings.coin, settings.api_url
	);

	let client = match BlockbookClient::new(
		&settings.coin,
		&settings.api_url,
		settings.client_config(),
	) {
		Ok(client) => Arc::new(client),
		Err(e) => {
			error!("Failed to create indexer client: {}", e);
			return;
		}
	};
	let (error_sink, mut errors) = mpsc::unbounded_channel();
	client.start(error_sink.clone());

	info!("Created indexer client");

	let service = WalletSyncService::new(
		settings.service_config(),
		client.clone(),
		Arc::new(MemoryDatastore::new()),
		Arc::new(FileCache::new(settings.data_dir.clone())),
		None,
	)
	.await;

	let coin = settings.coin.clone();
	let decimals = settings.coin_decimals;
	service.add_transaction_listener(move |cb| {
		info!(
			"{} transaction {} at height {}: {} {}",
			coin,
			cb.txid,
			cb.height,
			format_amount(cb.value, decimals),
			coin
		);
	});
	service.start();

	// Syncs the latest chain state and wallet transactions
	service.update_state().await;
	let (height, hash) = service.chain_tip().await;
	info!("Synced {} to height {} ({})", settings.coin, height, hash);

	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {
				info!("Shutting down");
				break;
			}
			outcome = errors.recv() => match outcome {
				Some(Err(e)) => {
					warn!("Push channel failed: {}, restarting", e);
					tokio::time::sleep(Duration::from_secs(settings.reconnect_retry_secs)).await;
					client.start(error_sink.clone());
				}
				Some(Ok(())) | None => break,
			},
		}
	}

	service.stop();
	client.close();
}
