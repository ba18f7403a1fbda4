//! Types for blockbook indexer integration: wire models, numeric normalization and errors

use serde::{Deserialize, Deserializer, Serialize};

/// An amount as the indexer encodes it. Some endpoints return JSON numbers,
/// others numeric strings, and a few switch between the two across versions.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireAmount {
	Number(f64),
	Text(String),
}

impl WireAmount {
	fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
		match self {
			WireAmount::Number(n) => Ok(n),
			WireAmount::Text(s) => s
				.trim()
				.parse::<f64>()
				.map_err(|e| E::custom(format!("error parsing value float: {}", e))),
		}
	}
}

/// Deserialize a number-or-string amount into an `f64`.
pub fn deserialize_amount<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
	D: Deserializer<'de>,
{
	WireAmount::deserialize(deserializer)?.into_f64()
}

/// Same as [`deserialize_amount`] but tolerates a missing or `null` value.
pub fn deserialize_optional_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
	D: Deserializer<'de>,
{
	match Option::<WireAmount>::deserialize(deserializer)? {
		Some(amount) => amount.into_f64().map(Some),
		None => Ok(None),
	}
}

/// A block summary as reported by the indexer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
	pub hash: String,
	pub height: u64,
	#[serde(rename = "previousblockhash", default)]
	pub previous_block_hash: String,
	#[serde(default)]
	pub tx: Vec<String>,
	#[serde(default)]
	pub size: u64,
	#[serde(default)]
	pub time: i64,
}

/// A page of block summaries returned by the `blocks` endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockList {
	#[serde(default)]
	pub blocks: Vec<Block>,
	#[serde(default)]
	pub length: usize,
}

/// A script, hex encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
	#[serde(default)]
	pub hex: String,
}

/// An output script together with the addresses the indexer decoded from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutScript {
	#[serde(default)]
	pub hex: String,
	#[serde(rename = "type", default)]
	pub script_type: String,
	#[serde(default)]
	pub addresses: Vec<String>,
}

/// A transaction input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Input {
	#[serde(default)]
	pub txid: String,
	#[serde(default)]
	pub vout: u32,
	#[serde(default)]
	pub sequence: u32,
	#[serde(default)]
	pub n: u32,
	#[serde(rename = "scriptSig", default)]
	pub script_sig: Script,
	#[serde(default)]
	pub addr: String,
	/// Value in coins. Account-model chains omit it on inputs.
	#[serde(default, deserialize_with = "deserialize_optional_amount")]
	pub value: Option<f64>,
}

/// A transaction output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
	#[serde(rename = "scriptPubKey", default)]
	pub script_pub_key: OutScript,
	#[serde(deserialize_with = "deserialize_amount")]
	pub value: f64,
	#[serde(default)]
	pub n: u32,
}

impl Output {
	/// First decoded address, if the indexer could decode one.
	pub fn address(&self) -> Option<&str> {
		self.script_pub_key
			.addresses
			.first()
			.map(String::as_str)
			.filter(|a| !a.is_empty())
	}
}

/// A transaction with amounts already normalized to `f64`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
	pub txid: String,
	#[serde(default)]
	pub version: i32,
	#[serde(default)]
	pub locktime: u32,
	#[serde(rename = "vin", default)]
	pub inputs: Vec<Input>,
	#[serde(rename = "vout", default)]
	pub outputs: Vec<Output>,
	#[serde(rename = "blockhash", default)]
	pub block_hash: String,
	#[serde(rename = "blockheight", default)]
	pub block_height: i64,
	#[serde(default)]
	pub confirmations: u32,
	#[serde(default)]
	pub time: i64,
	#[serde(rename = "blocktime", default)]
	pub block_time: i64,
	#[serde(skip)]
	pub raw_bytes: Vec<u8>,
}

/// An unspent output belonging to one of the queried addresses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Utxo {
	#[serde(default)]
	pub address: String,
	pub txid: String,
	pub vout: u32,
	#[serde(rename = "scriptPubKey", default)]
	pub script_pub_key: String,
	#[serde(default, deserialize_with = "deserialize_amount")]
	pub amount: f64,
	#[serde(default)]
	pub satoshis: i64,
	#[serde(default)]
	pub confirmations: u32,
	#[serde(rename = "height", default)]
	pub at_height: u64,
}

/// Error types for indexer requests and the push channel.
///
/// Callers branch on [`IndexerError::is_retryable`] and [`IndexerError::is_fatal`]:
/// a timed-out request is retryable, a 5xx answer is both retryable and fatal
/// (the backend itself is unhealthy), every other failure is permanent.
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
	#[error("request timed out: {0}")]
	Timeout(String),

	#[error("server error: {status}")]
	ServerError { status: u16, body: String },

	#[error("status not ok: {status}")]
	StatusError { status: u16, body: String },

	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("hex decode error: {0}")]
	HexError(#[from] hex::FromHexError),

	#[error("WebSocket error: {0}")]
	WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("unsupported scheme: {0}")]
	UnsupportedScheme(String),

	#[error("invalid URL: {0}")]
	InvalidUrl(String),

	#[error("invalid response: {0}")]
	InvalidResponse(String),

	#[error("push channel error: {0}")]
	PushChannel(String),

	#[error("client closed")]
	Closed,
}

impl IndexerError {
	/// Safe to issue the same call again.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			IndexerError::Timeout(_) | IndexerError::ServerError { .. }
		)
	}

	/// The backend as a whole is unhealthy, not only this call.
	pub fn is_fatal(&self) -> bool {
		matches!(self, IndexerError::ServerError { .. })
	}
}
