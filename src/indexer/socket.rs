//! Push-notification channel to the indexer.
//!
//! Blockbook pushes block and address activity over socket.io (engine.io v3
//! framing) on top of a WebSocket. Everything untyped about that wire format is
//! handled in this module: frames are decoded into [`PushEvent`] values or a
//! decode error, and the rest of the client never sees raw payloads.

use super::types::IndexerError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Event name announcing a new best block. The payload is ignored.
pub const HASHBLOCK_EVENT: &str = "bitcoind/hashblock";
/// Event name announcing activity on a subscribed address.
pub const ADDRESS_TXID_EVENT: &str = "bitcoind/addresstxid";
/// Outbound event used for both subscriptions.
pub const SUBSCRIBE_EVENT: &str = "subscribe";

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// Typed events delivered by a push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
	/// The server acknowledged the socket.io connection.
	Connected,
	/// The connection ended, either side may have closed it.
	Disconnected,
	/// The transport failed.
	Error(String),
	/// A new block was found.
	HashBlock,
	/// Transaction ids touching a subscribed address.
	AddressTxid(Vec<String>),
}

pub type PushEventSender = mpsc::UnboundedSender<PushEvent>;

/// An open push connection.
pub trait PushChannel: Send + Sync {
	/// Emit a socket.io event with the given arguments.
	fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), IndexerError>;

	/// Tear the connection down. Must be safe to call more than once.
	fn close(&self);
}

/// Opens push connections. Events of the new connection are sent to `events`.
#[async_trait]
pub trait PushTransport: Send + Sync {
	async fn dial(&self, events: PushEventSender) -> Result<Arc<dyn PushChannel>, IndexerError>;
}

/// Engine.io level frame.
#[derive(Debug, PartialEq)]
enum Frame {
	Open { ping_interval: Duration },
	Ping,
	Pong,
	Close,
	Event(PushEvent),
	Ignored,
}

fn decode_frame(text: &str) -> Result<Frame, IndexerError> {
	let mut chars = text.chars();
	let kind = chars
		.next()
		.ok_or_else(|| IndexerError::InvalidResponse("empty frame".to_string()))?;
	let body = chars.as_str();
	match kind {
		'0' => {
			let open: Value = serde_json::from_str(body)?;
			let ping_interval = open
				.get("pingInterval")
				.and_then(Value::as_u64)
				.map(Duration::from_millis)
				.unwrap_or(DEFAULT_PING_INTERVAL);
			Ok(Frame::Open { ping_interval })
		}
		'1' => Ok(Frame::Close),
		'2' => Ok(Frame::Ping),
		'3' => Ok(Frame::Pong),
		'4' => Ok(decode_packet(body)?.map_or(Frame::Ignored, Frame::Event)),
		'6' => Ok(Frame::Ignored),
		other => Err(IndexerError::InvalidResponse(format!(
			"unknown frame type {:?}",
			other
		))),
	}
}

/// Decode a socket.io packet (the part after the engine.io message marker).
///
/// Returns `Ok(None)` for packets that are valid but of no interest.
pub fn decode_packet(packet: &str) -> Result<Option<PushEvent>, IndexerError> {
	let mut chars = packet.chars();
	match chars.next() {
		Some('0') => Ok(Some(PushEvent::Connected)),
		Some('1') => Ok(Some(PushEvent::Disconnected)),
		Some('2') => {
			// Optional ack id before the JSON array.
			let args = chars.as_str().trim_start_matches(|c: char| c.is_ascii_digit());
			decode_event(args)
		}
		Some('4') => Ok(Some(PushEvent::Error(chars.as_str().to_string()))),
		Some(_) => Ok(None),
		None => Err(IndexerError::InvalidResponse("empty packet".to_string())),
	}
}

fn decode_event(args: &str) -> Result<Option<PushEvent>, IndexerError> {
	let args: Vec<Value> = serde_json::from_str(args)?;
	let name = args
		.first()
		.and_then(Value::as_str)
		.ok_or_else(|| IndexerError::InvalidResponse("event without a name".to_string()))?;

	match name {
		HASHBLOCK_EVENT => Ok(Some(PushEvent::HashBlock)),
		ADDRESS_TXID_EVENT => {
			let payload = args.get(1).and_then(Value::as_object).ok_or_else(|| {
				IndexerError::InvalidResponse(format!("{} payload is not a map", name))
			})?;
			let mut txids = Vec::new();
			for value in payload.values() {
				let candidate = value.as_str().ok_or_else(|| {
					IndexerError::InvalidResponse(format!("{} payload value is not a string", name))
				})?;
				// Values may also be addresses; only 256-bit hashes are txids.
				if is_hash256(candidate) {
					txids.push(candidate.to_string());
				}
			}
			Ok(Some(PushEvent::AddressTxid(txids)))
		}
		_ => Ok(None),
	}
}

fn is_hash256(candidate: &str) -> bool {
	candidate.len() == 64 && hex::decode(candidate).is_ok()
}

/// Encode an outbound socket.io event frame.
pub fn encode_event(event: &str, args: Vec<Value>) -> String {
	let mut frame = Vec::with_capacity(args.len() + 1);
	frame.push(json!(event));
	frame.extend(args);
	format!("42{}", Value::Array(frame))
}

/// Port of the push endpoint, defaulting by scheme.
pub fn default_port(api_url: &Url) -> u16 {
	api_url
		.port()
		.unwrap_or(if has_implied_security(api_url) { 443 } else { 80 })
}

fn has_implied_security(api_url: &Url) -> bool {
	api_url.scheme() == "https"
}

/// WebSocket URL of the socket.io endpoint for the given REST base URL.
pub fn socket_url(api_url: &Url) -> String {
	format!(
		"{}://{}:{}/socket.io/?EIO=3&transport=websocket",
		if has_implied_security(api_url) { "wss" } else { "ws" },
		api_url.host_str().unwrap_or_default(),
		default_port(api_url)
	)
}

/// socket.io over tokio-tungstenite.
pub struct SocketIoTransport {
	url: String,
}

impl SocketIoTransport {
	pub fn new(api_url: &Url) -> Self {
		Self {
			url: socket_url(api_url),
		}
	}
}

#[async_trait]
impl PushTransport for SocketIoTransport {
	async fn dial(&self, events: PushEventSender) -> Result<Arc<dyn PushChannel>, IndexerError> {
		debug!("Attempting WebSocket connection to: {}", self.url);
		let (ws_stream, response) = connect_async(self.url.as_str()).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
		tokio::spawn(async move {
			while let Some(msg) = outbound_rx.recv().await {
				let closing = matches!(msg, Message::Close(_));
				if ws_sender.send(msg).await.is_err() || closing {
					break;
				}
			}
		});

		let replies = outbound.clone();
		let reader = tokio::spawn(async move {
			let mut pinger: Option<JoinHandle<()>> = None;
			let mut ended = PushEvent::Disconnected;
			while let Some(msg) = ws_receiver.next().await {
				match msg {
					Ok(Message::Text(text)) => match decode_frame(&text) {
						Ok(Frame::Open { ping_interval }) => {
							let pings = replies.clone();
							pinger = Some(tokio::spawn(async move {
								let mut ticker = tokio::time::interval(ping_interval);
								ticker.tick().await;
								loop {
									ticker.tick().await;
									if pings.send(Message::Text("2".to_string())).is_err() {
										break;
									}
								}
							}));
						}
						Ok(Frame::Ping) => {
							let _ = replies.send(Message::Text("3".to_string()));
						}
						Ok(Frame::Event(PushEvent::Disconnected)) | Ok(Frame::Close) => break,
						Ok(Frame::Event(event)) => {
							if events.send(event).is_err() {
								break;
							}
						}
						Ok(Frame::Pong) | Ok(Frame::Ignored) => {}
						Err(e) => warn!("Dropping malformed push frame: {}", e),
					},
					Ok(Message::Ping(data)) => {
						let _ = replies.send(Message::Pong(data));
					}
					Ok(Message::Close(_)) => break,
					Ok(_) => {}
					Err(e) => {
						ended = PushEvent::Error(e.to_string());
						break;
					}
				}
			}
			if let Some(pinger) = pinger {
				pinger.abort();
			}
			let _ = events.send(ended);
		});

		Ok(Arc::new(SocketIoChannel {
			outbound,
			reader: Mutex::new(Some(reader)),
		}))
	}
}

struct SocketIoChannel {
	outbound: mpsc::UnboundedSender<Message>,
	reader: Mutex<Option<JoinHandle<()>>>,
}

impl PushChannel for SocketIoChannel {
	fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), IndexerError> {
		self.outbound
			.send(Message::Text(encode_event(event, args)))
			.map_err(|_| IndexerError::PushChannel("connection closed".to_string()))
	}

	fn close(&self) {
		let reader = self
			.reader
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		if let Some(reader) = reader {
			// Stop reading first so our own close is not reported as a disconnect.
			reader.abort();
			let _ = self.outbound.send(Message::Close(None));
		}
	}
}

impl Drop for SocketIoChannel {
	fn drop(&mut self) {
		self.close();
	}
}
