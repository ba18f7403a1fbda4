//! HTTP request layer for the blockbook REST API.
//!
//! Every call is a GET relative to the coin-specific base URL. Responses are
//! returned as raw body text so the client can decode them into the shape the
//! endpoint needs. Failures are classified here (see [`IndexerError::is_retryable`]
//! and [`IndexerError::is_fatal`]) because upstream retry policies branch on it.

use super::types::IndexerError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use tracing::debug;

/// Issues requests against the indexer.
///
/// The production implementation is [`HttpRequester`]; tests substitute canned
/// responses behind the same trait.
#[async_trait]
pub trait Requester: Send + Sync {
	/// GET `endpoint` (joined onto the base URL path) with the given query pairs.
	async fn get(&self, endpoint: &str, query: &[(&str, String)]) -> Result<String, IndexerError>;
}

/// Only plain HTTP(S) endpoints are supported.
pub fn validate_scheme(target: &Url) -> Result<(), IndexerError> {
	match target.scheme() {
		"https" | "http" => Ok(()),
		other => Err(IndexerError::UnsupportedScheme(other.to_string())),
	}
}

/// Join `endpoint` onto the base URL path, ignoring leading and trailing slashes.
pub(crate) fn endpoint_url(base: &Url, endpoint: &str) -> Url {
	let mut url = base.clone();
	let base_path = base.path().trim_end_matches('/');
	let endpoint = endpoint.trim_matches('/');
	let path = match (base_path.is_empty(), endpoint.is_empty()) {
		(true, true) => "/".to_string(),
		(false, true) => base_path.to_string(),
		_ => format!("{}/{}", base_path, endpoint),
	};
	url.set_path(&path);
	url.set_query(None);
	url
}

/// reqwest-backed [`Requester`].
pub struct HttpRequester {
	http_client: Client,
	api_url: Url,
}

impl HttpRequester {
	/// Build a requester for `api_url` with a fixed client-side timeout and an
	/// optional outbound proxy.
	pub fn new(
		api_url: Url,
		timeout: Duration,
		proxy_url: Option<&str>,
	) -> Result<Self, IndexerError> {
		validate_scheme(&api_url)?;

		let mut builder = Client::builder().timeout(timeout);
		// Only the configured proxy is used, never one from the environment.
		builder = match proxy_url {
			Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy)?),
			None => builder.no_proxy(),
		};
		let http_client = builder.build()?;

		Ok(Self {
			http_client,
			api_url,
		})
	}

	async fn send_once(
		&self,
		url: &Url,
		query: &[(&str, String)],
	) -> Result<reqwest::Response, IndexerError> {
		let mut request = self
			.http_client
			.get(url.clone())
			.header("Content-Type", "application/json");
		if !query.is_empty() {
			request = request.query(query);
		}
		request
			.send()
			.await
			.map_err(|e| classify_transport(e, url))
	}
}

#[async_trait]
impl Requester for HttpRequester {
	async fn get(&self, endpoint: &str, query: &[(&str, String)]) -> Result<String, IndexerError> {
		let url = endpoint_url(&self.api_url, endpoint);

		let mut response = self.send_once(&url, query).await?;
		// The indexer occasionally answers 400 to a well formed request; one
		// retry is enough to tell a glitch from a real rejection.
		if response.status() == StatusCode::BAD_REQUEST {
			debug!("Bad request from {}, retrying once", url);
			response = self.send_once(&url, query).await?;
		}

		let status = response.status();
		if status.is_success() {
			return response
				.text()
				.await
				.map_err(|e| classify_transport(e, &url));
		}

		let body = response.text().await.unwrap_or_default();
		Err(classify_status(status, body))
	}
}

fn classify_transport(err: reqwest::Error, url: &Url) -> IndexerError {
	if err.is_timeout() {
		IndexerError::Timeout(url.to_string())
	} else {
		IndexerError::HttpError(err)
	}
}

fn classify_status(status: StatusCode, body: String) -> IndexerError {
	if status.is_server_error() {
		IndexerError::ServerError {
			status: status.as_u16(),
			body,
		}
	} else {
		IndexerError::StatusError {
			status: status.as_u16(),
			body,
		}
	}
}
