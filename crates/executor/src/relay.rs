//! JSON-RPC bundle relay client

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use pusher_core::{SubmissionError, SubmissionResult, TxId};

use crate::client::{BundleRelay, SignedTransaction};

/// JSON-RPC error code relays use for rate limiting
const RATE_LIMITED: i64 = -32097;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Submits bundles with `sendBundle` to `{endpoint}/api/v1/bundles`
pub struct HttpRelay {
    endpoint: String,
    url: String,
    http: reqwest::Client,
}

impl HttpRelay {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> SubmissionResult<Self> {
        let endpoint = endpoint.into();
        let url = format!("{}/api/v1/bundles", endpoint.trim_end_matches('/'));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SubmissionError::Transient(e.to_string()))?;

        Ok(Self { endpoint, url, http })
    }
}

#[async_trait]
impl BundleRelay for HttpRelay {
    fn id(&self) -> &str {
        &self.endpoint
    }

    async fn submit_bundle(&self, bundle: &[SignedTransaction]) -> SubmissionResult<TxId> {
        let body = send_bundle_request(bundle);

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SubmissionError::Transient(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(SubmissionError::Transient(format!("relay returned {status}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| SubmissionError::Transient(e.to_string()))?;
        debug!(relay = %self.endpoint, %status, "sendBundle response");

        interpret_response(&text)
    }
}

fn send_bundle_request(bundle: &[SignedTransaction]) -> serde_json::Value {
    let encoded: Vec<String> = bundle
        .iter()
        .map(|tx| base64::engine::general_purpose::STANDARD.encode(tx))
        .collect();

    serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "sendBundle",
        "params": [encoded, { "encoding": "base64" }],
    })
}

fn interpret_response(text: &str) -> SubmissionResult<TxId> {
    let response: RpcResponse = serde_json::from_str(text)
        .map_err(|e| SubmissionError::Transient(format!("unreadable relay response: {e}")))?;

    match (response.result, response.error) {
        (Some(bundle_id), _) => Ok(TxId(bundle_id)),
        (None, Some(error)) => {
            let congested = error.code == RATE_LIMITED
                || error.message.to_lowercase().contains("rate limit")
                || error.message.to_lowercase().contains("congested");
            if congested {
                Err(SubmissionError::Transient(error.message))
            } else {
                Err(SubmissionError::Rejected(error.message))
            }
        }
        (None, None) => Err(SubmissionError::Transient("empty relay response".into())),
    }
}
