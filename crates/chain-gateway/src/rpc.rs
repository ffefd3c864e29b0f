//! Minimal JSON-RPC client
//!
//! Shared by the EVM and Solana gateways. Every call carries an explicit
//! timeout; transport and protocol failures surface as
//! `Error::ExternalService` so callers treat them as retryable, never as
//! "transaction not found".

use dhansetu_common::{Error, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
}

impl RpcClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::ExternalService(format!("Failed to build RPC client: {e}")))?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        debug!("RPC {} -> {}", method, self.url);

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ExternalService(format!("RPC {method} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::ExternalService(format!(
                "RPC {method} returned HTTP {}",
                response.status()
            )));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| Error::ExternalService(format!("RPC {method} bad response: {e}")))?;

        if let Some(err) = envelope.get("error").filter(|e| !e.is_null()) {
            return Err(Error::ExternalService(format!(
                "RPC {method} error: {err}"
            )));
        }

        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}
