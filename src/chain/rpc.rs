//! JSON-RPC chain access.
//!
//! The trait carries exactly the method set the node uses; the HTTP
//! implementation fans out over multiple endpoints with per-endpoint
//! health tracking (healthy -> degraded -> cooling-down) so one bad
//! provider cannot wedge submission.

use async_trait::async_trait;
use ethers_core::types::{Address, Bytes, TransactionReceipt, H256, U256, U64};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Chain access failures.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Network-level failure; another endpoint may succeed
    #[error("rpc transport error: {0}")]
    Transport(String),
    /// The node answered with a JSON-RPC error object
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed rpc response: {0}")]
    InvalidResponse(String),
    #[error("no healthy rpc endpoint available")]
    NoEndpoint,
}

impl RpcError {
    /// Gas price below the node's replacement/acceptance floor.
    pub fn is_underpriced(&self) -> bool {
        matches!(self, RpcError::Rpc { message, .. } if message.to_lowercase().contains("underpriced"))
    }

    /// The nonce was already consumed on-chain.
    pub fn is_nonce_too_low(&self) -> bool {
        matches!(self, RpcError::Rpc { message, .. }
            if message.to_lowercase().contains("nonce too low"))
    }

    /// The identical transaction is already in the pool; harmless.
    pub fn is_already_known(&self) -> bool {
        matches!(self, RpcError::Rpc { message, .. }
            if message.to_lowercase().contains("already known"))
    }
}

/// Block tag for count/call queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
}

impl BlockTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockTag::Latest => "latest",
            BlockTag::Pending => "pending",
        }
    }
}

/// Call/estimate request body.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    pub to: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
}

/// The EVM method set the node depends on.
#[async_trait]
pub trait EthRpc: Send + Sync {
    async fn chain_id(&self) -> Result<u64, RpcError>;
    async fn block_number(&self) -> Result<u64, RpcError>;
    async fn transaction_count(&self, address: Address, tag: BlockTag) -> Result<u64, RpcError>;
    async fn gas_price(&self) -> Result<U256, RpcError>;
    async fn estimate_gas(&self, call: &CallRequest) -> Result<U256, RpcError>;
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RpcError>;
    async fn transaction_receipt(&self, hash: H256)
        -> Result<Option<TransactionReceipt>, RpcError>;
    async fn call(&self, call: &CallRequest, tag: BlockTag) -> Result<Bytes, RpcError>;
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default = "Option::default")]
    error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

/// Endpoint availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointState {
    Healthy,
    Degraded,
    CoolingDown,
}

#[derive(Debug)]
struct EndpointHealth {
    state: EndpointState,
    consecutive_failures: u32,
    cooldown_start: Option<Instant>,
}

impl EndpointHealth {
    fn new() -> Self {
        Self {
            state: EndpointState::Healthy,
            consecutive_failures: 0,
            cooldown_start: None,
        }
    }
}

/// Failures before an endpoint enters cooldown.
const FAILURE_THRESHOLD: u32 = 3;
/// How long a cooling endpoint is quarantined.
const COOLDOWN: Duration = Duration::from_secs(30);

/// reqwest-backed JSON-RPC client over one or more endpoints.
pub struct HttpRpc {
    client: reqwest::Client,
    endpoints: Vec<String>,
    health: Mutex<HashMap<String, EndpointHealth>>,
    request_id: AtomicU64,
    timeout: Duration,
}

impl HttpRpc {
    pub fn new(client: reqwest::Client, endpoints: Vec<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoints,
            health: Mutex::new(HashMap::new()),
            request_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Endpoints worth trying right now: healthy first, then degraded,
    /// then anything whose cooldown expired.
    fn usable_endpoints(&self) -> Vec<String> {
        let mut health = self.health.lock().unwrap();
        let mut healthy = Vec::new();
        let mut degraded = Vec::new();
        for endpoint in &self.endpoints {
            let entry = health
                .entry(endpoint.clone())
                .or_insert_with(EndpointHealth::new);
            if entry.state == EndpointState::CoolingDown {
                let expired = entry
                    .cooldown_start
                    .map(|start| start.elapsed() >= COOLDOWN)
                    .unwrap_or(true);
                if expired {
                    debug!("endpoint {} cooldown expired", endpoint);
                    entry.state = EndpointState::Degraded;
                    entry.consecutive_failures = 0;
                    entry.cooldown_start = None;
                }
            }
            match entry.state {
                EndpointState::Healthy => healthy.push(endpoint.clone()),
                EndpointState::Degraded => degraded.push(endpoint.clone()),
                EndpointState::CoolingDown => {}
            }
        }
        healthy.extend(degraded);
        healthy
    }

    fn record_success(&self, endpoint: &str) {
        let mut health = self.health.lock().unwrap();
        let entry = health
            .entry(endpoint.to_string())
            .or_insert_with(EndpointHealth::new);
        entry.state = EndpointState::Healthy;
        entry.consecutive_failures = 0;
        entry.cooldown_start = None;
    }

    fn record_failure(&self, endpoint: &str) {
        let mut health = self.health.lock().unwrap();
        let entry = health
            .entry(endpoint.to_string())
            .or_insert_with(EndpointHealth::new);
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= FAILURE_THRESHOLD {
            warn!(
                "endpoint {} quarantined after {} consecutive failures",
                endpoint, entry.consecutive_failures
            );
            entry.state = EndpointState::CoolingDown;
            entry.cooldown_start = Some(Instant::now());
        } else {
            entry.state = EndpointState::Degraded;
        }
    }

    /// Issue one request, failing over across endpoints on transport
    /// errors. JSON-RPC error objects come from a live node and are
    /// returned as-is. A null result maps to `None`.
    async fn execute<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, RpcError> {
        let endpoints = self.usable_endpoints();
        if endpoints.is_empty() {
            return Err(RpcError::NoEndpoint);
        }

        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut last_transport_error = None;
        for endpoint in &endpoints {
            let response = self
                .client
                .post(endpoint)
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    self.record_failure(endpoint);
                    last_transport_error = Some(format!("{} returned {}", endpoint, response.status()));
                    continue;
                }
                Err(e) => {
                    self.record_failure(endpoint);
                    last_transport_error = Some(e.to_string());
                    continue;
                }
            };

            let parsed: JsonRpcResponse<T> = match response.json().await {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.record_failure(endpoint);
                    last_transport_error = Some(e.to_string());
                    continue;
                }
            };

            self.record_success(endpoint);
            if let Some(error) = parsed.error {
                return Err(RpcError::Rpc {
                    code: error.code,
                    message: error.message,
                });
            }
            return Ok(parsed.result);
        }

        Err(RpcError::Transport(
            last_transport_error.unwrap_or_else(|| "all endpoints failed".to_string()),
        ))
    }

    /// `execute` for methods whose result must not be null.
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, RpcError> {
        self.execute(method, params)
            .await?
            .ok_or_else(|| RpcError::InvalidResponse(format!("{}: empty result", method)))
    }
}

#[async_trait]
impl EthRpc for HttpRpc {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        let id: U64 = self.request("eth_chainId", serde_json::json!([])).await?;
        Ok(id.as_u64())
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let number: U64 = self.request("eth_blockNumber", serde_json::json!([])).await?;
        Ok(number.as_u64())
    }

    async fn transaction_count(&self, address: Address, tag: BlockTag) -> Result<u64, RpcError> {
        let count: U64 = self
            .request(
                "eth_getTransactionCount",
                serde_json::json!([address, tag.as_str()]),
            )
            .await?;
        Ok(count.as_u64())
    }

    async fn gas_price(&self) -> Result<U256, RpcError> {
        self.request("eth_gasPrice", serde_json::json!([])).await
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<U256, RpcError> {
        self.request("eth_estimateGas", serde_json::json!([call]))
            .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RpcError> {
        self.request("eth_sendRawTransaction", serde_json::json!([raw]))
            .await
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        self.execute("eth_getTransactionReceipt", serde_json::json!([hash]))
            .await
    }

    async fn call(&self, call: &CallRequest, tag: BlockTag) -> Result<Bytes, RpcError> {
        self.request("eth_call", serde_json::json!([call, tag.as_str()]))
            .await
    }
}
