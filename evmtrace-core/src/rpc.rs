//! JSON-RPC log source for EVM nodes
//!
//! `eth_blockNumber` and `eth_getLogs` over HTTP, plus a head watcher that turns
//! block-number polling into a stream of new heights.

use crate::{
    error::{EvmtraceError, Result},
    metrics::Metrics,
    retry::{retry_with_backoff, retry_with_rate_limit},
    types::{BlockNumber, LogFilter, RawLog},
    utils::{parse_quantity, to_hex, to_quantity},
};
use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

const HEAD_CHANNEL_CAPACITY: usize = 64;
/// Consecutive head lookups that may fail before the watcher ends its stream
const MAX_WATCH_FAILURES: u32 = 5;

/// Source of contract logs and chain head notifications
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn head_block_number(&self) -> Result<BlockNumber>;

    /// Logs matching `filter`, in chain order
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>>;

    /// Stream of new head heights. The stream ends when the underlying watcher gives up.
    async fn subscribe_new_blocks(&self) -> Result<BlockSubscription>;
}

/// Handle on a stream of new block heights
pub struct BlockSubscription {
    receiver: mpsc::Receiver<BlockNumber>,
    handle: Option<JoinHandle<()>>,
}

impl BlockSubscription {
    pub fn new(receiver: mpsc::Receiver<BlockNumber>, handle: Option<JoinHandle<()>>) -> Self {
        Self { receiver, handle }
    }

    /// Next height, or `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<BlockNumber> {
        self.receiver.recv().await
    }

    /// Stop the producer and release the stream
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.receiver.close();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for BlockSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Log object as returned by `eth_getLogs`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    #[serde(default)]
    topics: Vec<B256>,
    #[serde(default)]
    data: Bytes,
    block_number: Option<String>,
    transaction_hash: Option<B256>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

impl RpcLog {
    /// `None` for logs that were removed by a reorg or are still pending
    fn into_raw_log(self) -> Option<Result<RawLog>> {
        if self.removed {
            debug!("Skipping removed log");
            return None;
        }

        let (Some(block_number), Some(transaction_hash), Some(log_index)) =
            (self.block_number, self.transaction_hash, self.log_index)
        else {
            debug!("Skipping pending log");
            return None;
        };

        let parsed = parse_quantity(&block_number).and_then(|block_number| {
            Ok(RawLog {
                address: self.address,
                topics: self.topics,
                data: self.data,
                block_number,
                transaction_hash,
                log_index: parse_quantity(&log_index)?,
            })
        });

        Some(parsed)
    }
}

/// JSON-RPC client for EVM nodes
#[derive(Clone)]
pub struct JsonRpcClient {
    client: reqwest::Client,
    url: String,
    max_retries: u32,
    block_poll_interval: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl JsonRpcClient {
    pub fn new(url: &str, timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EvmtraceError::Rpc(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.to_string(),
            max_retries,
            block_poll_interval: Duration::from_secs(4),
            metrics: None,
        })
    }

    /// Interval at which the head watcher polls `eth_blockNumber`
    pub fn with_block_poll_interval(mut self, interval: Duration) -> Self {
        self.block_poll_interval = interval;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn call_once(&self, method: &str, params: &Value) -> Result<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EvmtraceError::Rpc(format!("{} request failed: {}", method, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EvmtraceError::Rpc(format!(
                "{} returned HTTP {}",
                method, status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| EvmtraceError::Rpc(format!("Failed to parse {} response: {}", method, e)))?;

        if let Some(error) = body.get("error") {
            return Err(EvmtraceError::Rpc(format!("{} failed: {}", method, error)));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| EvmtraceError::Rpc(format!("{} response missing 'result'", method)))
    }

    /// Make a JSON-RPC call with transport-level retries
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let result = retry_with_backoff(
            || self.call_once(method, &params),
            self.max_retries,
            Duration::from_millis(250),
            Duration::from_secs(5),
        )
        .await;

        self.record_call(result.is_err());
        result
    }

    /// Like [`Self::call`], with longer waits when the provider throttles
    async fn call_rate_limited(&self, method: &str, params: Value) -> Result<Value> {
        let result =
            retry_with_rate_limit(|| self.call_once(method, &params), self.max_retries).await;

        self.record_call(result.is_err());
        result
    }

    fn record_call(&self, failed: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_rpc_call(failed);
        }
    }

    fn log_filter_params(filter: &LogFilter) -> Value {
        let mut object = json!({
            "address": to_hex(filter.address.as_slice()),
            "fromBlock": to_quantity(filter.from_block),
            "toBlock": to_quantity(filter.to_block),
        });

        if !filter.topics.is_empty() {
            let topic0: Vec<String> = filter.topics.iter().map(to_hex).collect();
            object["topics"] = json!([topic0]);
        }

        json!([object])
    }

    fn parse_logs(result: Value) -> Result<Vec<RawLog>> {
        let logs: Vec<RpcLog> = serde_json::from_value(result)?;
        logs.into_iter().filter_map(RpcLog::into_raw_log).collect()
    }
}

#[async_trait]
impl LogSource for JsonRpcClient {
    async fn head_block_number(&self) -> Result<BlockNumber> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let quantity = result
            .as_str()
            .ok_or_else(|| EvmtraceError::Rpc("eth_blockNumber result is not a string".to_string()))?;
        parse_quantity(quantity)
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>> {
        let result = self
            .call_rate_limited("eth_getLogs", Self::log_filter_params(filter))
            .await?;
        Self::parse_logs(result)
    }

    async fn subscribe_new_blocks(&self) -> Result<BlockSubscription> {
        let mut last_seen = self.head_block_number().await?;
        let (sender, receiver) = mpsc::channel(HEAD_CHANNEL_CAPACITY);
        let client = self.clone();
        let period = self.block_poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut failures = 0;

            loop {
                ticker.tick().await;
                match client.head_block_number().await {
                    Ok(head) => {
                        failures = 0;
                        if head > last_seen {
                            last_seen = head;
                            if sender.send(head).await.is_err() {
                                debug!("Block subscriber went away, stopping head watcher");
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            "Head watcher failed to read block number ({}/{}): {}",
                            failures, MAX_WATCH_FAILURES, e
                        );
                        if failures >= MAX_WATCH_FAILURES {
                            break;
                        }
                    }
                }
            }
        });

        Ok(BlockSubscription::new(receiver, Some(handle)))
    }
}
