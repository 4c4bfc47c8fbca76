//! CometBFT JSON-RPC client implementing [`Source`].
//!
//! Every call goes through the shared circuit breaker and is retried with
//! exponential backoff. New blocks are discovered by polling `status`.

use crate::rpc::auth::build_auth_headers;
use crate::rpc::circuit_breaker::{CircuitBreakerError, RpcCircuitBreaker};
use crate::rpc::decoder::{JsonTxDecoder, TxDecoder};
use crate::rpc::metrics::{RpcMetrics, RpcMetricsSnapshot};
use crate::rpc::options::RpcClientOptions;
use crate::rpc::payload::{
    validator_set, BlockResponse, GenesisResponse, StatusResponse, TxSearchResponse,
    ValidatorsResponse,
};
use crate::rpc::retry::{backoff_delay, RetryContext};
use crate::source::{NewBlockStream, Source};
use crate::types::{Block, GenesisDoc, Transaction, ValidatorSet};
use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use jsonrpsee::core::{client::ClientT, client::Error as JsonRpcError, http_helpers::HttpError};
use jsonrpsee::core::params::ObjectParams;
use jsonrpsee::http_client::transport::Error as HttpTransportError;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use serde::de::DeserializeOwned;
use std::{future::Future, sync::Arc};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// CometBFT reports heights above its head with this phrase.
const HEIGHT_UNAVAILABLE_MARKER: &str = "must be less than or equal to";

#[derive(Debug)]
pub enum RpcError {
    Timeout { method: &'static str },
    CircuitOpen,
    HeightUnavailable { height: u64 },
    ResponseTooLarge { method: &'static str },
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Timeout { method } => write!(f, "rpc method {method} timed out"),
            RpcError::CircuitOpen => write!(f, "rpc circuit breaker is open"),
            RpcError::HeightUnavailable { height } => {
                write!(f, "height {height} is not available on the node yet")
            }
            RpcError::ResponseTooLarge { method } => {
                write!(f, "rpc {method} response exceeded HTTP size limits")
            }
        }
    }
}

impl std::error::Error for RpcError {}

/// Node identity and sync state as reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub network: String,
    pub latest_height: u64,
    pub catching_up: bool,
}

#[derive(Clone)]
pub struct CometRpcClient {
    endpoint: Arc<String>,
    client: HttpClient,
    options: RpcClientOptions,
    metrics: Arc<RpcMetrics>,
    breaker: Arc<RpcCircuitBreaker>,
    decoder: Arc<dyn TxDecoder>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for CometRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CometRpcClient")
            .field("endpoint", &self.endpoint)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl CometRpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_options(url, RpcClientOptions::default())
    }

    pub fn with_options(url: impl Into<String>, options: RpcClientOptions) -> Result<Self> {
        Self::with_options_and_breaker(url, options, Arc::new(RpcCircuitBreaker::default()))
    }

    pub fn with_options_and_breaker(
        url: impl Into<String>,
        options: RpcClientOptions,
        breaker: Arc<RpcCircuitBreaker>,
    ) -> Result<Self> {
        options.validate()?;

        let endpoint = url.into();
        let headers = build_auth_headers(options.basic_auth.as_ref())?;
        let max_request_body_size = options.max_request_body_bytes.min(u32::MAX as usize) as u32;
        let max_response_body_size = options.max_response_body_bytes.min(u32::MAX as usize) as u32;

        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(options.request_timeout)
            .max_concurrent_requests(options.max_concurrent_requests)
            .max_request_size(max_request_body_size)
            .max_response_size(max_response_body_size)
            .build(&endpoint)
            .map_err(|err| anyhow!("failed to build RPC client: {err}"))?;

        Ok(Self {
            endpoint: Arc::new(endpoint),
            client,
            options,
            metrics: Arc::new(RpcMetrics::default()),
            breaker,
            decoder: Arc::new(JsonTxDecoder),
            shutdown: CancellationToken::new(),
        })
    }

    /// Replaces the transaction decoder used by [`CometRpcClient::fetch_txs`].
    pub fn with_decoder(mut self, decoder: Arc<dyn TxDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn metrics(&self) -> RpcMetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.breaker_state = self.breaker.snapshot().state;
        snapshot
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let status: StatusResponse = self
            .call(RetryContext::new("status"), || Ok(ObjectParams::new()))
            .await?;
        Ok(NodeStatus {
            network: status.node_info.network,
            latest_height: status.sync_info.latest_block_height,
            catching_up: status.sync_info.catching_up,
        })
    }

    pub async fn fetch_block(&self, height: u64) -> Result<Block> {
        let response: BlockResponse = self
            .call(RetryContext::at_height("block", height), || {
                height_params(height)
            })
            .await?;
        let block = response.into_block()?;
        if block.height != height {
            bail!(
                "node returned block {} when asked for block {height}",
                block.height
            );
        }
        Ok(block)
    }

    /// Fetches every page of the validator set active at `height`.
    pub async fn fetch_validators(&self, height: u64) -> Result<ValidatorSet> {
        let per_page = self.options.page_size;
        let mut pages = Vec::new();
        let mut seen = 0u64;
        let mut page = 1usize;

        loop {
            let response: ValidatorsResponse = self
                .call(RetryContext::at_height("validators", height), || {
                    let mut params = height_params(height)?;
                    params.insert("page", page.to_string())?;
                    params.insert("per_page", per_page.to_string())?;
                    Ok(params)
                })
                .await?;

            if response.block_height != height {
                bail!(
                    "node returned validators for height {} when asked for {height}",
                    response.block_height
                );
            }
            let received = response.validators.len() as u64;
            let total = response.total;
            seen += received;
            pages.push(response);

            if received == 0 || seen >= total {
                break;
            }
            page += 1;
        }

        Ok(validator_set(height, pages))
    }

    pub async fn fetch_genesis(&self) -> Result<GenesisDoc> {
        let response: GenesisResponse = self
            .call(RetryContext::new("genesis"), || Ok(ObjectParams::new()))
            .await?;
        Ok(response.genesis)
    }

    /// Loads the execution results of `block` through `tx_search` and pairs
    /// them, by index, with the block's raw transaction bytes.
    pub async fn fetch_txs(&self, block: &Block) -> Result<Vec<Transaction>> {
        if block.txs.is_empty() {
            return Ok(Vec::new());
        }

        let height = block.height;
        let per_page = self.options.page_size;
        let query = format!("tx.height={height}");
        let mut results = Vec::with_capacity(block.txs.len());
        let mut page = 1usize;

        loop {
            let response: TxSearchResponse = self
                .call(RetryContext::at_height("tx_search", height), || {
                    let mut params = ObjectParams::new();
                    params.insert("query", query.as_str())?;
                    params.insert("prove", false)?;
                    params.insert("page", page.to_string())?;
                    params.insert("per_page", per_page.to_string())?;
                    params.insert("order_by", "asc")?;
                    Ok(params)
                })
                .await?;

            let received = response.txs.len();
            let total = response.total_count;
            results.extend(response.txs);

            if received == 0 || results.len() as u64 >= total {
                break;
            }
            page += 1;
        }

        if results.len() != block.txs.len() {
            bail!(
                "tx_search returned {} transactions for height {height} but the block carries {}",
                results.len(),
                block.txs.len()
            );
        }
        results.sort_by_key(|result| result.index);

        results
            .into_iter()
            .map(|result| {
                if result.height != height {
                    bail!(
                        "tx_search returned tx {} from height {} while indexing {height}",
                        result.hash,
                        result.height
                    );
                }
                let raw = block.txs.get(result.index as usize).with_context(|| {
                    format!("tx {} has index {} outside block {height}", result.hash, result.index)
                })?;
                let decoded = self
                    .decoder
                    .decode(raw)
                    .with_context(|| format!("failed to decode tx {} at height {height}", result.hash))?;

                Ok(Transaction {
                    hash: result.hash,
                    height,
                    success: result.tx_result.code == 0,
                    messages: decoded.messages,
                    memo: decoded.memo,
                    fee: decoded.fee,
                    signer_infos: decoded.signer_infos,
                    gas_wanted: result.tx_result.gas_wanted,
                    gas_used: result.tx_result.gas_used,
                    raw_log: result.tx_result.log,
                    events: result.tx_result.events,
                })
            })
            .collect()
    }

    /// Starts a task that polls `status` and streams every block above the
    /// height observed at subscription time. The stream ends only when the
    /// client shuts down or the receiver is dropped.
    pub async fn poll_new_blocks(&self) -> Result<NewBlockStream> {
        let mut next = self
            .status()
            .await
            .context("failed to read the starting height for new-block polling")?
            .latest_height
            + 1;
        let (sender, receiver) = mpsc::channel(self.options.subscription_buffer);
        let client = self.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = interval(client.options.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            'poll: loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let head = match client.status().await {
                    Ok(status) => status.latest_height,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to poll node status");
                        continue;
                    }
                };

                while next <= head {
                    let fetched = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break 'poll,
                        fetched = client.fetch_block(next) => fetched,
                    };
                    let block = match fetched {
                        Ok(block) => block,
                        Err(err) => {
                            tracing::warn!(height = next, error = %err, "failed to fetch new block; will retry");
                            break;
                        }
                    };

                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break 'poll,
                        sent = sender.send(block) => {
                            if sent.is_err() {
                                tracing::debug!("new-block receiver dropped; stopping poller");
                                break 'poll;
                            }
                        }
                    }
                    next += 1;
                }
            }

            tracing::debug!(next_height = next, "new-block poller stopped");
        });

        Ok(receiver)
    }

    /// Cancels background pollers; their streams close afterwards.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn call<R, P>(&self, context: RetryContext, params: P) -> Result<R>
    where
        R: DeserializeOwned,
        P: Fn() -> Result<ObjectParams, serde_json::Error>,
    {
        let build_params = &params;
        self.retry_with_breaker(context, move || async move {
            let params = build_params()
                .with_context(|| format!("failed to serialize {} params", context.method()))?;
            self.request_once(context, params).await
        })
        .await
    }

    async fn request_once<R: DeserializeOwned>(
        &self,
        context: RetryContext,
        params: ObjectParams,
    ) -> Result<R> {
        let method = context.method();
        timeout(
            self.options.request_timeout,
            self.client.request::<R, _>(method, params),
        )
        .await
        .map_err(|_| RpcError::Timeout { method })?
        .map_err(|err| map_rpc_error(method, context.height(), err))
    }

    /// Shared retry/backoff loop that wraps RPC operations with breaker gating,
    /// metrics and consistent logging.
    async fn retry_with_breaker<T, F, Fut>(
        &self,
        context: RetryContext,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match self.breaker.before_request() {
                Ok(state) => context.log_permit(state),
                Err(CircuitBreakerError::CircuitOpen) => {
                    context.log_circuit_open();
                    return Err(RpcError::CircuitOpen.into());
                }
            }

            attempt += 1;
            let start = Instant::now();

            let err = match operation().await {
                Ok(value) => {
                    self.metrics.record_success(start.elapsed());
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) => err,
            };

            let elapsed = start.elapsed();
            let timed_out = match err.downcast_ref::<RpcError>() {
                Some(RpcError::HeightUnavailable { height }) => {
                    self.metrics.record_height_unavailable(elapsed);
                    self.breaker.record_success();
                    context.log_unavailable(attempt, *height);
                    return Err(err);
                }
                Some(RpcError::ResponseTooLarge { .. }) => {
                    self.metrics.record_failure(elapsed);
                    self.breaker.record_failure();
                    context.log_oversized(attempt);
                    return Err(err);
                }
                Some(RpcError::Timeout { .. }) => {
                    self.metrics.record_timeout(elapsed);
                    true
                }
                _ => {
                    self.metrics.record_failure(elapsed);
                    false
                }
            };
            self.breaker.record_failure();

            if attempt >= self.options.max_attempts {
                context.log_exhausted(attempt, &err);
                return Err(err);
            }

            let backoff = backoff_delay(
                attempt,
                self.options.initial_backoff,
                self.options.max_backoff,
            );
            context.log_retry(attempt, backoff, &err, timed_out);
            sleep(backoff).await;
        }
    }
}

impl Source for CometRpcClient {
    fn latest_height(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.status().await?.latest_height) })
    }

    fn block(&self, height: u64) -> BoxFuture<'_, Result<Block>> {
        Box::pin(self.fetch_block(height))
    }

    fn txs<'a>(&'a self, block: &'a Block) -> BoxFuture<'a, Result<Vec<Transaction>>> {
        Box::pin(self.fetch_txs(block))
    }

    fn validators(&self, height: u64) -> BoxFuture<'_, Result<ValidatorSet>> {
        Box::pin(self.fetch_validators(height))
    }

    fn genesis(&self) -> BoxFuture<'_, Result<GenesisDoc>> {
        Box::pin(self.fetch_genesis())
    }

    fn subscribe_new_blocks(&self) -> BoxFuture<'_, Result<NewBlockStream>> {
        Box::pin(self.poll_new_blocks())
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.close();
            Ok(())
        })
    }
}

fn height_params(height: u64) -> Result<ObjectParams, serde_json::Error> {
    let mut params = ObjectParams::new();
    params.insert("height", height.to_string())?;
    Ok(params)
}

fn map_rpc_error(method: &'static str, height: Option<u64>, err: JsonRpcError) -> anyhow::Error {
    if response_too_large(&err) {
        return RpcError::ResponseTooLarge { method }.into();
    }
    if let (JsonRpcError::Call(object), Some(height)) = (&err, height) {
        let in_data = object
            .data()
            .is_some_and(|data| data.get().contains(HEIGHT_UNAVAILABLE_MARKER));
        if in_data || object.message().contains(HEIGHT_UNAVAILABLE_MARKER) {
            return RpcError::HeightUnavailable { height }.into();
        }
    }
    anyhow!("rpc {method} call failed: {err}")
}

fn response_too_large(err: &JsonRpcError) -> bool {
    let JsonRpcError::Transport(inner) = err else {
        return false;
    };
    match inner.downcast_ref::<HttpTransportError>() {
        Some(HttpTransportError::Http(http_err)) => matches!(http_err, HttpError::TooLarge),
        Some(HttpTransportError::RequestTooLarge) => true,
        _ => false,
    }
}
