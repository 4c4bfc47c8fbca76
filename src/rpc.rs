//! CometBFT JSON-RPC source: authentication, circuit breaker, retry policy,
//! metrics, response payloads and transaction decoding.

pub mod auth;
pub mod circuit_breaker;
pub mod client;
pub mod decoder;
pub mod metrics;
pub mod options;
pub mod payload;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreakerError, CircuitBreakerSnapshot, CircuitState, RpcCircuitBreaker,
};
pub use client::{CometRpcClient, NodeStatus, RpcError};
pub use decoder::{DecodedTx, JsonTxDecoder, TxDecoder};
pub use metrics::RpcMetricsSnapshot;
pub use options::RpcClientOptions;
