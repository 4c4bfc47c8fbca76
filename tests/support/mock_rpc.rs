use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Chain state served by [`MockRpcServer`] through the CometBFT JSON-RPC
/// methods the client uses.
#[derive(Clone)]
pub struct MockNode {
    inner: Arc<MockNodeInner>,
}

struct MockNodeInner {
    head: AtomicU64,
    txs_per_block: usize,
    validator_count: usize,
    expected_auth: Option<String>,
    failures: AtomicUsize,
    methods: Mutex<Vec<String>>,
}

impl MockNode {
    pub fn new(head: u64, txs_per_block: usize, validator_count: usize) -> Self {
        Self::build(head, txs_per_block, validator_count, None)
    }

    /// Node rejecting requests that lack `Authorization: Basic <user:password>`.
    pub fn with_basic_auth(head: u64, user: &str, password: &str) -> Self {
        let encoded = BASE64_STANDARD.encode(format!("{user}:{password}"));
        Self::build(head, 0, 1, Some(format!("Basic {encoded}")))
    }

    fn build(
        head: u64,
        txs_per_block: usize,
        validator_count: usize,
        expected_auth: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(MockNodeInner {
                head: AtomicU64::new(head),
                txs_per_block,
                validator_count,
                expected_auth,
                failures: AtomicUsize::new(0),
                methods: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn head(&self) -> u64 {
        self.inner.head.load(Ordering::SeqCst)
    }

    pub fn set_head(&self, head: u64) {
        self.inner.head.store(head, Ordering::SeqCst);
    }

    /// Answers the next `count` requests with HTTP 500.
    pub fn fail_next(&self, count: usize) {
        self.inner.failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.inner
            .methods
            .lock()
            .expect("mock node poisoned")
            .iter()
            .filter(|called| called.as_str() == method)
            .count()
    }

    fn take_failure(&self) -> bool {
        self.inner
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn handle_call(&self, call: Value) -> Value {
        let id = call.get("id").cloned().unwrap_or(Value::Null);
        let method = call
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let params = call.get("params").cloned().unwrap_or(Value::Null);
        self.inner
            .methods
            .lock()
            .expect("mock node poisoned")
            .push(method.clone());

        let head = self.head();
        match method.as_str() {
            "status" => success(
                id,
                json!({
                    "node_info": {"network": "mock-1"},
                    "sync_info": {
                        "latest_block_height": head.to_string(),
                        "catching_up": false
                    }
                }),
            ),
            "block" => {
                let height = numeric_param(&params, "height").unwrap_or(head);
                if height > head {
                    return unavailable(id, height, head);
                }
                success(id, self.block_json(height))
            }
            "validators" => {
                let height = numeric_param(&params, "height").unwrap_or(head);
                if height > head {
                    return unavailable(id, height, head);
                }
                let page = numeric_param(&params, "page").unwrap_or(1) as usize;
                let per_page = numeric_param(&params, "per_page").unwrap_or(30) as usize;
                let validators: Vec<Value> = (0..self.inner.validator_count)
                    .skip((page - 1) * per_page)
                    .take(per_page)
                    .map(|rank| {
                        json!({
                            "address": format!("VAL{rank:03}"),
                            "pub_key": {"type": "tendermint/PubKeyEd25519", "value": format!("pk{rank}")},
                            "voting_power": (1000 - rank as i64).to_string(),
                            "proposer_priority": "0"
                        })
                    })
                    .collect();
                success(
                    id,
                    json!({
                        "block_height": height.to_string(),
                        "count": validators.len().to_string(),
                        "total": self.inner.validator_count.to_string(),
                        "validators": validators
                    }),
                )
            }
            "genesis" => success(
                id,
                json!({
                    "genesis": {
                        "chain_id": "mock-1",
                        "genesis_time": "2024-01-01T00:00:00Z",
                        "initial_height": "1",
                        "app_state": {"auth": {"accounts": []}}
                    }
                }),
            ),
            "tx_search" => {
                let query = params
                    .get("query")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let height = query
                    .strip_prefix("tx.height=")
                    .and_then(|raw| raw.parse::<u64>().ok())
                    .unwrap_or(0);
                let page = numeric_param(&params, "page").unwrap_or(1) as usize;
                let per_page = numeric_param(&params, "per_page").unwrap_or(30) as usize;
                let total = if height >= 1 && height <= head {
                    self.inner.txs_per_block
                } else {
                    0
                };
                // results come back newest first within a page
                let mut txs: Vec<Value> = (0..total)
                    .skip((page - 1) * per_page)
                    .take(per_page)
                    .map(|index| {
                        json!({
                            "hash": tx_hash(height, index),
                            "height": height.to_string(),
                            "index": index,
                            "tx_result": {
                                "code": if index % 2 == 0 { 0 } else { 5 },
                                "log": format!("log-{index}"),
                                "gas_wanted": "200000",
                                "gas_used": "1000",
                                "events": []
                            },
                            "tx": BASE64_STANDARD.encode(tx_bytes(height, index))
                        })
                    })
                    .collect();
                txs.reverse();
                success(
                    id,
                    json!({"txs": txs, "total_count": total.to_string()}),
                )
            }
            _ => error(id, -32601, format!("unknown method {method}"), None),
        }
    }

    fn block_json(&self, height: u64) -> Value {
        let txs: Vec<String> = (0..self.inner.txs_per_block)
            .map(|index| BASE64_STANDARD.encode(tx_bytes(height, index)))
            .collect();
        json!({
            "block_id": {"hash": format!("BLOCK{height}")},
            "block": {
                "header": {
                    "chain_id": "mock-1",
                    "height": height.to_string(),
                    "time": "2024-01-01T00:00:00Z",
                    "proposer_address": "VAL000"
                },
                "data": {"txs": txs},
                "last_commit": {
                    "height": height.saturating_sub(1).to_string(),
                    "signatures": [
                        {"block_id_flag": 2, "validator_address": "VAL000", "timestamp": "t", "signature": "sig"},
                        {"block_id_flag": 1, "validator_address": "", "timestamp": "0001-01-01T00:00:00Z", "signature": null}
                    ]
                }
            }
        })
    }
}

pub fn tx_hash(height: u64, index: usize) -> String {
    format!("HASH-{height}-{index}")
}

fn tx_bytes(height: u64, index: usize) -> Vec<u8> {
    json!({
        "body": {
            "messages": [{
                "@type": "/cosmos.bank.v1beta1.MsgSend",
                "from_address": format!("cosmos1sender{height}"),
                "to_address": "cosmos1receiver"
            }],
            "memo": format!("memo-{height}-{index}")
        },
        "auth_info": {
            "fee": {"gas_limit": "200000"},
            "signer_infos": [{"sequence": index.to_string()}]
        }
    })
    .to_string()
    .into_bytes()
}

fn numeric_param(params: &Value, name: &str) -> Option<u64> {
    match params.get(name)? {
        Value::String(raw) => raw.parse().ok(),
        Value::Number(number) => number.as_u64(),
        _ => None,
    }
}

pub struct MockRpcServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockRpcServer {
    pub async fn start(node: MockNode) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock RPC listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let node = node.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| serve_request(node.clone(), req))) }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock RPC server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{addr}"),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(node: MockNode, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::POST {
        return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "Unsupported method"));
    }

    if let Some(expected) = &node.inner.expected_auth {
        let provided = req
            .headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected.as_str()) {
            return Ok(plain(StatusCode::UNAUTHORIZED, "missing credentials"));
        }
    }

    if node.take_failure() {
        return Ok(plain(StatusCode::INTERNAL_SERVER_ERROR, "injected failure"));
    }

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return Ok(plain(
                StatusCode::BAD_REQUEST,
                format!("failed to read body: {err}"),
            ))
        }
    };

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            return Ok(plain(
                StatusCode::BAD_REQUEST,
                format!("invalid JSON payload: {err}"),
            ))
        }
    };

    let response_value = match payload {
        Value::Array(calls) => {
            Value::Array(calls.into_iter().map(|call| node.handle_call(call)).collect())
        }
        call => node.handle_call(call),
    };

    let mut response = Response::new(Body::from(response_value.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn plain(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(message.into()));
    *response.status_mut() = status;
    response
}

fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
}

fn unavailable(id: Value, height: u64, head: u64) -> Value {
    error(
        id,
        -32603,
        "Internal error",
        Some(json!(format!(
            "height {height} must be less than or equal to the current blockchain height {head}"
        ))),
    )
}

fn error(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Value {
    let mut object = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(data) = data {
        object["data"] = data;
    }
    json!({
        "jsonrpc": "2.0",
        "error": object,
        "id": id,
    })
}
