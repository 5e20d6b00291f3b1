use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tractor_indexer::rpc::{parse_quantity, to_quantity};
use tractor_indexer::Event;

use super::helpers::timestamp_of;

#[derive(Clone)]
struct MockLog {
    address: Address,
    topics: Vec<B256>,
    data: Vec<u8>,
    block_number: u64,
    log_index: u64,
    transaction_hash: B256,
    removed: bool,
}

impl MockLog {
    fn to_json(&self) -> Value {
        json!({
            "address": self.address,
            "topics": self.topics,
            "data": format!("0x{}", hex::encode(&self.data)),
            "blockNumber": to_quantity(self.block_number),
            "blockHash": B256::with_last_byte(self.block_number as u8),
            "transactionHash": self.transaction_hash,
            "transactionIndex": "0x0",
            "logIndex": to_quantity(self.log_index),
            "removed": self.removed,
        })
    }
}

#[derive(Default)]
struct MockNodeInner {
    head: u64,
    logs: Vec<MockLog>,
}

/// Minimal execution node: a chain head, a log store and block timestamps.
#[derive(Clone, Default)]
pub struct MockNode {
    inner: Arc<RwLock<MockNodeInner>>,
    get_logs_calls: Arc<AtomicUsize>,
}

impl MockNode {
    pub fn new(head: u64) -> Self {
        let node = Self::default();
        node.set_head(head);
        node
    }

    pub fn set_head(&self, head: u64) {
        self.inner.write().expect("mock node poisoned").head = head;
    }

    pub fn head(&self) -> u64 {
        self.inner.read().expect("mock node poisoned").head
    }

    /// Stores `event` as a log emitted by `address`.
    pub fn push_event(&self, address: Address, event: &Event) {
        self.push(address, event, false);
    }

    /// Stores `event` as a log dropped by a reorg (`removed: true`).
    pub fn push_removed(&self, address: Address, event: &Event) {
        self.push(address, event, true);
    }

    pub fn get_logs_calls(&self) -> usize {
        self.get_logs_calls.load(Ordering::SeqCst)
    }

    fn push(&self, address: Address, event: &Event, removed: bool) {
        let (topics, data) = event.args.encode_log();
        self.inner.write().expect("mock node poisoned").logs.push(MockLog {
            address,
            topics,
            data,
            block_number: event.raw_log.block_number,
            log_index: event.raw_log.log_index,
            transaction_hash: event.raw_log.transaction_hash,
            removed,
        });
    }

    fn logs(&self, filter: &Value) -> Result<Value> {
        let from = quantity_field(filter, "fromBlock")?;
        let to = quantity_field(filter, "toBlock")?;
        let address: Option<Address> = filter
            .get("address")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .context("invalid address filter")?;
        let topic0: Vec<B256> = filter
            .get("topics")
            .and_then(|topics| topics.get(0))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .context("invalid topics filter")?
            .unwrap_or_default();

        let inner = self.inner.read().expect("mock node poisoned");
        let logs: Vec<Value> = inner
            .logs
            .iter()
            .filter(|log| (from..=to).contains(&log.block_number))
            .filter(|log| address.map_or(true, |address| log.address == address))
            .filter(|log| {
                topic0.is_empty() || log.topics.first().is_some_and(|topic| topic0.contains(topic))
            })
            .map(MockLog::to_json)
            .collect();
        Ok(Value::Array(logs))
    }

    fn block(&self, number: u64) -> Value {
        if number > self.head() {
            return Value::Null;
        }
        json!({
            "number": to_quantity(number),
            "hash": B256::with_last_byte(number as u8),
            "timestamp": to_quantity(timestamp_of(number)),
        })
    }
}

fn quantity_field(filter: &Value, name: &str) -> Result<u64> {
    let raw = filter
        .get(name)
        .and_then(Value::as_str)
        .with_context(|| format!("missing {name}"))?;
    parse_quantity(raw)
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
            url: format!("http://{}", addr),
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
        let mut response = Response::new(Body::from("Unsupported method"));
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return Ok(response);
    }

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("failed to read body: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            let mut response = Response::new(Body::from(format!("invalid JSON payload: {err}")));
            *response.status_mut() = StatusCode::BAD_REQUEST;
            return Ok(response);
        }
    };

    let response_value = match payload {
        Value::Array(calls) => Value::Array(
            calls
                .into_iter()
                .map(|call| handle_call(&node, call))
                .collect(),
        ),
        call => handle_call(&node, call),
    };

    let mut response = Response::new(Body::from(response_value.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn handle_call(node: &MockNode, call: Value) -> Value {
    let id = call.get("id").cloned().unwrap_or(Value::Null);
    let method = call
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = call
        .get("params")
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()));
    let first = params.get(0).cloned().unwrap_or(Value::Null);

    match method.as_str() {
        "eth_blockNumber" => success(id, json!(to_quantity(node.head()))),
        "eth_getLogs" => {
            node.get_logs_calls.fetch_add(1, Ordering::SeqCst);
            match node.logs(&first) {
                Ok(logs) => success(id, logs),
                Err(err) => error(id, -32602, format!("{err:#}")),
            }
        }
        "eth_getBlockByNumber" => match first.as_str().map(parse_quantity) {
            Some(Ok(number)) => success(id, node.block(number)),
            _ => error(id, -32602, "invalid block number"),
        },
        _ => error(id, -32601, format!("unknown method {method}")),
    }
}

fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
}

fn error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message.into(),
        },
        "id": id,
    })
}
