//! JSON-RPC capability surface of the upstream chain node.
//!
//! Everything the core needs from the node goes through [`Node`]: single
//! calls, order-preserving batches, `eth_call` probes and the chain height.
//! Framing and batching are alloy's [`RpcClient`]; responses are decoded from
//! the raw result text so that integers wider than 64 bits survive.

use alloy::primitives::{hex, Address, Bytes, U64};
use alloy::rpc::client::{ClientBuilder, RpcClient};
use alloy::transports::{RpcError as WireError, TransportError};
use eyre::Context;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt::Debug;
use std::future::Future;
#[cfg(any(test, feature = "test-utils"))]
use std::sync::Arc;
use std::time::Duration;

use crate::error::RpcError;

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Default per-call deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Block selector accepted by `eth_call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
    Number(u64),
}

impl BlockTag {
    pub fn as_param(&self) -> String {
        match self {
            BlockTag::Latest => "latest".to_string(),
            BlockTag::Pending => "pending".to_string(),
            BlockTag::Number(n) => hex_quantity(*n),
        }
    }
}

/// Renders a height the way the node expects it (`0x` + minimal hex).
pub fn hex_quantity(n: u64) -> String {
    format!("{n:#x}")
}

/// One entry of a batch call.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: &'static str,
    pub params: Value,
}

impl Request {
    pub fn new(method: &'static str, params: Value) -> Self {
        Self { method, params }
    }
}

/// Optional node extensions detected at boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `debug_*` namespace (traces, modified accounts, account range).
    pub debug: bool,
    /// Wormholes/Erbie `eth_getAccountInfo` and the reward endpoints.
    pub domain: bool,
}

#[derive(Clone)]
enum Wire {
    Client(RpcClient),
    #[cfg(any(test, feature = "test-utils"))]
    Scripted(Arc<scripted::ScriptedTransport>),
}

/// Shared handle to the chain node. Cheap to clone; safe for concurrent calls.
#[derive(Clone)]
pub struct Node {
    wire: Wire,
    timeout: Duration,
}

impl Node {
    pub fn new(client: RpcClient, timeout: Duration) -> Self {
        Self {
            wire: Wire::Client(client),
            timeout,
        }
    }

    /// Creates a node handle over HTTP.
    ///
    /// # Errors
    /// Returns error if the URL is invalid.
    pub fn http(url: &str, timeout: Duration) -> eyre::Result<Self> {
        let client = ClientBuilder::default()
            .http(url.parse().wrap_err_with(|| format!("invalid RPC URL `{url}`"))?);
        Ok(Self::new(client, timeout))
    }

    /// Node answered by registered handlers instead of a socket.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn scripted(transport: Arc<scripted::ScriptedTransport>, timeout: Duration) -> Self {
        Self {
            wire: Wire::Scripted(transport),
            timeout,
        }
    }

    async fn deadline<T, F>(&self, method: &str, exchange: F) -> RpcResult<T>
    where
        F: Future<Output = RpcResult<T>>,
    {
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout {
                method: method.to_string(),
                waited_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Single call decoded into `T`. A JSON `null` result decodes into
    /// `Option::None` when `T` is an option.
    pub async fn call<T>(&self, method: &str, params: Value) -> RpcResult<T>
    where
        T: DeserializeOwned + Debug + Send + Sync + Unpin + 'static,
    {
        let exchange = async {
            match &self.wire {
                Wire::Client(client) => {
                    let result: Result<T, TransportError> =
                        client.request(method.to_string(), params).await;
                    result.map_err(|e| wire_error(method, e))
                }
                #[cfg(any(test, feature = "test-utils"))]
                Wire::Scripted(transport) => transport
                    .answer(method, &params)
                    .and_then(|text| decode_text(method, &text)),
            }
        };
        self.deadline(method, exchange).await
    }

    /// Single call returning the raw `result` value.
    pub async fn call_raw(&self, method: &str, params: Value) -> RpcResult<Value> {
        self.call(method, params).await
    }

    /// Sends all requests in one round trip.
    ///
    /// The outer error is the batch failing as a whole; each element carries
    /// its own result, in request order.
    pub async fn batch(&self, requests: &[Request]) -> RpcResult<Vec<RpcResult<Value>>> {
        self.batch_as(requests).await
    }

    /// Batch decoded element-wise into `T`.
    pub async fn batch_as<T>(&self, requests: &[Request]) -> RpcResult<Vec<RpcResult<T>>>
    where
        T: DeserializeOwned + Debug + Send + Sync + Unpin + 'static,
    {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };

        let exchange = async {
            match &self.wire {
                Wire::Client(client) => {
                    let mut batch = client.new_batch();
                    let mut waiters = Vec::with_capacity(requests.len());
                    for request in requests {
                        let waiter = batch
                            .add_call::<_, T>(request.method, &request.params)
                            .map_err(|e| wire_error(request.method, e))?;
                        waiters.push((request.method, waiter));
                    }
                    batch
                        .send()
                        .await
                        .map_err(|e| wire_error(first.method, e))?;

                    let mut results = Vec::with_capacity(waiters.len());
                    for (method, waiter) in waiters {
                        results.push(waiter.await.map_err(|e| wire_error(method, e)));
                    }
                    Ok(results)
                }
                #[cfg(any(test, feature = "test-utils"))]
                Wire::Scripted(transport) => Ok(requests
                    .iter()
                    .map(|request| {
                        transport
                            .answer(request.method, &request.params)
                            .and_then(|text| decode_text(request.method, &text))
                    })
                    .collect()),
            }
        };
        self.deadline(first.method, exchange).await
    }

    /// Read-only contract call against `tag`.
    pub async fn eth_call(&self, to: Address, data: &[u8], tag: BlockTag) -> RpcResult<Bytes> {
        self.call(
            "eth_call",
            json!([{ "to": to, "data": hex::encode_prefixed(data) }, tag.as_param()]),
        )
        .await
    }

    /// Latest height known to the node.
    pub async fn chain_height(&self) -> RpcResult<u64> {
        let height: U64 = self.call("eth_blockNumber", json!([])).await?;
        Ok(height.to::<u64>())
    }

    /// Probes the optional namespaces.
    ///
    /// A namespace the node does not serve is reported as absent. Any other
    /// failure (timeout, transport, server error) is returned, since it says
    /// nothing about what the node supports.
    ///
    /// # Errors
    /// Returns the first failure that is not a missing method.
    #[tracing::instrument(skip(self))]
    pub async fn capabilities(&self) -> RpcResult<Capabilities> {
        let debug = self.supports("debug_gcStats", json!([])).await?;
        if !debug {
            tracing::warn!("debug namespace unavailable, internal txs and account deltas disabled");
        }
        let domain = self
            .supports(
                "eth_getAccountInfo",
                json!([Address::ZERO, hex_quantity(0)]),
            )
            .await?;
        if !domain {
            tracing::warn!("wormholes extensions unavailable, domain decoding disabled");
        }
        let capabilities = Capabilities { debug, domain };
        tracing::info!(
            debug = capabilities.debug,
            domain = capabilities.domain,
            "node capabilities detected"
        );
        Ok(capabilities)
    }

    async fn supports(&self, method: &str, params: Value) -> RpcResult<bool> {
        match self.call_raw(method, params).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_method_missing() => {
                tracing::debug!(method, error = %e, "method missing, capability off");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

fn wire_error(method: &str, error: TransportError) -> RpcError {
    match error {
        WireError::ErrorResp(payload) => RpcError::Rpc {
            code: payload.code,
            message: payload.message.to_string(),
        },
        WireError::DeserError { err, .. } | WireError::SerError(err) => RpcError::Decode {
            method: method.to_string(),
            reason: err.to_string(),
        },
        WireError::NullResp => RpcError::Decode {
            method: method.to_string(),
            reason: "null response".to_string(),
        },
        other => RpcError::Transport(other.to_string()),
    }
}

#[cfg(any(test, feature = "test-utils"))]
fn decode_text<T: DeserializeOwned>(method: &str, text: &str) -> RpcResult<T> {
    serde_json::from_str(text).map_err(|e| RpcError::Decode {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(any(test, feature = "test-utils"))]
pub mod scripted {
    //! A node that answers from registered handlers instead of a socket.
    //! Used to replay fixtures and to drive the decoder in tests.

    use super::RpcResult;
    use crate::error::RpcError;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::{Mutex, RwLock};

    /// Handler result: the `result` value, or an RPC `(code, message)` error.
    pub type Reply = Result<Value, (i64, String)>;
    type Handler = Box<dyn Fn(&Value) -> Result<String, (i64, String)> + Send + Sync>;

    #[derive(Default)]
    pub struct ScriptedTransport {
        handlers: RwLock<HashMap<String, Handler>>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers (or replaces) the handler for `method`. The handler gets
        /// the `params` array.
        pub fn on<F>(&self, method: &str, handler: F) -> &Self
        where
            F: Fn(&Value) -> Reply + Send + Sync + 'static,
        {
            self.register(
                method,
                Box::new(move |params| handler(params).map(|result| result.to_string())),
            )
        }

        /// Like [`ScriptedTransport::on`], but the handler writes the result
        /// JSON text itself. Needed for integers a `Value` cannot hold.
        pub fn on_raw<F>(&self, method: &str, handler: F) -> &Self
        where
            F: Fn(&Value) -> String + Send + Sync + 'static,
        {
            self.register(method, Box::new(move |params| Ok(handler(params))))
        }

        fn register(&self, method: &str, handler: Handler) -> &Self {
            if let Ok(mut handlers) = self.handlers.write() {
                handlers.insert(method.to_string(), handler);
            }
            self
        }

        /// Number of requests seen for `method`, batch elements included.
        pub fn calls(&self, method: &str) -> usize {
            self.calls
                .lock()
                .map(|calls| calls.get(method).copied().unwrap_or(0))
                .unwrap_or(0)
        }

        /// Result text for one request.
        pub(super) fn answer(&self, method: &str, params: &Value) -> RpcResult<String> {
            if let Ok(mut calls) = self.calls.lock() {
                *calls.entry(method.to_string()).or_default() += 1;
            }

            let reply = match self.handlers.read() {
                Ok(handlers) => match handlers.get(method) {
                    Some(handler) => handler(params),
                    None => Err((
                        -32601,
                        format!("the method {method} does not exist/is not available"),
                    )),
                },
                Err(_) => Err((-32603, "handler table poisoned".to_string())),
            };
            reply.map_err(|(code, message)| RpcError::Rpc { code, message })
        }
    }
}
