//! Error taxonomy for the ingestion core.
//!
//! Orchestration code returns `eyre::Result`; the two enums here exist where
//! callers need to branch on the kind of failure (retry, skip, rewind).

use thiserror::Error;

/// Failure of a single JSON-RPC exchange with the node.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Connection refused/reset, HTTP status errors, malformed framing,
    /// missing batch entries.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The per-call deadline elapsed.
    #[error("rpc call `{method}` timed out after {waited_ms}ms")]
    Timeout { method: String, waited_ms: u64 },
    /// Application-level error object returned by the node.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    /// The response could not be parsed into the expected shape.
    #[error("failed to decode `{method}` response: {reason}")]
    Decode { method: String, reason: String },
}

impl RpcError {
    /// True for failures of the link itself rather than of the call.
    ///
    /// Mirrors the filter applied to `eth_call` probes: anything that is not a
    /// network failure is treated as "the contract does not support this".
    pub fn is_network(&self) -> bool {
        match self {
            RpcError::Transport(_) | RpcError::Timeout { .. } => true,
            RpcError::Rpc { message, .. } => {
                message.contains("connection") || message.contains("unexpected EOF")
            }
            RpcError::Decode { .. } => false,
        }
    }

    /// Method-not-found style errors mean a capability is absent.
    pub fn is_method_missing(&self) -> bool {
        matches!(self, RpcError::Rpc { code: -32601, .. })
            || matches!(self, RpcError::Rpc { message, .. } if message.contains("does not exist"))
    }
}

/// Failure to turn a height into a `Parsed` aggregate.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The node does not have this height yet.
    #[error("block {0} not found")]
    NotFound(u64),
    /// A receipt came back empty or with zero gas used.
    #[error("receipt for {0} is not ready")]
    ReceiptNotReady(String),
    /// The beneficiary list had more slots than the protocol defines.
    #[error("reward length {0} is more than 11")]
    TooManyRewards(usize),
    /// A domain payload carried a signature that does not recover.
    #[error("invalid signature in tx {tx_hash}: {reason}")]
    InvalidSignature { tx_hash: String, reason: String },
    /// A domain payload was gated in but its body is unusable.
    #[error("malformed domain payload in tx {tx_hash}: {reason}")]
    MalformedPayload { tx_hash: String, reason: String },
    /// A beneficiary entry carried neither an amount nor an SNFT.
    #[error("malformed reward #{index} at block {number}")]
    MalformedReward { number: u64, index: usize },
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl DecodeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DecodeError::NotFound(_))
    }
}
