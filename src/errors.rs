//! Error taxonomy for the read layer.
//!
//! `ReadError` is what callers see. It is `Clone` because one settled result
//! is handed to every waiter of a deduplicated or debounced request, so
//! underlying library errors are captured as text.
//!
//! `PersistenceError` never leaves the cache: the cache logs it and behaves
//! as if the entry was missing.

use ethers::types::Address;
use thiserror::Error;

/// Errors surfaced by the read layer.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReadError {
    /// A single RPC request failed (timeout, 5xx, connection reset, ...).
    #[error("RPC request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    /// The node answered with a JSON-RPC error object (revert, bad params).
    /// The endpoint itself is fine, so this never triggers failover.
    #[error("RPC error {code} from {endpoint}: {message}")]
    Rpc {
        endpoint: String,
        code: i64,
        message: String,
    },

    /// A sub-call returned data that does not match the expected ABI.
    #[error("failed to decode {function}() result from {target:?}: {message}")]
    Decode {
        target: Address,
        function: String,
        message: String,
    },

    /// Call arguments could not be ABI-encoded.
    #[error("failed to encode {function}() call: {message}")]
    Encode { function: String, message: String },

    /// No network entry is configured for this chain id.
    #[error("unsupported chain id {0}")]
    UnsupportedChain(u64),

    /// Every known endpoint of a chain failed during one logical operation.
    #[error("All RPC endpoints failed for chain {chain_id}: {last_error}")]
    AllEndpointsFailed { chain_id: u64, last_error: String },

    /// A batch function returned fewer results than it was given inputs.
    #[error("batch `{identifier}` returned no result for item {index}")]
    MissingBatchResult { identifier: String, index: usize },

    /// The request was superseded, cleared or dropped before it ran.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// A spawned background task panicked or was aborted.
    #[error("background task failed: {0}")]
    TaskFailed(String),

    /// Caller supplied something unusable (bad address, bad url, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ReadError {
    pub fn transport(endpoint: impl Into<String>, message: impl ToString) -> Self {
        ReadError::Transport {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn rpc(endpoint: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        ReadError::Rpc {
            endpoint: endpoint.into(),
            code,
            message: message.into(),
        }
    }

    pub fn decode(target: Address, function: impl Into<String>, message: impl ToString) -> Self {
        ReadError::Decode {
            target,
            function: function.into(),
            message: message.to_string(),
        }
    }

    /// True when the node itself answered; retrying elsewhere gives the same.
    pub fn is_rpc_response(&self) -> bool {
        matches!(self, ReadError::Rpc { .. })
    }

    /// True for failures isolated to one sub-call of a batch.
    pub fn is_decode(&self) -> bool {
        matches!(self, ReadError::Decode { .. })
    }
}

pub type ReadResult<T> = std::result::Result<T, ReadError>;

/// Errors raised by a persistent cache backend.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistent store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistent store codec failed: {0}")]
    Codec(String),

    #[error("persistent store backend failed: {0}")]
    Backend(String),
}

impl From<bincode::Error> for PersistenceError {
    fn from(err: bincode::Error) -> Self {
        PersistenceError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Codec(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for PersistenceError {
    fn from(err: redis::RedisError) -> Self {
        PersistenceError::Backend(err.to_string())
    }
}
