// src/transport.rs
//
// Raw JSON-RPC access to a single endpoint. The load balancer picks the
// endpoint; implementations only talk to it.

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::prelude::{Http, Middleware, Provider};
use ethers::providers::RpcError;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use log::debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{ReadError, ReadResult};

/// The three reads the crate issues against a node.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// `eth_call` at the latest block.
    async fn call(&self, endpoint: &str, to: Address, data: Bytes) -> ReadResult<Bytes>;

    /// `eth_getBalance` at the latest block.
    async fn get_balance(&self, endpoint: &str, account: Address) -> ReadResult<U256>;

    /// `eth_blockNumber`, used as the health probe.
    async fn block_number(&self, endpoint: &str) -> ReadResult<u64>;
}

/// ethers `Provider<Http>` per endpoint URL, created on first use.
pub struct HttpTransport {
    providers: DashMap<String, Arc<Provider<Http>>>,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            providers: DashMap::new(),
            request_timeout,
        }
    }

    fn provider(&self, endpoint: &str) -> ReadResult<Arc<Provider<Http>>> {
        if let Some(provider) = self.providers.get(endpoint) {
            return Ok(Arc::clone(provider.value()));
        }
        let provider = Provider::<Http>::try_from(endpoint)
            .map_err(|e| ReadError::InvalidInput(format!("rpc url {}: {}", endpoint, e)))?;
        let provider = Arc::new(provider);
        self.providers
            .insert(endpoint.to_string(), Arc::clone(&provider));
        Ok(provider)
    }

    /// Bounds `request` by the timeout. A JSON-RPC error object in the reply
    /// becomes `ReadError::Rpc`; everything else is a transport failure.
    async fn timed<T, E, F>(&self, endpoint: &str, method: &str, request: F) -> ReadResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: RpcError,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => match e.as_error_response() {
                Some(response) => Err(ReadError::rpc(endpoint, response.code, response.message.clone())),
                None => Err(ReadError::transport(endpoint, format!("{}: {}", method, e))),
            },
            Err(_) => {
                debug!("⏱️ {} timed out on {}", method, endpoint);
                Err(ReadError::transport(
                    endpoint,
                    format!("{} timed out after {:?}", method, self.request_timeout),
                ))
            }
        }
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn call(&self, endpoint: &str, to: Address, data: Bytes) -> ReadResult<Bytes> {
        let provider = self.provider(endpoint)?;
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.timed(endpoint, "eth_call", provider.call(&tx, None))
            .await
    }

    async fn get_balance(&self, endpoint: &str, account: Address) -> ReadResult<U256> {
        let provider = self.provider(endpoint)?;
        self.timed(endpoint, "eth_getBalance", provider.get_balance(account, None))
            .await
    }

    async fn block_number(&self, endpoint: &str) -> ReadResult<u64> {
        let provider = self.provider(endpoint)?;
        self.timed(endpoint, "eth_blockNumber", provider.get_block_number())
            .await
            .map(|block| block.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_rejected_before_any_request() {
        let transport = HttpTransport::new(Duration::from_secs(1));
        let err = transport.block_number("not a url").await.unwrap_err();
        assert!(matches!(err, ReadError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_providers_are_reused_per_endpoint() {
        let transport = HttpTransport::new(Duration::from_secs(1));
        let a = transport.provider("http://127.0.0.1:8545").unwrap();
        let b = transport.provider("http://127.0.0.1:8545").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    #[ignore] // Requiere RPC publico
    async fn test_live_block_number() {
        let transport = HttpTransport::new(Duration::from_secs(10));
        let block = transport
            .block_number("https://ethereum-rpc.publicnode.com")
            .await
            .unwrap();
        assert!(block > 0);
    }
}
