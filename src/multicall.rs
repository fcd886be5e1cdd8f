use ethers::abi::{AbiDecode, AbiEncode};
use ethers::types::{Address, Bytes, U256};
use indexmap::IndexSet;
use log::debug;
use std::sync::Arc;

use crate::contracts::multicall3;
use crate::contracts::{AggregateCall, AggregateReturn};
use crate::errors::{ReadError, ReadResult};
use crate::metrics;
use crate::rpc_pool::RpcLoadBalancer;

/// A single contract read to be batched in a multicall.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Call {
    /// Target contract address
    pub target: Address,
    /// Encoded function call data
    pub call_data: Bytes,
}

/// Calldata for `aggregate((address,bytes)[])`.
pub fn encode_aggregate(calls: &[Call]) -> Bytes {
    AggregateCall {
        calls: calls
            .iter()
            .map(|call| multicall3::Call {
                target: call.target,
                call_data: call.call_data.clone(),
            })
            .collect(),
    }
    .encode()
    .into()
}

/// Inverse of [`encode_aggregate`]. Node-side tooling and test doubles use it.
pub fn decode_aggregate_calls(data: &[u8]) -> Result<Vec<Call>, ethers::abi::AbiError> {
    let decoded = AggregateCall::decode(data)?;
    Ok(decoded
        .calls
        .into_iter()
        .map(|multicall3::Call { target, call_data }| Call { target, call_data })
        .collect())
}

/// Return data of `aggregate`: `(uint256 blockNumber, bytes[] returnData)`.
pub fn encode_aggregate_result(block_number: U256, return_data: Vec<Bytes>) -> Bytes {
    AggregateReturn {
        block_number,
        return_data,
    }
    .encode()
    .into()
}

pub fn decode_aggregate_result(data: &[u8]) -> Result<AggregateReturn, ethers::abi::AbiError> {
    AggregateReturn::decode(data)
}

/// Multicall executor: one `eth_call` to the chain's aggregate contract,
/// routed through the load balancer.
///
/// Identical calls inside one batch are coalesced before sending and the
/// result set is rebuilt in the original order.
#[derive(Clone)]
pub struct Multicall {
    balancer: Arc<RpcLoadBalancer>,
}

impl Multicall {
    pub fn new(balancer: Arc<RpcLoadBalancer>) -> Self {
        Self { balancer }
    }

    pub fn balancer(&self) -> &Arc<RpcLoadBalancer> {
        &self.balancer
    }

    /// Returns one return-data blob per input call, in input order. A short
    /// response leaves the tail out; callers treat those as per-call failures.
    pub async fn aggregate(&self, chain_id: u64, calls: &[Call]) -> ReadResult<Vec<Bytes>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let multicall_address = self.balancer.registry().get(chain_id)?.multicall_address()?;

        // Coalesce identical calls to reduce payload
        let mut unique = IndexSet::with_capacity(calls.len());
        let positions: Vec<usize> = calls
            .iter()
            .map(|call| unique.insert_full(call.clone()).0)
            .collect();
        let unique: Vec<Call> = unique.into_iter().collect();
        if unique.len() < calls.len() {
            debug!(
                "Multicall coalesced {} calls into {}",
                calls.len(),
                unique.len()
            );
        }

        metrics::record_multicall_batch_size(unique.len());
        let calldata = encode_aggregate(&unique);
        let response = self
            .balancer
            .call(chain_id, multicall_address, calldata)
            .await?;

        let decoded = decode_aggregate_result(&response)
            .map_err(|e| ReadError::decode(multicall_address, "aggregate", e))?;
        debug!(
            "📦 Multicall on chain {} answered {} calls at block {}",
            chain_id,
            decoded.return_data.len(),
            decoded.block_number
        );

        let mut results = Vec::with_capacity(calls.len());
        for position in positions {
            match decoded.return_data.get(position) {
                Some(data) => results.push(data.clone()),
                None => break,
            }
        }
        Ok(results)
    }
}
