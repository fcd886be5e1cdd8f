//! Per-chain batching of contract reads into aggregate multicalls.
//!
//! Every chain has one FIFO queue. A call waits at most `batch_delay` (the
//! timer `batch:{chain}` is armed by the first call of a quiet queue), or
//! less if the queue reaches `max_batch_size`. Execution slices up to
//! `max_batch_size` calls into one multicall and keeps slicing until the
//! queue is empty.
//!
//! Each queued call carries its own decoder, so a bad return blob fails only
//! that call. A failed aggregate request fails every call of its slice.

use ethers::abi::{AbiDecode, AbiEncode, Function, Token};
use ethers::contract::EthCall;
use ethers::types::{Address, Bytes, U256};
use futures::future::join_all;
use indexmap::IndexSet;
use log::{debug, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use dashmap::DashMap;

use crate::contracts::{BalanceOfCall, BalanceOfReturn, DecimalsCall, DecimalsReturn, SymbolCall, SymbolReturn};
use crate::errors::{ReadError, ReadResult};
use crate::metrics;
use crate::multicall::{Call, Multicall};
use crate::scheduler::TaskScheduler;
use crate::settings::Batching;
use crate::utils::lock;

type Responder = Box<dyn FnOnce(ReadResult<Bytes>) + Send>;

struct QueuedCall {
    call: Call,
    responder: Responder,
}

#[derive(Default)]
struct ChainQueue {
    calls: VecDeque<QueuedCall>,
    timer_armed: bool,
    flush_requested: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchQueueStats {
    pub chain_id: u64,
    pub queued: usize,
    pub timer_armed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatcherStats {
    pub queues: Vec<BatchQueueStats>,
    pub total_batches: u64,
    pub total_calls: u64,
    pub max_batch_size: usize,
    pub batch_delay_ms: u64,
}

/// `symbol()`/`decimals()` of one token; `None` where the call did not decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfoResult {
    pub address: Address,
    pub symbol: Option<String>,
    pub decimals: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceResult {
    pub token_address: Address,
    pub balance: U256,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenDataResult {
    pub address: Address,
    pub symbol: Option<String>,
    pub decimals: Option<u8>,
    pub balance: Option<U256>,
}

struct BatcherInner {
    multicall: Multicall,
    scheduler: Arc<TaskScheduler>,
    settings: Batching,
    queues: DashMap<u64, Arc<Mutex<ChainQueue>>>,
    total_batches: AtomicU64,
    total_calls: AtomicU64,
}

#[derive(Clone)]
pub struct CallBatcher {
    inner: Arc<BatcherInner>,
}

fn timer_name(chain_id: u64) -> String {
    format!("batch:{}", chain_id)
}

/// Decode failures are per call; anything else failed the whole slice.
fn keep_decode_failure<T>(outcome: ReadResult<T>) -> ReadResult<Option<T>> {
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_decode() => {
            debug!("Skipping undecodable field: {}", e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

impl CallBatcher {
    pub fn new(multicall: Multicall, scheduler: Arc<TaskScheduler>, settings: Batching) -> Self {
        let mut settings = settings;
        settings.max_batch_size = settings.max_batch_size.max(1);
        Self {
            inner: Arc::new(BatcherInner {
                multicall,
                scheduler,
                settings,
                queues: DashMap::new(),
                total_batches: AtomicU64::new(0),
                total_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Queues a typed contract read and waits for its decoded return value.
    pub async fn batched_call<C, R>(&self, chain_id: u64, target: Address, call: C) -> ReadResult<R>
    where
        C: EthCall + AbiEncode,
        R: AbiDecode + Send + 'static,
    {
        let function = C::function_name().into_owned();
        self.submit(chain_id, target, call.encode().into(), function, |data| {
            R::decode(data)
        })
        .await
    }

    /// Queues a read described by a plain ABI `Function`.
    pub async fn batched_read(
        &self,
        chain_id: u64,
        target: Address,
        function: &Function,
        args: &[Token],
    ) -> ReadResult<Vec<Token>> {
        let call_data = function.encode_input(args).map_err(|e| ReadError::Encode {
            function: function.name.clone(),
            message: e.to_string(),
        })?;
        let decoder = function.clone();
        self.submit(chain_id, target, call_data.into(), function.name.clone(), move |data| {
            decoder.decode_output(data)
        })
        .await
    }

    async fn submit<T, E, D>(
        &self,
        chain_id: u64,
        target: Address,
        call_data: Bytes,
        function: String,
        decode: D,
    ) -> ReadResult<T>
    where
        T: Send + 'static,
        E: Display,
        D: FnOnce(&[u8]) -> Result<T, E> + Send + 'static,
    {
        // cadena desconocida: error inmediato, sin reintentos
        self.inner.multicall.balancer().registry().get(chain_id)?;

        let (tx, rx) = oneshot::channel();
        let responder: Responder = Box::new(move |outcome: ReadResult<Bytes>| {
            let decoded = outcome.and_then(|data| {
                decode(&data).map_err(|e| {
                    metrics::increment_multicall_decode_failure(&function);
                    ReadError::decode(target, function.as_str(), e)
                })
            });
            let _ = tx.send(decoded);
        });

        self.enqueue(
            chain_id,
            QueuedCall {
                call: Call { target, call_data },
                responder,
            },
        );

        rx.await
            .unwrap_or_else(|_| Err(ReadError::Cancelled("batched call was dropped".to_string())))
    }

    fn queue(&self, chain_id: u64) -> Arc<Mutex<ChainQueue>> {
        self.inner
            .queues
            .entry(chain_id)
            .or_default()
            .value()
            .clone()
    }

    fn enqueue(&self, chain_id: u64, item: QueuedCall) {
        let queue = self.queue(chain_id);
        let (flush_now, arm_timer) = {
            let mut queue = lock(&queue);
            queue.calls.push_back(item);
            if queue.calls.len() >= self.inner.settings.max_batch_size {
                let first_request = !queue.flush_requested;
                queue.flush_requested = true;
                (first_request, false)
            } else if !queue.timer_armed {
                queue.timer_armed = true;
                (false, true)
            } else {
                (false, false)
            }
        };

        if flush_now {
            let batcher = self.clone();
            tokio::spawn(async move { batcher.execute(chain_id).await });
        } else if arm_timer {
            let batcher = self.clone();
            self.inner.scheduler.schedule_once(
                timer_name(chain_id),
                self.inner.settings.batch_delay(),
                async move { batcher.execute(chain_id).await },
            );
        }
    }

    /// Drains the chain's queue, one slice per multicall.
    async fn execute(&self, chain_id: u64) {
        let queue = self.queue(chain_id);
        loop {
            let batch: Vec<QueuedCall> = {
                let mut queue = lock(&queue);
                if queue.timer_armed {
                    queue.timer_armed = false;
                    self.inner.scheduler.cancel(&timer_name(chain_id));
                }
                queue.flush_requested = false;
                let take = queue.calls.len().min(self.inner.settings.max_batch_size);
                queue.calls.drain(..take).collect()
            };
            if batch.is_empty() {
                return;
            }
            self.run_batch(chain_id, batch).await;
        }
    }

    async fn run_batch(&self, chain_id: u64, batch: Vec<QueuedCall>) {
        let calls: Vec<Call> = batch.iter().map(|queued| queued.call.clone()).collect();
        self.inner.total_batches.fetch_add(1, Ordering::Relaxed);
        self.inner
            .total_calls
            .fetch_add(calls.len() as u64, Ordering::Relaxed);
        debug!("📦 Executing batch of {} calls on chain {}", calls.len(), chain_id);

        match self.inner.multicall.aggregate(chain_id, &calls).await {
            Ok(results) => {
                let mut results = results.into_iter();
                for queued in batch {
                    let target = queued.call.target;
                    let outcome = results
                        .next()
                        .ok_or_else(|| ReadError::decode(target, "aggregate", "missing return data"));
                    (queued.responder)(outcome);
                }
            }
            Err(e) => {
                warn!("⚠️ Batch of {} calls on chain {} failed: {}", calls.len(), chain_id, e);
                for queued in batch {
                    (queued.responder)(Err(e.clone()));
                }
            }
        }
    }

    /// `symbol()` + `decimals()` for every distinct token in one pass.
    pub async fn batch_get_token_info(
        &self,
        chain_id: u64,
        tokens: &[Address],
    ) -> ReadResult<Vec<TokenInfoResult>> {
        let unique: IndexSet<Address> = tokens.iter().copied().collect();
        let reads = unique.iter().map(|&token| async move {
            let (symbol, decimals) = futures::join!(
                self.batched_call::<_, SymbolReturn>(chain_id, token, SymbolCall),
                self.batched_call::<_, DecimalsReturn>(chain_id, token, DecimalsCall),
            );
            Ok::<_, ReadError>(TokenInfoResult {
                address: token,
                symbol: keep_decode_failure(symbol)?.map(|r| r.0),
                decimals: keep_decode_failure(decimals)?.map(|r| r.0),
            })
        });
        join_all(reads).await.into_iter().collect()
    }

    /// `balanceOf(user)` for every distinct token. An undecodable balance is
    /// reported as zero with the decode error attached.
    pub async fn batch_get_balances(
        &self,
        chain_id: u64,
        tokens: &[Address],
        user: Address,
    ) -> ReadResult<Vec<BalanceResult>> {
        let unique: IndexSet<Address> = tokens.iter().copied().collect();
        let reads = unique.iter().map(|&token| async move {
            let outcome = self
                .batched_call::<_, BalanceOfReturn>(chain_id, token, BalanceOfCall { account: user })
                .await;
            match outcome {
                Ok(balance) => Ok(BalanceResult {
                    token_address: token,
                    balance: balance.0,
                    error: None,
                }),
                Err(e) if e.is_decode() => Ok(BalanceResult {
                    token_address: token,
                    balance: U256::zero(),
                    error: Some(e.to_string()),
                }),
                Err(e) => Err(e),
            }
        });
        join_all(reads).await.into_iter().collect()
    }

    /// Token info plus, when `user` is given, its balance, in one pass.
    pub async fn batch_get_token_data(
        &self,
        chain_id: u64,
        tokens: &[Address],
        user: Option<Address>,
    ) -> ReadResult<Vec<TokenDataResult>> {
        let unique: IndexSet<Address> = tokens.iter().copied().collect();
        let reads = unique.iter().map(|&token| async move {
            let balance = async {
                match user {
                    Some(account) => self
                        .batched_call::<_, BalanceOfReturn>(chain_id, token, BalanceOfCall { account })
                        .await
                        .map(Some),
                    None => Ok(None),
                }
            };
            let (symbol, decimals, balance) = futures::join!(
                self.batched_call::<_, SymbolReturn>(chain_id, token, SymbolCall),
                self.batched_call::<_, DecimalsReturn>(chain_id, token, DecimalsCall),
                balance,
            );
            Ok::<_, ReadError>(TokenDataResult {
                address: token,
                symbol: keep_decode_failure(symbol)?.map(|r| r.0),
                decimals: keep_decode_failure(decimals)?.map(|r| r.0),
                balance: keep_decode_failure(balance)?.flatten().map(|r| r.0),
            })
        });
        join_all(reads).await.into_iter().collect()
    }

    /// Executes every pending queue now.
    pub async fn flush_all(&self) {
        let chains: Vec<u64> = self
            .inner
            .queues
            .iter()
            .filter(|q| !lock(q.value()).calls.is_empty())
            .map(|q| *q.key())
            .collect();
        join_all(chains.into_iter().map(|chain_id| self.execute(chain_id))).await;
    }

    /// Rejects every queued call with `Cancelled` and disarms all timers.
    pub fn clear_all(&self) -> usize {
        self.inner.scheduler.cancel_prefix("batch:");
        let mut dropped = Vec::new();
        for queue in self.inner.queues.iter() {
            let mut queue = lock(queue.value());
            queue.timer_armed = false;
            queue.flush_requested = false;
            dropped.extend(queue.calls.drain(..));
        }
        let count = dropped.len();
        for queued in dropped {
            (queued.responder)(Err(ReadError::Cancelled("batch queue cleared".to_string())));
        }
        count
    }

    pub fn stats(&self) -> BatcherStats {
        let mut queues: Vec<BatchQueueStats> = self
            .inner
            .queues
            .iter()
            .map(|q| {
                let queue = lock(q.value());
                BatchQueueStats {
                    chain_id: *q.key(),
                    queued: queue.calls.len(),
                    timer_armed: queue.timer_armed,
                }
            })
            .collect();
        queues.sort_by_key(|q| q.chain_id);

        BatcherStats {
            queues,
            total_batches: self.inner.total_batches.load(Ordering::Relaxed),
            total_calls: self.inner.total_calls.load(Ordering::Relaxed),
            max_batch_size: self.inner.settings.max_batch_size,
            batch_delay_ms: self.inner.settings.batch_delay_ms,
        }
    }
}
