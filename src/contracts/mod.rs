// Contracts Module - read-only ABIs used by the batcher

pub mod erc20;
pub mod multicall3;

pub use erc20::{
    BalanceOfCall, BalanceOfReturn, DecimalsCall, DecimalsReturn, Erc20, SymbolCall, SymbolReturn,
};
pub use multicall3::{AggregateCall, AggregateReturn, Multicall3};
