use ethers::prelude::abigen;

abigen!(
    Multicall3,
    r#"[
        struct Call { address target; bytes callData; }
        function aggregate(Call[] calls) external payable returns (uint256 blockNumber, bytes[] returnData)
    ]"#
);
