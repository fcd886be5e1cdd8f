use ethers::prelude::abigen;

// Solo lectura: lo que necesita el batcher
abigen!(
    Erc20,
    r#"[
        function symbol() external view returns (string)
        function decimals() external view returns (uint8)
        function balanceOf(address account) external view returns (uint256)
    ]"#
);
