// src/types.rs
use ethers::types::{Address, Bytes, H256, U256, U64};
use serde::{Deserialize, Serialize};

/// Settlement state reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Confirmed,
    Failed,
    Pending,
}

/// `eth_getUserOperationReceipt` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationReceipt {
    #[serde(default)]
    pub user_op_hash: Option<H256>,
    pub success: bool,
    #[serde(default)]
    pub receipt: Option<ReceiptSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptSummary {
    pub transaction_hash: H256,
    #[serde(default)]
    pub block_number: Option<U64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasPrice {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// `pimlico_getUserOperationGasPrice` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasPriceTiers {
    pub slow: GasPrice,
    pub standard: GasPrice,
    pub fast: GasPrice,
}

/// `eth_estimateUserOperationGas` result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
    #[serde(default)]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default)]
    pub paymaster_post_op_gas_limit: Option<U256>,
}

/// `pm_sponsorUserOperation` result. v0.6 paymasters fill `paymaster_and_data`,
/// v0.7 paymasters fill the split `paymaster*` fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sponsorship {
    #[serde(default)]
    pub paymaster_and_data: Option<Bytes>,
    #[serde(default)]
    pub paymaster: Option<Address>,
    #[serde(default)]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default)]
    pub paymaster_post_op_gas_limit: Option<U256>,
    #[serde(default)]
    pub paymaster_data: Option<Bytes>,
    #[serde(default)]
    pub call_gas_limit: Option<U256>,
    #[serde(default)]
    pub verification_gas_limit: Option<U256>,
    #[serde(default)]
    pub pre_verification_gas: Option<U256>,
}

/// Result of relaying an ERC-3009 authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayReceipt {
    pub transaction_hash: H256,
    pub block_number: U64,
    pub status: TxStatus,
}

/// Result of submitting a signed user operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionReport {
    pub success: bool,
    pub user_op_hash: H256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<U64>,
    pub status: TxStatus,
}
