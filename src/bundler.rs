// src/bundler.rs
use std::time::Duration;

use ethers::types::{Address, H256};
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::proc_macros::rpc;
use serde_json::Value;
use tracing::debug;

use crate::error::FacilitatorError;
use crate::types::{GasEstimate, GasPriceTiers, Sponsorship, UserOperationReceipt};
use crate::user_op::UserOperation;

const BUNDLER_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Bundler and paymaster JSON-RPC surface
#[rpc(client)]
pub trait BundlerRpc {
    #[method(name = "eth_sendUserOperation")]
    async fn send_user_operation(&self, user_op: Value, entry_point: Address) -> RpcResult<H256>;

    #[method(name = "eth_getUserOperationReceipt")]
    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> RpcResult<Option<UserOperationReceipt>>;

    #[method(name = "eth_estimateUserOperationGas")]
    async fn estimate_user_operation_gas(
        &self,
        user_op: Value,
        entry_point: Address,
    ) -> RpcResult<GasEstimate>;

    #[method(name = "pimlico_getUserOperationGasPrice")]
    async fn get_user_operation_gas_price(&self) -> RpcResult<GasPriceTiers>;

    #[method(name = "pm_sponsorUserOperation")]
    async fn sponsor_user_operation(
        &self,
        user_op: Value,
        entry_point: Address,
    ) -> RpcResult<Sponsorship>;
}

/// What the facilitator needs from a bundler. Every call targets the entry
/// point of the operation's own version.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn send(&self, operation: &UserOperation) -> Result<H256, FacilitatorError>;

    /// `Ok(None)` while the operation is not yet included.
    async fn receipt(&self, user_op_hash: H256)
        -> Result<Option<UserOperationReceipt>, FacilitatorError>;

    async fn estimate_gas(&self, operation: &UserOperation) -> Result<GasEstimate, FacilitatorError>;

    async fn gas_price(&self) -> Result<GasPriceTiers, FacilitatorError>;

    async fn sponsor(&self, operation: &UserOperation) -> Result<Sponsorship, FacilitatorError>;
}

/// JSON-RPC error objects are the bundler refusing the request; anything
/// else is transport trouble.
fn bundler_error(e: jsonrpsee::core::Error) -> FacilitatorError {
    match e {
        jsonrpsee::core::Error::Call(object) => {
            FacilitatorError::BundlerRejected(object.message().to_string())
        }
        other => FacilitatorError::UpstreamUnavailable(other.to_string()),
    }
}

pub struct BundlerClient {
    client: HttpClient,
}

impl BundlerClient {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(BUNDLER_REQUEST_TIMEOUT)
            .build(url)?;
        Ok(Self { client })
    }

    /// Pimlico's hosted endpoint for Base Sepolia.
    pub fn pimlico_url(api_key: &str) -> String {
        format!("https://api.pimlico.io/v2/base-sepolia/rpc?apikey={}", api_key)
    }
}

#[async_trait]
impl Bundler for BundlerClient {
    async fn send(&self, operation: &UserOperation) -> Result<H256, FacilitatorError> {
        let entry_point = operation.entry_point();
        debug!(
            sender = ?operation.sender(),
            version = operation.version(),
            entry_point = ?entry_point,
            "Sending user operation"
        );
        self.client
            .send_user_operation(operation.to_wire(), entry_point)
            .await
            .map_err(bundler_error)
    }

    async fn receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<UserOperationReceipt>, FacilitatorError> {
        self.client
            .get_user_operation_receipt(user_op_hash)
            .await
            .map_err(bundler_error)
    }

    async fn estimate_gas(&self, operation: &UserOperation) -> Result<GasEstimate, FacilitatorError> {
        self.client
            .estimate_user_operation_gas(operation.to_wire(), operation.entry_point())
            .await
            .map_err(bundler_error)
    }

    async fn gas_price(&self) -> Result<GasPriceTiers, FacilitatorError> {
        self.client
            .get_user_operation_gas_price()
            .await
            .map_err(bundler_error)
    }

    async fn sponsor(&self, operation: &UserOperation) -> Result<Sponsorship, FacilitatorError> {
        self.client
            .sponsor_user_operation(operation.to_wire(), operation.entry_point())
            .await
            .map_err(bundler_error)
    }
}
