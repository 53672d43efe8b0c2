// src/chain.rs
//! Contract bindings and the on-chain seams used by the relay paths and the
//! price oracle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::prelude::*;
use tracing::{debug, info};

use crate::authorization::{SignatureParts, TransferAuthorization};
use crate::error::FacilitatorError;
use crate::oracle::{FeedRound, RateFeed};
use crate::tokens::TokenConfig;

abigen!(
    Erc3009Token,
    r#"[
        function transferWithAuthorization(address from, address to, uint256 value, uint256 validAfter, uint256 validBefore, bytes32 nonce, uint8 v, bytes32 r, bytes32 s) external
        function authorizationState(address authorizer, bytes32 nonce) external view returns (bool)
    ]"#
);

abigen!(
    EntryPoint,
    r#"[
        function getNonce(address sender, uint192 key) external view returns (uint256)
    ]"#
);

abigen!(
    AggregatorV3,
    r#"[
        function latestRoundData() external view returns (uint80 roundId, int256 answer, uint256 startedAt, uint256 updatedAt, uint80 answeredInRound)
        function decimals() external view returns (uint8)
    ]"#
);

abigen!(
    SmartWallet,
    r#"[
        function execute(address target, uint256 value, bytes data) external payable
    ]"#
);

abigen!(
    Erc20,
    r#"[
        function transfer(address to, uint256 amount) external returns (bool)
    ]"#
);

/// Interval between receipt lookups while waiting for a relayed transaction.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinedTransaction {
    pub block_number: U64,
    pub succeeded: bool,
}

/// ERC-3009 token contract operations on one chain.
#[async_trait]
pub trait AuthorizationChain: Send + Sync {
    /// Whether `nonce` has already been consumed for `authorizer`.
    async fn authorization_state(
        &self,
        authorizer: Address,
        nonce: H256,
    ) -> Result<bool, FacilitatorError>;

    /// Submit `transferWithAuthorization`, paid for by the facilitator.
    async fn transfer_with_authorization(
        &self,
        authorization: &TransferAuthorization,
        signature: &SignatureParts,
    ) -> Result<H256, FacilitatorError>;

    /// Wait for `tx_hash` to be mined. `Ok(None)` when `timeout` elapses first.
    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        timeout: Duration,
    ) -> Result<Option<MinedTransaction>, FacilitatorError>;
}

fn provider_error(e: impl std::fmt::Display) -> FacilitatorError {
    FacilitatorError::UpstreamUnavailable(e.to_string())
}

type FacilitatorClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Token contract reached over HTTP, with transactions signed by the
/// facilitator wallet.
pub struct EthersTokenChain {
    client: Arc<FacilitatorClient>,
    contract: Erc3009Token<FacilitatorClient>,
}

impl EthersTokenChain {
    pub fn new(token: &TokenConfig, wallet: LocalWallet) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(token.rpc_url)?;
        let wallet = wallet.with_chain_id(token.chain_id);
        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let contract = Erc3009Token::new(token.contract_address, client.clone());

        debug!(token = %token.symbol, chain_id = token.chain_id, "Connected token chain");

        Ok(Self { client, contract })
    }
}

#[async_trait]
impl AuthorizationChain for EthersTokenChain {
    async fn authorization_state(
        &self,
        authorizer: Address,
        nonce: H256,
    ) -> Result<bool, FacilitatorError> {
        self.contract
            .authorization_state(authorizer, nonce.to_fixed_bytes())
            .call()
            .await
            .map_err(provider_error)
    }

    async fn transfer_with_authorization(
        &self,
        authorization: &TransferAuthorization,
        signature: &SignatureParts,
    ) -> Result<H256, FacilitatorError> {
        let call = self.contract.transfer_with_authorization(
            authorization.from,
            authorization.to,
            authorization.value,
            authorization.valid_after,
            authorization.valid_before,
            authorization.nonce.to_fixed_bytes(),
            signature.v,
            signature.r.to_fixed_bytes(),
            signature.s.to_fixed_bytes(),
        );

        let pending = call.send().await.map_err(provider_error)?;
        let tx_hash = *pending;
        info!(tx_hash = ?tx_hash, "Transaction submitted");

        Ok(tx_hash)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        timeout: Duration,
    ) -> Result<Option<MinedTransaction>, FacilitatorError> {
        let pending = PendingTransaction::new(tx_hash, self.client.provider())
            .interval(RECEIPT_POLL_INTERVAL);

        let receipt = match tokio::time::timeout(timeout, pending).await {
            Ok(result) => result.map_err(provider_error)?,
            Err(_) => return Ok(None),
        };

        // A dropped transaction never yields a receipt; treat as unconfirmed
        Ok(receipt.map(|receipt| MinedTransaction {
            block_number: receipt.block_number.unwrap_or_default(),
            succeeded: receipt.status == Some(U64::one()),
        }))
    }
}

/// Reads the account-abstraction entry point.
#[async_trait]
pub trait EntryPointReader: Send + Sync {
    /// Next nonce for `sender` under key 0.
    async fn nonce(&self, entry_point: Address, sender: Address) -> Result<U256, FacilitatorError>;
}

pub struct EthersEntryPoint {
    provider: Arc<Provider<Http>>,
}

impl EthersEntryPoint {
    pub fn new(rpc_url: &str) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)?;
        Ok(Self {
            provider: Arc::new(provider),
        })
    }
}

#[async_trait]
impl EntryPointReader for EthersEntryPoint {
    async fn nonce(&self, entry_point: Address, sender: Address) -> Result<U256, FacilitatorError> {
        EntryPoint::new(entry_point, self.provider.clone())
            .get_nonce(sender, U256::zero())
            .call()
            .await
            .map_err(provider_error)
    }
}

/// Chainlink aggregator behind a transport with a bounded request timeout.
pub struct EthersRateFeed {
    feed: AggregatorV3<Provider<Http>>,
}

impl EthersRateFeed {
    pub fn new(rpc_url: &str, feed_address: Address, timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        let transport = Http::new_with_client(reqwest::Url::parse(rpc_url)?, http_client);
        let provider = Arc::new(Provider::new(transport));

        Ok(Self {
            feed: AggregatorV3::new(feed_address, provider),
        })
    }
}

#[async_trait]
impl RateFeed for EthersRateFeed {
    async fn latest(&self) -> Result<FeedRound, FacilitatorError> {
        let round_call = self.feed.latest_round_data();
        let decimals_call = self.feed.decimals();

        let ((_, answer, _, updated_at, _), decimals) =
            tokio::try_join!(round_call.call(), decimals_call.call()).map_err(provider_error)?;

        if !answer.is_positive() {
            return Err(FacilitatorError::UpstreamUnavailable(format!(
                "non-positive oracle answer {}",
                answer
            )));
        }

        Ok(FeedRound {
            answer: answer.into_raw(),
            decimals,
            updated_at: updated_at.low_u64(),
        })
    }
}
