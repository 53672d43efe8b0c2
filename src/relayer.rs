// src/relayer.rs
//! ERC-3009 relay: the facilitator wallet submits `transferWithAuthorization`
//! on the payer's behalf and pays the gas.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ethers::prelude::*;
use serde::Deserialize;
use tracing::{info, warn};

use crate::authorization::{decode_signature_hex, SignatureParts, TransferAuthorization};
use crate::chain::{AuthorizationChain, EthersTokenChain};
use crate::error::FacilitatorError;
use crate::nonce_guard;
use crate::tokens::TokenSymbol;
use crate::types::{RelayReceipt, TxStatus};
use crate::user_op::opt_quantity;

/// How long a submitted transfer may take to be mined.
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Relay request body. Everything is optional here so that missing fields
/// surface as `BadRequest` rather than a body-parsing error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    #[serde(default)]
    pub from: Option<Address>,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default, deserialize_with = "opt_quantity")]
    pub value: Option<U256>,
    #[serde(default, deserialize_with = "opt_quantity")]
    pub valid_after: Option<U256>,
    #[serde(default, deserialize_with = "opt_quantity")]
    pub valid_before: Option<U256>,
    #[serde(default)]
    pub nonce: Option<H256>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// A relay request with every required field present.
#[derive(Debug, Clone)]
pub struct SignedAuthorization {
    pub authorization: TransferAuthorization,
    pub signature: String,
    pub token: Option<String>,
}

impl RelayRequest {
    pub fn require_fields(self) -> Result<SignedAuthorization, FacilitatorError> {
        match self {
            RelayRequest {
                from: Some(from),
                to: Some(to),
                value: Some(value),
                valid_after,
                valid_before: Some(valid_before),
                nonce: Some(nonce),
                signature: Some(signature),
                token,
            } if !signature.is_empty() => Ok(SignedAuthorization {
                authorization: TransferAuthorization {
                    from,
                    to,
                    value,
                    valid_after: valid_after.unwrap_or_default(),
                    valid_before,
                    nonce,
                },
                signature,
                token,
            }),
            _ => Err(FacilitatorError::BadRequest(
                "Missing required fields: from, to, value, validBefore, nonce, signature"
                    .to_string(),
            )),
        }
    }
}

fn truncated(value: H256) -> String {
    let hex = format!("{:?}", value);
    format!("{}...", &hex[..10])
}

pub struct MetaTxRelayer {
    address: Option<Address>,
    chains: HashMap<TokenSymbol, Arc<dyn AuthorizationChain>>,
    confirmation_timeout: Duration,
}

impl MetaTxRelayer {
    /// Facilitator wallet from a hex private key, with one client per
    /// supported token chain.
    pub fn connect(private_key: &str) -> anyhow::Result<Self> {
        let wallet = private_key.parse::<LocalWallet>()?;
        let address = wallet.address();

        let mut chains: HashMap<TokenSymbol, Arc<dyn AuthorizationChain>> = HashMap::new();
        for token in TokenSymbol::ALL {
            let chain = EthersTokenChain::new(token.config(), wallet.clone())?;
            chains.insert(token, Arc::new(chain));
        }

        info!("Initialized facilitator relayer with address: {:?}", address);

        Ok(Self::with_chains(address, chains))
    }

    pub fn with_chains(
        address: Address,
        chains: HashMap<TokenSymbol, Arc<dyn AuthorizationChain>>,
    ) -> Self {
        Self {
            address: Some(address),
            chains,
            confirmation_timeout: CONFIRMATION_TIMEOUT,
        }
    }

    /// Relayer without a credential: every relay fails with `NotConfigured`.
    pub fn unconfigured() -> Self {
        Self {
            address: None,
            chains: HashMap::new(),
            confirmation_timeout: CONFIRMATION_TIMEOUT,
        }
    }

    pub fn address(&self) -> Option<Address> {
        self.address
    }

    pub fn is_configured(&self) -> bool {
        self.address.is_some()
    }

    pub fn ensure_configured(&self) -> Result<(), FacilitatorError> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(FacilitatorError::NotConfigured(
                "Set FACILITATOR_PRIVATE_KEY to enable relaying".to_string(),
            ))
        }
    }

    /// Full relay of a request body; the token defaults to USDC.
    pub async fn relay_request(&self, request: RelayRequest) -> Result<RelayReceipt, FacilitatorError> {
        // 1. Credential and required fields
        self.ensure_configured()?;
        let signed = request.require_fields()?;

        // 2. Token
        let token = match signed.token.as_deref() {
            Some(symbol) => symbol.parse::<TokenSymbol>()?,
            None => TokenSymbol::Usdc,
        };

        self.relay(token, &signed).await
    }

    /// Decode the signature, check the nonce, then submit and wait.
    pub async fn relay(
        &self,
        token: TokenSymbol,
        signed: &SignedAuthorization,
    ) -> Result<RelayReceipt, FacilitatorError> {
        self.ensure_configured()?;
        let chain = self.chains.get(&token).ok_or_else(|| {
            FacilitatorError::NotConfigured(format!("no chain client for {}", token))
        })?;

        let signature = decode_signature_hex(&signed.signature)?;
        let authorization = &signed.authorization;

        nonce_guard::check(chain.as_ref(), token, authorization.from, authorization.nonce).await?;

        self.submit(chain.as_ref(), token, authorization, &signature)
            .await
    }

    async fn submit(
        &self,
        chain: &dyn AuthorizationChain,
        token: TokenSymbol,
        authorization: &TransferAuthorization,
        signature: &SignatureParts,
    ) -> Result<RelayReceipt, FacilitatorError> {
        info!(
            token = %token,
            chain_id = token.config().chain_id,
            from = ?authorization.from,
            to = ?authorization.to,
            value = %authorization.value,
            valid_after = %authorization.valid_after,
            valid_before = %authorization.valid_before,
            v = signature.v,
            r = %truncated(signature.r),
            s = %truncated(signature.s),
            "Executing transferWithAuthorization"
        );

        let tx_hash = chain
            .transfer_with_authorization(authorization, signature)
            .await?;

        // Sent and paid for from here on; an unknown outcome is pending, not failed
        let mined = match chain
            .wait_for_receipt(tx_hash, self.confirmation_timeout)
            .await
        {
            Ok(Some(mined)) => mined,
            Ok(None) => {
                warn!(tx_hash = ?tx_hash, "Transfer not mined within {:?}", self.confirmation_timeout);
                return Err(FacilitatorError::ConfirmationTimeout(tx_hash));
            }
            Err(e) => {
                warn!(tx_hash = ?tx_hash, error = %e, "Receipt lookup failed after submission");
                return Err(FacilitatorError::ConfirmationTimeout(tx_hash));
            }
        };

        let status = if mined.succeeded {
            TxStatus::Confirmed
        } else {
            TxStatus::Failed
        };
        info!(tx_hash = ?tx_hash, block = %mined.block_number, status = ?status, "Transfer mined");

        Ok(RelayReceipt {
            transaction_hash: tx_hash,
            block_number: mined.block_number,
            status,
        })
    }
}
