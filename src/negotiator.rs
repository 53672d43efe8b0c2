// src/negotiator.rs
use std::collections::BTreeMap;
use std::sync::Arc;

use ethers::types::{Address, U256};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::FacilitatorError;
use crate::oracle::PriceOracleCache;
use crate::tokens::{Pricing, TokenSymbol};

/// Price of one play in US dollars.
pub const PLAY_PRICE_USD: f64 = 0.50;
pub const PLAY_DESCRIPTION: &str = "Fortune Cookie Gacha - 1 Play";
pub const PAYMENT_INFO_VERSION: &str = "1";

/// Oracle-priced payments may undershoot the fresh quote by this many percent.
const ORACLE_TOLERANCE_PERCENT: u64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequirement {
    pub token: TokenSymbol,
    pub chain_id: u64,
    pub contract_address: Address,
    pub decimals: u8,
    pub required_amount: U256,
    pub display_amount: String,
    /// JPY per USD, for oracle-priced tokens.
    pub exchange_rate: Option<f64>,
    pub recipient: Address,
    pub description: &'static str,
}

/// One entry of `paymentInfo.prices`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub amount: String,
    pub decimals: u8,
    pub chain_id: u64,
    pub address: Address,
    pub display_amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_rate: Option<String>,
}

/// Body of the `402 Payment Required` answer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInfo {
    pub version: &'static str,
    pub prices: BTreeMap<TokenSymbol, PriceQuote>,
    pub recipient: Address,
    pub description: &'static str,
}

impl From<&[PaymentRequirement]> for PaymentInfo {
    fn from(requirements: &[PaymentRequirement]) -> Self {
        let recipient = requirements
            .first()
            .map(|r| r.recipient)
            .unwrap_or_default();
        let prices = requirements
            .iter()
            .map(|r| {
                let quote = PriceQuote {
                    amount: r.required_amount.to_string(),
                    decimals: r.decimals,
                    chain_id: r.chain_id,
                    address: r.contract_address,
                    display_amount: r.display_amount.clone(),
                    exchange_rate: r.exchange_rate.map(|rate| format!("{:.2}", rate)),
                };
                (r.token, quote)
            })
            .collect();

        PaymentInfo {
            version: PAYMENT_INFO_VERSION,
            prices,
            recipient,
            description: PLAY_DESCRIPTION,
        }
    }
}

/// `floor(usd × rate × 10^decimals)` in the token's smallest unit.
pub fn token_amount(usd: f64, rate: f64, decimals: u8) -> U256 {
    let units = (usd * rate * 10f64.powi(i32::from(decimals))).floor();
    // Saturating float-to-int cast; negative and NaN become zero
    U256::from(units as u128)
}

/// Prices a play in every supported token and checks incoming payments.
pub struct PaymentNegotiator {
    oracle: Arc<PriceOracleCache>,
    recipient: Address,
    price_usd: f64,
}

impl PaymentNegotiator {
    pub fn new(oracle: Arc<PriceOracleCache>, recipient: Address) -> Self {
        Self {
            oracle,
            recipient,
            price_usd: PLAY_PRICE_USD,
        }
    }

    pub fn recipient(&self) -> Address {
        self.recipient
    }

    async fn rate_for(&self, token: TokenSymbol) -> Option<f64> {
        match token.config().pricing {
            Pricing::UsdPegged => None,
            Pricing::JpyOracle => {
                let snapshot = self.oracle.rate().await;
                if snapshot.stale {
                    warn!(jpy_per_usd = snapshot.rate, "Pricing with stale exchange rate");
                }
                Some(snapshot.rate)
            }
        }
    }

    pub async fn requirement(&self, token: TokenSymbol) -> PaymentRequirement {
        let config = token.config();
        let exchange_rate = self.rate_for(token).await;
        let rate = exchange_rate.unwrap_or(1.0);

        PaymentRequirement {
            token,
            chain_id: config.chain_id,
            contract_address: config.contract_address,
            decimals: config.decimals,
            required_amount: token_amount(self.price_usd, rate, config.decimals),
            display_amount: format!("{:.2}", self.price_usd * rate),
            exchange_rate,
            recipient: self.recipient,
            description: PLAY_DESCRIPTION,
        }
    }

    /// One fresh requirement per supported token.
    pub async fn requirements(&self) -> Vec<PaymentRequirement> {
        let mut requirements = Vec::with_capacity(TokenSymbol::ALL.len());
        for token in TokenSymbol::ALL {
            requirements.push(self.requirement(token).await);
        }
        requirements
    }

    pub async fn payment_info(&self) -> PaymentInfo {
        PaymentInfo::from(self.requirements().await.as_slice())
    }

    /// Smallest acceptable amount: exact for pegged tokens, 99 % of the
    /// recomputed quote for oracle-priced ones.
    pub async fn minimum_amount(&self, token: TokenSymbol) -> U256 {
        let requirement = self.requirement(token).await;
        match token.config().pricing {
            Pricing::UsdPegged => requirement.required_amount,
            Pricing::JpyOracle => {
                requirement.required_amount * U256::from(100 - ORACLE_TOLERANCE_PERCENT)
                    / U256::from(100)
            }
        }
    }

    /// Check that a payment goes to the configured recipient and covers the
    /// price.
    pub async fn validate(
        &self,
        token: TokenSymbol,
        to: Address,
        value: U256,
    ) -> Result<(), FacilitatorError> {
        if to != self.recipient {
            return Err(FacilitatorError::WrongRecipient);
        }

        let minimum = self.minimum_amount(token).await;
        if value < minimum {
            return Err(FacilitatorError::InsufficientPayment {
                minimum,
                actual: value,
            });
        }

        debug!(token = %token, value = %value, minimum = %minimum, "Payment amount accepted");
        Ok(())
    }
}
