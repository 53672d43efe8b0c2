// src/tokens.rs
use std::fmt;
use std::str::FromStr;

use ethers::types::{Address, H160};
use serde::{Deserialize, Serialize};

use crate::error::FacilitatorError;

pub const BASE_SEPOLIA_CHAIN_ID: u64 = 84532;
pub const SEPOLIA_CHAIN_ID: u64 = 11155111;

// 0x036CbD53842c5426634e7929541eC2318f3dCF7e (Circle testnet USDC)
pub const USDC_ADDRESS: Address = H160([
    0x03, 0x6c, 0xbd, 0x53, 0x84, 0x2c, 0x54, 0x26, 0x63, 0x4e, 0x79, 0x29, 0x54, 0x1e, 0xc2,
    0x31, 0x8f, 0x3d, 0xcf, 0x7e,
]);

// 0x431D5dfF03120AFA4bDf332c61A6e1766eF37BDB
pub const JPYC_ADDRESS: Address = H160([
    0x43, 0x1d, 0x5d, 0xff, 0x03, 0x12, 0x0a, 0xfa, 0x4b, 0xdf, 0x33, 0x2c, 0x61, 0xa6, 0xe1,
    0x76, 0x6e, 0xf3, 0x7b, 0xdb,
]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenSymbol {
    Usdc,
    Jpyc,
}

/// How a token's amount is derived from a USD price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pricing {
    /// One token unit is one US dollar.
    UsdPegged,
    /// Converted through the JPY/USD oracle rate.
    JpyOracle,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub symbol: TokenSymbol,
    pub contract_address: Address,
    pub decimals: u8,
    pub chain_id: u64,
    pub rpc_url: &'static str,
    pub domain_name: &'static str,
    pub domain_version: &'static str,
    pub pricing: Pricing,
}

static USDC: TokenConfig = TokenConfig {
    symbol: TokenSymbol::Usdc,
    contract_address: USDC_ADDRESS,
    decimals: 6,
    chain_id: BASE_SEPOLIA_CHAIN_ID,
    rpc_url: "https://base-sepolia-rpc.publicnode.com",
    domain_name: "USDC",
    domain_version: "2",
    pricing: Pricing::UsdPegged,
};

static JPYC: TokenConfig = TokenConfig {
    symbol: TokenSymbol::Jpyc,
    contract_address: JPYC_ADDRESS,
    decimals: 18,
    chain_id: SEPOLIA_CHAIN_ID,
    rpc_url: "https://ethereum-sepolia-rpc.publicnode.com",
    domain_name: "JPY Coin",
    domain_version: "1",
    pricing: Pricing::JpyOracle,
};

impl TokenSymbol {
    pub const ALL: [TokenSymbol; 2] = [TokenSymbol::Usdc, TokenSymbol::Jpyc];

    pub fn config(self) -> &'static TokenConfig {
        match self {
            TokenSymbol::Usdc => &USDC,
            TokenSymbol::Jpyc => &JPYC,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TokenSymbol::Usdc => "USDC",
            TokenSymbol::Jpyc => "JPYC",
        }
    }
}

impl fmt::Display for TokenSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenSymbol {
    type Err = FacilitatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USDC" => Ok(TokenSymbol::Usdc),
            "JPYC" => Ok(TokenSymbol::Jpyc),
            other => Err(FacilitatorError::UnsupportedToken(other.to_string())),
        }
    }
}
