// src/authorization.rs
//! ERC-3009 `TransferWithAuthorization` messages: construction, EIP-712
//! hashing and the 65-byte signature layout used by both relay paths.

use std::time::{SystemTime, UNIX_EPOCH};

use ethers::abi::{self, Token};
use ethers::types::transaction::eip712::EIP712Domain;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::FacilitatorError;
use crate::tokens::TokenSymbol;

pub const TRANSFER_WITH_AUTHORIZATION_TYPE: &str = "TransferWithAuthorization(address from,address to,uint256 value,uint256 validAfter,uint256 validBefore,bytes32 nonce)";

/// Default lifetime of a freshly built authorization.
pub const DEFAULT_VALIDITY_SECS: u64 = 3600;

pub const SIGNATURE_LEN: usize = 65;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferAuthorization {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub valid_after: U256,
    pub valid_before: U256,
    pub nonce: H256,
}

/// (v, r, s) split of an ECDSA signature. `v` is always 27 or above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureParts {
    pub v: u8,
    pub r: H256,
    pub s: H256,
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// 32 bytes from the OS random source.
pub fn random_nonce() -> H256 {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    H256::from(bytes)
}

/// Build an authorization, filling unspecified fields with defaults:
/// `validAfter = 0`, `validBefore = now + 1h`, random nonce.
pub fn build_authorization(
    from: Address,
    to: Address,
    value: U256,
    valid_after: Option<U256>,
    valid_before: Option<U256>,
    nonce: Option<H256>,
) -> TransferAuthorization {
    let valid_before =
        valid_before.unwrap_or_else(|| U256::from(unix_now() + DEFAULT_VALIDITY_SECS));

    TransferAuthorization {
        from,
        to,
        value,
        valid_after: valid_after.unwrap_or_default(),
        valid_before,
        nonce: nonce.unwrap_or_else(random_nonce),
    }
}

/// Split a raw 65-byte signature into (v, r, s).
///
/// Accepts both recovery-id (0/1) and Ethereum-style (27/28) trailing bytes;
/// values below 27 are shifted up by 27.
pub fn decode_signature(signature: &[u8]) -> Result<SignatureParts, FacilitatorError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(FacilitatorError::BadSignature(format!(
            "expected {} bytes, got {}",
            SIGNATURE_LEN,
            signature.len()
        )));
    }

    let r = H256::from_slice(&signature[..32]);
    let s = H256::from_slice(&signature[32..64]);
    let mut v = signature[64];
    if v < 27 {
        v += 27;
    }

    Ok(SignatureParts { v, r, s })
}

/// Parse a `0x`-prefixed hex signature and split it.
pub fn decode_signature_hex(signature: &str) -> Result<SignatureParts, FacilitatorError> {
    let raw = signature.strip_prefix("0x").unwrap_or(signature);
    let bytes = hex::decode(raw).map_err(|e| FacilitatorError::BadSignature(e.to_string()))?;
    decode_signature(&bytes)
}

pub fn encode_signature(parts: &SignatureParts) -> Bytes {
    let mut data = Vec::with_capacity(SIGNATURE_LEN);
    data.extend_from_slice(parts.r.as_bytes());
    data.extend_from_slice(parts.s.as_bytes());
    data.push(parts.v);
    Bytes::from(data)
}

/// EIP-712 domain of a token contract. Name and version come from the static
/// token table and must match the deployed contract.
pub fn token_domain(token: TokenSymbol) -> EIP712Domain {
    let config = token.config();
    EIP712Domain {
        name: Some(config.domain_name.to_string()),
        version: Some(config.domain_version.to_string()),
        chain_id: Some(U256::from(config.chain_id)),
        verifying_contract: Some(config.contract_address),
        salt: None,
    }
}

fn struct_hash(authorization: &TransferAuthorization) -> [u8; 32] {
    let type_hash = keccak256(TRANSFER_WITH_AUTHORIZATION_TYPE);
    keccak256(abi::encode(&[
        Token::FixedBytes(type_hash.to_vec()),
        Token::Address(authorization.from),
        Token::Address(authorization.to),
        Token::Uint(authorization.value),
        Token::Uint(authorization.valid_after),
        Token::Uint(authorization.valid_before),
        Token::FixedBytes(authorization.nonce.as_bytes().to_vec()),
    ]))
}

/// Digest the payer signs: `keccak256(0x1901 || domainSeparator || structHash)`.
pub fn signing_digest(token: TokenSymbol, authorization: &TransferAuthorization) -> H256 {
    let mut message = Vec::with_capacity(66);
    message.extend_from_slice(&[0x19, 0x01]);
    message.extend_from_slice(&token_domain(token).separator());
    message.extend_from_slice(&struct_hash(authorization));
    H256::from(keccak256(message))
}
