// src/nonce_guard.rs
use ethers::types::{Address, H256};
use tracing::{debug, warn};

use crate::chain::AuthorizationChain;
use crate::error::FacilitatorError;
use crate::tokens::TokenSymbol;

/// Reject an authorization whose nonce the token contract already consumed.
///
/// Read-only and racy against concurrent submissions; the contract's own
/// nonce bitmap remains the final word.
pub async fn check(
    chain: &dyn AuthorizationChain,
    token: TokenSymbol,
    from: Address,
    nonce: H256,
) -> Result<(), FacilitatorError> {
    let used = chain.authorization_state(from, nonce).await?;
    if used {
        warn!(token = %token, from = ?from, nonce = ?nonce, "Authorization nonce already used");
        return Err(FacilitatorError::ReplayRejected);
    }

    debug!(token = %token, from = ?from, "Authorization nonce unused");
    Ok(())
}
