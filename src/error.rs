// src/error.rs
use ethers::types::{H256, U256};
use thiserror::Error;

use crate::user_op::Stage;

#[derive(Error, Debug)]
pub enum FacilitatorError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unsupported token: {0}")]
    UnsupportedToken(String),

    #[error("Invalid signature: {0}")]
    BadSignature(String),

    #[error("Authorization nonce has already been used")]
    ReplayRejected,

    #[error("Invalid recipient address")]
    WrongRecipient,

    #[error("Insufficient payment amount: expected at least {minimum}, got {actual}")]
    InsufficientPayment { minimum: U256, actual: U256 },

    #[error("Bundler rejected UserOperation: {0}")]
    BundlerRejected(String),

    #[error("Transaction {0:?} was not confirmed in time")]
    ConfirmationTimeout(H256),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Facilitator not configured: {0}")]
    NotConfigured(String),

    #[error("Payment transaction {0:?} failed")]
    PaymentFailed(H256),

    #[error("Illegal operation transition: {from:?} -> {to:?}")]
    IllegalTransition { from: Stage, to: Stage },
}

impl FacilitatorError {
    /// HTTP status code the error is surfaced with.
    pub fn status_code(&self) -> u16 {
        match self {
            FacilitatorError::BadRequest(_)
            | FacilitatorError::UnsupportedToken(_)
            | FacilitatorError::BadSignature(_)
            | FacilitatorError::ReplayRejected
            | FacilitatorError::WrongRecipient
            | FacilitatorError::InsufficientPayment { .. }
            | FacilitatorError::BundlerRejected(_) => 400,
            // Submitted but unconfirmed; reported as pending, not a failure
            FacilitatorError::ConfirmationTimeout(_) => 202,
            FacilitatorError::UpstreamUnavailable(_)
            | FacilitatorError::NotConfigured(_)
            | FacilitatorError::PaymentFailed(_)
            | FacilitatorError::IllegalTransition { .. } => 500,
        }
    }
}
