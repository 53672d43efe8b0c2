// src/lib.rs
//! Gasless payment facilitator: relays ERC-3009 transfer authorizations and
//! ERC-4337 user operations, and prices paid content in USDC and JPYC.

pub mod api;
pub mod authorization;
pub mod builder;
pub mod bundler;
pub mod chain;
pub mod content;
pub mod error;
pub mod negotiator;
pub mod nonce_guard;
pub mod oracle;
pub mod poll;
pub mod relayer;
pub mod submitter;
pub mod tokens;
pub mod types;
pub mod user_op;

pub use error::FacilitatorError;
