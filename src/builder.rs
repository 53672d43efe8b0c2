// src/builder.rs
use std::sync::Arc;

use ethers::abi::AbiEncode;
use ethers::types::{Address, Bytes, U256};
use ethers::utils::parse_units;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::bundler::Bundler;
use crate::chain::{EntryPointReader, ExecuteCall, TransferCall};
use crate::error::FacilitatorError;
use crate::tokens::{TokenSymbol, USDC_ADDRESS};
use crate::types::GasPrice;
use crate::user_op::{
    OperationLifecycle, UserOperation, UserOperationV06, UserOperationV07, ENTRY_POINT_V06,
    ENTRY_POINT_V07,
};

/// Gas limits used when neither the paymaster nor the estimator provide one.
pub const FALLBACK_CALL_GAS_LIMIT: u64 = 150_000;
pub const FALLBACK_VERIFICATION_GAS_LIMIT: u64 = 500_000;
pub const FALLBACK_PRE_VERIFICATION_GAS: u64 = 80_000;

/// ECDSA-shaped dummy signature accepted by bundlers during estimation and
/// sponsorship.
pub const PLACEHOLDER_SIGNATURE: [u8; 65] = {
    let mut sig = [0u8; 65];
    let mut i = 0;
    while i < 15 {
        sig[i] = 0xff;
        i += 1;
    }
    sig[15] = 0xf0;
    sig[32] = 0x7a;
    let mut j = 33;
    while j < 64 {
        sig[j] = 0xaa;
        j += 1;
    }
    sig[64] = 0x1c;
    sig
};

/// Transfer shape: move `amount` USDC (decimal string) from a smart wallet.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub sender: Option<Address>,
    pub to: Option<Address>,
    pub amount: Option<String>,
}

/// Call shape: arbitrary smart-account call data on the v0.7 entry point.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub sender: Option<Address>,
    pub call_data: Option<Bytes>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub factory: Option<Address>,
    #[serde(default)]
    pub factory_data: Option<Bytes>,
    /// Stand-in signature used for estimation and sponsorship.
    #[serde(default)]
    pub signature: Option<Bytes>,
}

/// Assembles unsigned operations: nonce, gas price, gas limits and paymaster
/// data, in that order.
pub struct OperationBuilder {
    bundler: Arc<dyn Bundler>,
    entry_point: Arc<dyn EntryPointReader>,
}

fn fallback_gas() -> (U256, U256, U256) {
    (
        U256::from(FALLBACK_CALL_GAS_LIMIT),
        U256::from(FALLBACK_VERIFICATION_GAS_LIMIT),
        U256::from(FALLBACK_PRE_VERIFICATION_GAS),
    )
}

/// `execute(USDC, 0, transfer(to, amount))` for the smart wallet.
pub fn usdc_transfer_call_data(to: Address, amount: U256) -> Bytes {
    let transfer = TransferCall { to, amount }.encode();
    let execute = ExecuteCall {
        target: USDC_ADDRESS,
        value: U256::zero(),
        data: Bytes::from(transfer),
    };
    Bytes::from(execute.encode())
}

/// Parse a human-readable token amount (`"1.5"`) into smallest units.
pub fn parse_token_amount(amount: &str, token: TokenSymbol) -> Result<U256, FacilitatorError> {
    let amount = amount.trim();
    if amount.starts_with('-') {
        return Err(FacilitatorError::BadRequest(format!(
            "amount must be positive: {}",
            amount
        )));
    }
    let units = parse_units(amount, u32::from(token.config().decimals))
        .map_err(|e| FacilitatorError::BadRequest(format!("invalid amount {}: {}", amount, e)))?;
    let value = U256::from(units);
    if value.is_zero() {
        return Err(FacilitatorError::BadRequest("amount must be positive".to_string()));
    }
    Ok(value)
}

impl OperationBuilder {
    pub fn new(bundler: Arc<dyn Bundler>, entry_point: Arc<dyn EntryPointReader>) -> Self {
        Self {
            bundler,
            entry_point,
        }
    }

    async fn fast_gas_price(&self) -> Result<GasPrice, FacilitatorError> {
        Ok(self.bundler.gas_price().await?.fast)
    }

    /// Build a v0.6 USDC transfer for a smart wallet.
    pub async fn prepare_transfer(
        &self,
        request: TransferRequest,
    ) -> Result<OperationLifecycle, FacilitatorError> {
        let (Some(sender), Some(to), Some(amount)) = (request.sender, request.to, request.amount)
        else {
            return Err(FacilitatorError::BadRequest(
                "sender, to, and amount are required".to_string(),
            ));
        };

        // 1. Encode the wallet call
        let value = parse_token_amount(&amount, TokenSymbol::Usdc)?;
        let call_data = usdc_transfer_call_data(to, value);

        // 2. Account nonce from the entry point
        let nonce = self.entry_point.nonce(ENTRY_POINT_V06, sender).await?;

        // 3. Gas price from the bundler
        let gas_price = self.fast_gas_price().await?;

        // 4. Fixed limits; the wallet's signature check makes simulation unreliable
        let (call_gas_limit, verification_gas_limit, pre_verification_gas) = fallback_gas();

        let operation = UserOperation::V06(UserOperationV06 {
            sender,
            nonce,
            init_code: Bytes::default(),
            call_data,
            call_gas_limit,
            verification_gas_limit,
            pre_verification_gas,
            max_fee_per_gas: gas_price.max_fee_per_gas,
            max_priority_fee_per_gas: gas_price.max_priority_fee_per_gas,
            paymaster_and_data: Bytes::default(),
            signature: None,
        });

        info!(sender = ?sender, to = ?to, amount = %amount, nonce = %nonce, "Prepared transfer operation");

        // 5. Paymaster data, if the paymaster will sponsor before signing
        self.sponsor(operation, None).await
    }

    /// Build a v0.7 operation around caller-supplied call data.
    pub async fn prepare_call(
        &self,
        request: CallRequest,
    ) -> Result<OperationLifecycle, FacilitatorError> {
        let (Some(sender), Some(call_data)) = (request.sender, request.call_data) else {
            return Err(FacilitatorError::BadRequest("Missing userOp fields".to_string()));
        };

        // 1. Nonce as given, or from the entry point
        let nonce = match request.nonce.as_deref() {
            Some(raw) => crate::user_op::parse_quantity(raw).map_err(FacilitatorError::BadRequest)?,
            None => self.entry_point.nonce(ENTRY_POINT_V07, sender).await?,
        };

        // 2. Gas price from the bundler
        let gas_price = self.fast_gas_price().await?;

        let (call_gas_limit, verification_gas_limit, pre_verification_gas) = fallback_gas();
        let mut operation = UserOperationV07 {
            sender,
            nonce,
            factory: request.factory,
            factory_data: request.factory_data,
            call_data,
            call_gas_limit,
            verification_gas_limit,
            pre_verification_gas,
            max_fee_per_gas: gas_price.max_fee_per_gas,
            max_priority_fee_per_gas: gas_price.max_priority_fee_per_gas,
            paymaster: None,
            paymaster_verification_gas_limit: None,
            paymaster_post_op_gas_limit: None,
            paymaster_data: None,
            signature: None,
        };

        let placeholder = request
            .signature
            .clone()
            .unwrap_or_else(|| Bytes::from(PLACEHOLDER_SIGNATURE.to_vec()));

        // 3. Gas limits from the bundler's simulation, falling back to the fixed ones
        let mut estimating = operation.clone();
        estimating.signature = Some(placeholder.clone());
        match self
            .bundler
            .estimate_gas(&UserOperation::V07(estimating))
            .await
        {
            Ok(estimate) => {
                debug!(
                    call_gas_limit = %estimate.call_gas_limit,
                    verification_gas_limit = %estimate.verification_gas_limit,
                    "Using estimated gas limits"
                );
                operation.call_gas_limit = estimate.call_gas_limit;
                operation.verification_gas_limit = estimate.verification_gas_limit;
                operation.pre_verification_gas = estimate.pre_verification_gas;
            }
            Err(e) => {
                warn!(error = %e, "Gas estimation failed, using fixed limits");
            }
        }

        info!(sender = ?sender, nonce = %nonce, "Prepared call operation");

        // 4. Paymaster data
        self.sponsor(UserOperation::V07(operation), Some(placeholder))
            .await
    }

    /// Ask the paymaster to sponsor `operation`. A refusal leaves it
    /// unsponsored so sponsorship can be completed in a later round.
    async fn sponsor(
        &self,
        operation: UserOperation,
        placeholder: Option<Bytes>,
    ) -> Result<OperationLifecycle, FacilitatorError> {
        let placeholder =
            placeholder.unwrap_or_else(|| Bytes::from(PLACEHOLDER_SIGNATURE.to_vec()));
        let mut request = operation.clone();
        match &mut request {
            UserOperation::V06(op) => op.signature = Some(placeholder),
            UserOperation::V07(op) => op.signature = Some(placeholder),
        }

        let mut lifecycle = OperationLifecycle::unsigned(operation);
        match self.bundler.sponsor(&request).await {
            Ok(sponsorship) => lifecycle.sponsor(&sponsorship)?,
            Err(e) => {
                warn!(error = %e, "Paymaster sponsorship unavailable, returning unsponsored operation");
            }
        }

        Ok(lifecycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::bundler::tests::MockBundler;
    use crate::types::Sponsorship;
    use crate::user_op::Stage;

    struct FixedEntryPoint {
        nonce: U256,
        lookups: Mutex<Vec<Address>>,
    }

    impl FixedEntryPoint {
        fn new(nonce: u64) -> Self {
            Self {
                nonce: U256::from(nonce),
                lookups: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EntryPointReader for FixedEntryPoint {
        async fn nonce(
            &self,
            entry_point: Address,
            _sender: Address,
        ) -> Result<U256, FacilitatorError> {
            self.lookups.lock().unwrap().push(entry_point);
            Ok(self.nonce)
        }
    }

    fn transfer_request() -> TransferRequest {
        TransferRequest {
            sender: Some(Address::repeat_byte(0x01)),
            to: Some(Address::repeat_byte(0x02)),
            amount: Some("1.5".to_string()),
        }
    }

    fn call_request() -> CallRequest {
        CallRequest {
            sender: Some(Address::repeat_byte(0x01)),
            call_data: Some(Bytes::from(vec![0xde, 0xad])),
            nonce: None,
            factory: None,
            factory_data: None,
            signature: None,
        }
    }

    #[tokio::test]
    async fn test_transfer_uses_fixed_gas_and_v06() {
        let bundler = Arc::new(MockBundler::new());
        let entry_point = Arc::new(FixedEntryPoint::new(7));
        let builder = OperationBuilder::new(bundler.clone(), entry_point.clone());

        let prepared = builder.prepare_transfer(transfer_request()).await.unwrap();

        assert_eq!(prepared.stage(), Stage::Unsigned);
        let UserOperation::V06(op) = prepared.operation() else {
            panic!("expected v0.6 operation");
        };
        assert_eq!(op.nonce, U256::from(7));
        assert_eq!(op.call_gas_limit, U256::from(FALLBACK_CALL_GAS_LIMIT));
        assert_eq!(op.verification_gas_limit, U256::from(FALLBACK_VERIFICATION_GAS_LIMIT));
        assert_eq!(op.pre_verification_gas, U256::from(FALLBACK_PRE_VERIFICATION_GAS));
        assert_eq!(op.max_fee_per_gas, MockBundler::fast_price().max_fee_per_gas);
        assert!(op.paymaster_and_data.is_empty());
        assert!(op.signature.is_none());
        assert_eq!(*entry_point.lookups.lock().unwrap(), vec![ENTRY_POINT_V06]);
        assert_eq!(
            op.call_data,
            usdc_transfer_call_data(Address::repeat_byte(0x02), U256::from(1_500_000))
        );
    }

    #[tokio::test]
    async fn test_transfer_sponsorship_overrides_gas() {
        let mut bundler = MockBundler::new();
        bundler.sponsorship = Some(Sponsorship {
            paymaster_and_data: Some(Bytes::from(vec![0xab; 20])),
            call_gas_limit: Some(U256::from(123_456)),
            ..Sponsorship::default()
        });
        let bundler = Arc::new(bundler);
        let builder = OperationBuilder::new(bundler.clone(), Arc::new(FixedEntryPoint::new(0)));

        let prepared = builder.prepare_transfer(transfer_request()).await.unwrap();

        assert_eq!(prepared.stage(), Stage::Sponsored);
        let wire = prepared.operation().to_wire();
        assert_eq!(wire["callGasLimit"], "0x1e240");
        assert_eq!(wire["verificationGasLimit"], "0x7a120");
        assert!(wire.get("signature").is_none());

        // Sponsorship was requested with the placeholder signature
        let sponsored = bundler.sponsored.lock().unwrap();
        assert_eq!(
            sponsored[0]["signature"],
            serde_json::json!(Bytes::from(PLACEHOLDER_SIGNATURE.to_vec()))
        );
    }

    #[tokio::test]
    async fn test_transfer_requires_fields() {
        let builder = OperationBuilder::new(
            Arc::new(MockBundler::new()),
            Arc::new(FixedEntryPoint::new(0)),
        );
        let mut request = transfer_request();
        request.amount = None;

        assert!(matches!(
            builder.prepare_transfer(request).await,
            Err(FacilitatorError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_call_looks_up_nonce_on_v07() {
        let bundler = Arc::new(MockBundler::new());
        let entry_point = Arc::new(FixedEntryPoint::new(3));
        let builder = OperationBuilder::new(bundler, entry_point.clone());

        let prepared = builder.prepare_call(call_request()).await.unwrap();

        let UserOperation::V07(op) = prepared.operation() else {
            panic!("expected v0.7 operation");
        };
        assert_eq!(op.nonce, U256::from(3));
        assert_eq!(op.call_gas_limit, U256::from(90_000));
        assert_eq!(op.pre_verification_gas, U256::from(50_000));
        assert_eq!(*entry_point.lookups.lock().unwrap(), vec![ENTRY_POINT_V07]);
    }

    #[tokio::test]
    async fn test_call_with_nonce_skips_lookup_and_falls_back_on_estimate_failure() {
        let mut bundler = MockBundler::new();
        bundler.fail_estimate = true;
        bundler.sponsorship = Some(Sponsorship {
            paymaster: Some(Address::repeat_byte(0x99)),
            paymaster_verification_gas_limit: Some(U256::from(40_000)),
            paymaster_post_op_gas_limit: Some(U256::from(1)),
            paymaster_data: Some(Bytes::from(vec![0x01])),
            ..Sponsorship::default()
        });
        let entry_point = Arc::new(FixedEntryPoint::new(3));
        let builder = OperationBuilder::new(Arc::new(bundler), entry_point.clone());

        let mut request = call_request();
        request.nonce = Some("0x9".to_string());
        let prepared = builder.prepare_call(request).await.unwrap();

        assert_eq!(prepared.stage(), Stage::Sponsored);
        let UserOperation::V07(op) = prepared.operation() else {
            panic!("expected v0.7 operation");
        };
        assert_eq!(op.nonce, U256::from(9));
        assert_eq!(op.call_gas_limit, U256::from(FALLBACK_CALL_GAS_LIMIT));
        assert_eq!(op.paymaster, Some(Address::repeat_byte(0x99)));
        assert!(entry_point.lookups.lock().unwrap().is_empty());
    }

    #[test]
    fn test_parse_token_amount() {
        assert_eq!(
            parse_token_amount("0.5", TokenSymbol::Usdc).unwrap(),
            U256::from(500_000)
        );
        assert!(parse_token_amount("0", TokenSymbol::Usdc).is_err());
        assert!(parse_token_amount("-1", TokenSymbol::Usdc).is_err());
        assert!(parse_token_amount("abc", TokenSymbol::Usdc).is_err());
    }

    #[test]
    fn test_placeholder_signature_layout() {
        let expected = hex::decode(
            "fffffffffffffffffffffffffffffff0000000000000000000000000000000007aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1c",
        )
        .unwrap();
        assert_eq!(PLACEHOLDER_SIGNATURE.to_vec(), expected);
    }
}
