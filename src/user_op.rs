// src/user_op.rs
//! ERC-4337 user operations in their two wire versions, and the lifecycle an
//! operation moves through between preparation and settlement.

use ethers::types::{Address, Bytes, H160, H256, U256};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::FacilitatorError;
use crate::types::Sponsorship;

// 0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789
pub const ENTRY_POINT_V06: Address = H160([
    0x5f, 0xf1, 0x37, 0xd4, 0xb0, 0xfd, 0xcd, 0x49, 0xdc, 0xa3, 0x0c, 0x7c, 0xf5, 0x7e, 0x57,
    0x8a, 0x02, 0x6d, 0x27, 0x89,
]);

// 0x0000000071727De22E5E9d8BAf0edAc6f37da032
pub const ENTRY_POINT_V07: Address = H160([
    0x00, 0x00, 0x00, 0x00, 0x71, 0x72, 0x7d, 0xe2, 0x2e, 0x5e, 0x9d, 0x8b, 0xaf, 0x0e, 0xda,
    0xc6, 0xf3, 0x7d, 0xa0, 0x32,
]);

/// Hex quantity as sent over JSON-RPC (`0x0` for zero).
pub fn to_quantity(value: U256) -> String {
    format!("{:#x}", value)
}

/// Lenient decoding of client-supplied numbers and byte strings: quantities
/// may be JSON numbers, decimal strings or `0x` hex strings; `null` means
/// absent.
mod lenient {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Quantity {
        Number(u64),
        Text(String),
    }

    pub(crate) fn parse_quantity(raw: &str) -> Result<U256, String> {
        let raw = raw.trim();
        match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            Some("") => Ok(U256::zero()),
            Some(hex) => U256::from_str_radix(hex, 16).map_err(|e| format!("{raw}: {e:?}")),
            None if raw.is_empty() => Ok(U256::zero()),
            None => U256::from_dec_str(raw).map_err(|e| format!("{raw}: {e:?}")),
        }
    }

    pub(crate) fn opt_u256<'de, D>(deserializer: D) -> Result<Option<U256>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Quantity>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Quantity::Number(n)) => Ok(Some(U256::from(n))),
            Some(Quantity::Text(s)) => parse_quantity(&s).map(Some).map_err(de::Error::custom),
        }
    }

    pub(crate) fn u256<'de, D>(deserializer: D) -> Result<U256, D::Error>
    where
        D: Deserializer<'de>,
    {
        opt_u256(deserializer).map(Option::unwrap_or_default)
    }

    pub(crate) fn bytes<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<Bytes>::deserialize(deserializer)?.unwrap_or_default())
    }
}

pub(crate) use lenient::{opt_u256 as opt_quantity, parse_quantity};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationV06 {
    pub sender: Address,
    #[serde(default, deserialize_with = "lenient::u256")]
    pub nonce: U256,
    #[serde(default, deserialize_with = "lenient::bytes")]
    pub init_code: Bytes,
    #[serde(default, deserialize_with = "lenient::bytes")]
    pub call_data: Bytes,
    #[serde(default, deserialize_with = "lenient::u256")]
    pub call_gas_limit: U256,
    #[serde(default, deserialize_with = "lenient::u256")]
    pub verification_gas_limit: U256,
    #[serde(default, deserialize_with = "lenient::u256")]
    pub pre_verification_gas: U256,
    #[serde(default, deserialize_with = "lenient::u256")]
    pub max_fee_per_gas: U256,
    #[serde(default, deserialize_with = "lenient::u256")]
    pub max_priority_fee_per_gas: U256,
    #[serde(default, deserialize_with = "lenient::bytes")]
    pub paymaster_and_data: Bytes,
    #[serde(default)]
    pub signature: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperationV07 {
    pub sender: Address,
    #[serde(default, deserialize_with = "lenient::u256")]
    pub nonce: U256,
    #[serde(default)]
    pub factory: Option<Address>,
    #[serde(default)]
    pub factory_data: Option<Bytes>,
    #[serde(default, deserialize_with = "lenient::bytes")]
    pub call_data: Bytes,
    #[serde(default, deserialize_with = "lenient::u256")]
    pub call_gas_limit: U256,
    #[serde(default, deserialize_with = "lenient::u256")]
    pub verification_gas_limit: U256,
    #[serde(default, deserialize_with = "lenient::u256")]
    pub pre_verification_gas: U256,
    #[serde(default, deserialize_with = "lenient::u256")]
    pub max_fee_per_gas: U256,
    #[serde(default, deserialize_with = "lenient::u256")]
    pub max_priority_fee_per_gas: U256,
    #[serde(default)]
    pub paymaster: Option<Address>,
    #[serde(default, deserialize_with = "lenient::opt_u256")]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default, deserialize_with = "lenient::opt_u256")]
    pub paymaster_post_op_gas_limit: Option<U256>,
    #[serde(default)]
    pub paymaster_data: Option<Bytes>,
    #[serde(default)]
    pub signature: Option<Bytes>,
}

fn insert_signature(mut value: Value, signature: &Option<Bytes>) -> Value {
    if let (Some(signature), Value::Object(map)) = (signature, &mut value) {
        map.insert("signature".to_string(), json!(signature));
    }
    value
}

impl UserOperationV06 {
    /// Bundler wire format: hex quantities, `0x` for empty byte strings.
    pub fn to_wire(&self) -> Value {
        let value = json!({
            "sender": self.sender,
            "nonce": to_quantity(self.nonce),
            "initCode": self.init_code,
            "callData": self.call_data,
            "callGasLimit": to_quantity(self.call_gas_limit),
            "verificationGasLimit": to_quantity(self.verification_gas_limit),
            "preVerificationGas": to_quantity(self.pre_verification_gas),
            "maxFeePerGas": to_quantity(self.max_fee_per_gas),
            "maxPriorityFeePerGas": to_quantity(self.max_priority_fee_per_gas),
            "paymasterAndData": self.paymaster_and_data,
        });
        insert_signature(value, &self.signature)
    }
}

impl UserOperationV07 {
    /// Bundler wire format: hex quantities, absent factory and paymaster
    /// fields as `null`.
    pub fn to_wire(&self) -> Value {
        let value = json!({
            "sender": self.sender,
            "nonce": to_quantity(self.nonce),
            "factory": self.factory,
            "factoryData": self.factory_data,
            "callData": self.call_data,
            "callGasLimit": to_quantity(self.call_gas_limit),
            "verificationGasLimit": to_quantity(self.verification_gas_limit),
            "preVerificationGas": to_quantity(self.pre_verification_gas),
            "maxFeePerGas": to_quantity(self.max_fee_per_gas),
            "maxPriorityFeePerGas": to_quantity(self.max_priority_fee_per_gas),
            "paymaster": self.paymaster,
            "paymasterVerificationGasLimit": self.paymaster_verification_gas_limit.map(to_quantity),
            "paymasterPostOpGasLimit": self.paymaster_post_op_gas_limit.map(to_quantity),
            "paymasterData": self.paymaster_data,
        });
        insert_signature(value, &self.signature)
    }
}

/// A user operation in exactly one wire version.
///
/// The version is decided when deserializing: `initCode` or
/// `paymasterAndData` present means v0.6, otherwise v0.7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserOperation {
    V06(UserOperationV06),
    V07(UserOperationV07),
}

impl<'de> Deserialize<'de> for UserOperation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let fields = Map::<String, Value>::deserialize(deserializer)?;
        let is_v06 = fields.contains_key("initCode") || fields.contains_key("paymasterAndData");
        let value = Value::Object(fields);

        if is_v06 {
            UserOperationV06::deserialize(value)
                .map(UserOperation::V06)
                .map_err(de::Error::custom)
        } else {
            UserOperationV07::deserialize(value)
                .map(UserOperation::V07)
                .map_err(de::Error::custom)
        }
    }
}

impl Serialize for UserOperation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_wire().serialize(serializer)
    }
}

impl UserOperation {
    pub fn version(&self) -> &'static str {
        match self {
            UserOperation::V06(_) => "0.6",
            UserOperation::V07(_) => "0.7",
        }
    }

    pub fn entry_point(&self) -> Address {
        match self {
            UserOperation::V06(_) => ENTRY_POINT_V06,
            UserOperation::V07(_) => ENTRY_POINT_V07,
        }
    }

    pub fn sender(&self) -> Address {
        match self {
            UserOperation::V06(op) => op.sender,
            UserOperation::V07(op) => op.sender,
        }
    }

    pub fn signature(&self) -> Option<&Bytes> {
        match self {
            UserOperation::V06(op) => op.signature.as_ref(),
            UserOperation::V07(op) => op.signature.as_ref(),
        }
    }

    pub fn to_wire(&self) -> Value {
        match self {
            UserOperation::V06(op) => op.to_wire(),
            UserOperation::V07(op) => op.to_wire(),
        }
    }

    /// Whether paymaster data is attached.
    pub fn is_sponsored(&self) -> bool {
        match self {
            UserOperation::V06(op) => !op.paymaster_and_data.is_empty(),
            UserOperation::V07(op) => op.paymaster.is_some(),
        }
    }

    /// Copy paymaster fields and any paymaster-provided gas limits from a
    /// sponsorship answer.
    fn apply_sponsorship(&mut self, sponsorship: &Sponsorship) {
        match self {
            UserOperation::V06(op) => {
                if let Some(data) = &sponsorship.paymaster_and_data {
                    op.paymaster_and_data = data.clone();
                }
                apply_gas(
                    sponsorship,
                    &mut op.call_gas_limit,
                    &mut op.verification_gas_limit,
                    &mut op.pre_verification_gas,
                );
            }
            UserOperation::V07(op) => {
                if sponsorship.paymaster.is_some() {
                    op.paymaster = sponsorship.paymaster;
                    op.paymaster_verification_gas_limit =
                        sponsorship.paymaster_verification_gas_limit;
                    op.paymaster_post_op_gas_limit = sponsorship.paymaster_post_op_gas_limit;
                    op.paymaster_data = sponsorship.paymaster_data.clone();
                }
                apply_gas(
                    sponsorship,
                    &mut op.call_gas_limit,
                    &mut op.verification_gas_limit,
                    &mut op.pre_verification_gas,
                );
            }
        }
    }
}

fn apply_gas(
    sponsorship: &Sponsorship,
    call_gas_limit: &mut U256,
    verification_gas_limit: &mut U256,
    pre_verification_gas: &mut U256,
) {
    if let Some(gas) = sponsorship.call_gas_limit {
        *call_gas_limit = gas;
    }
    if let Some(gas) = sponsorship.verification_gas_limit {
        *verification_gas_limit = gas;
    }
    if let Some(gas) = sponsorship.pre_verification_gas {
        *pre_verification_gas = gas;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Unsigned,
    Sponsored,
    Signed,
    Submitted,
    Confirmed,
    Pending,
    Failed,
}

impl Stage {
    fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, next),
            (Unsigned, Sponsored)
                | (Unsigned, Signed)
                | (Sponsored, Signed)
                | (Signed, Submitted)
                | (Submitted, Confirmed)
                | (Submitted, Pending)
                | (Submitted, Failed)
                | (Pending, Confirmed)
                | (Pending, Failed)
        )
    }
}

/// An operation together with where it is in the prepare/submit flow.
#[derive(Debug, Clone)]
pub struct OperationLifecycle {
    stage: Stage,
    operation: UserOperation,
    user_op_hash: Option<H256>,
}

impl OperationLifecycle {
    /// Start from an operation the payer has not signed yet.
    pub fn unsigned(mut operation: UserOperation) -> Self {
        match &mut operation {
            UserOperation::V06(op) => op.signature = None,
            UserOperation::V07(op) => op.signature = None,
        }
        Self {
            stage: Stage::Unsigned,
            operation,
            user_op_hash: None,
        }
    }

    /// Start from an operation carrying the payer's signature.
    pub fn signed(operation: UserOperation) -> Result<Self, FacilitatorError> {
        let has_signature = operation.signature().is_some_and(|s| !s.is_empty());
        if !has_signature {
            return Err(FacilitatorError::BadRequest(
                "Signed userOperation is required".to_string(),
            ));
        }

        let sponsored = operation.is_sponsored();
        let mut lifecycle = Self {
            stage: Stage::Unsigned,
            operation,
            user_op_hash: None,
        };
        if sponsored {
            lifecycle.advance(Stage::Sponsored)?;
        }
        lifecycle.advance(Stage::Signed)?;
        Ok(lifecycle)
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn operation(&self) -> &UserOperation {
        &self.operation
    }

    pub fn user_op_hash(&self) -> Option<H256> {
        self.user_op_hash
    }

    fn advance(&mut self, next: Stage) -> Result<(), FacilitatorError> {
        if !self.stage.can_advance_to(next) {
            return Err(FacilitatorError::IllegalTransition {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        Ok(())
    }

    /// Attach a paymaster answer. The stage only moves to `Sponsored` when
    /// the answer actually carried paymaster data.
    pub fn sponsor(&mut self, sponsorship: &Sponsorship) -> Result<(), FacilitatorError> {
        if self.stage != Stage::Unsigned {
            return Err(FacilitatorError::IllegalTransition {
                from: self.stage,
                to: Stage::Sponsored,
            });
        }
        self.operation.apply_sponsorship(sponsorship);
        if self.operation.is_sponsored() {
            self.advance(Stage::Sponsored)?;
        }
        Ok(())
    }

    pub fn mark_submitted(&mut self, user_op_hash: H256) -> Result<(), FacilitatorError> {
        self.advance(Stage::Submitted)?;
        self.user_op_hash = Some(user_op_hash);
        Ok(())
    }

    /// Record the receipt outcome: `None` while no receipt exists.
    pub fn settle(&mut self, receipt_success: Option<bool>) -> Result<Stage, FacilitatorError> {
        let next = match receipt_success {
            Some(true) => Stage::Confirmed,
            Some(false) => Stage::Failed,
            None => Stage::Pending,
        };
        self.advance(next)?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v06_input() -> Value {
        json!({
            "sender": "0x1111111111111111111111111111111111111111",
            "nonce": "5",
            "initCode": "0x",
            "callData": "0xb61d27f6",
            "callGasLimit": "150000",
            "verificationGasLimit": 500000,
            "preVerificationGas": "0x13880",
            "maxFeePerGas": "1000000",
            "maxPriorityFeePerGas": "1000",
            "signature": "0x01"
        })
    }

    fn v07_input() -> Value {
        json!({
            "sender": "0x1111111111111111111111111111111111111111",
            "nonce": "0x1",
            "callData": "0x",
            "callGasLimit": "0x10",
            "verificationGasLimit": "0x20",
            "preVerificationGas": "0x30",
            "maxFeePerGas": "0x40",
            "maxPriorityFeePerGas": "0x50",
            "signature": "0x02"
        })
    }

    #[test]
    fn test_entry_point_constants() {
        let v06: Address = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789".parse().unwrap();
        let v07: Address = "0x0000000071727De22E5E9d8BAf0edAc6f37da032".parse().unwrap();
        assert_eq!(ENTRY_POINT_V06, v06);
        assert_eq!(ENTRY_POINT_V07, v07);
    }

    #[test]
    fn test_init_code_selects_v06() {
        let op: UserOperation = serde_json::from_value(v06_input()).unwrap();
        assert!(matches!(op, UserOperation::V06(_)));
        assert_eq!(op.entry_point(), ENTRY_POINT_V06);
    }

    #[test]
    fn test_paymaster_and_data_alone_selects_v06() {
        let mut input = v07_input();
        input["paymasterAndData"] = json!("0xdead");
        let op: UserOperation = serde_json::from_value(input).unwrap();
        assert_eq!(op.version(), "0.6");
        assert_eq!(op.entry_point(), ENTRY_POINT_V06);
    }

    #[test]
    fn test_missing_v06_fields_selects_v07() {
        let mut input = v07_input();
        input["paymaster"] = json!("0x2222222222222222222222222222222222222222");
        let op: UserOperation = serde_json::from_value(input).unwrap();
        assert_eq!(op.version(), "0.7");
        assert_eq!(op.entry_point(), ENTRY_POINT_V07);
    }

    #[test]
    fn test_v06_wire_normalizes_quantities() {
        let mut input = v06_input();
        input.as_object_mut().unwrap().remove("maxPriorityFeePerGas");
        let op: UserOperation = serde_json::from_value(input).unwrap();
        let wire = op.to_wire();

        assert_eq!(wire["nonce"], "0x5");
        assert_eq!(wire["callGasLimit"], "0x249f0");
        assert_eq!(wire["verificationGasLimit"], "0x7a120");
        assert_eq!(wire["preVerificationGas"], "0x13880");
        assert_eq!(wire["maxPriorityFeePerGas"], "0x0");
        assert_eq!(wire["paymasterAndData"], "0x");
        assert_eq!(wire["initCode"], "0x");
        assert_eq!(wire["signature"], "0x01");
        assert!(wire.get("paymaster").is_none());
    }

    #[test]
    fn test_v07_wire_keeps_absent_fields_null() {
        let op: UserOperation = serde_json::from_value(v07_input()).unwrap();
        let wire = op.to_wire();

        assert_eq!(wire["nonce"], "0x1");
        for field in [
            "factory",
            "factoryData",
            "paymaster",
            "paymasterVerificationGasLimit",
            "paymasterPostOpGasLimit",
            "paymasterData",
        ] {
            assert!(wire[field].is_null(), "{field} should be null");
        }
        assert!(wire.get("initCode").is_none());
    }

    #[test]
    fn test_rejects_malformed_quantity() {
        let mut input = v06_input();
        input["nonce"] = json!("five");
        assert!(serde_json::from_value::<UserOperation>(input).is_err());
    }

    #[test]
    fn test_signed_requires_signature() {
        let mut input = v07_input();
        input.as_object_mut().unwrap().remove("signature");
        let op: UserOperation = serde_json::from_value(input).unwrap();
        assert!(matches!(
            OperationLifecycle::signed(op),
            Err(FacilitatorError::BadRequest(_))
        ));
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let op: UserOperation = serde_json::from_value(v07_input()).unwrap();
        let mut lifecycle = OperationLifecycle::signed(op).unwrap();
        assert_eq!(lifecycle.stage(), Stage::Signed);

        lifecycle.mark_submitted(H256::repeat_byte(1)).unwrap();
        assert_eq!(lifecycle.settle(None).unwrap(), Stage::Pending);
        assert_eq!(lifecycle.settle(Some(true)).unwrap(), Stage::Confirmed);
        assert_eq!(lifecycle.user_op_hash(), Some(H256::repeat_byte(1)));
    }

    #[test]
    fn test_lifecycle_rejects_out_of_order_steps() {
        let op: UserOperation = serde_json::from_value(v07_input()).unwrap();
        let mut unsigned = OperationLifecycle::unsigned(op.clone());
        assert!(unsigned.operation().signature().is_none());
        assert!(matches!(
            unsigned.mark_submitted(H256::zero()),
            Err(FacilitatorError::IllegalTransition { from: Stage::Unsigned, to: Stage::Submitted })
        ));

        let mut signed = OperationLifecycle::signed(op).unwrap();
        assert!(signed.sponsor(&Sponsorship::default()).is_err());
        signed.mark_submitted(H256::zero()).unwrap();
        signed.settle(Some(false)).unwrap();
        assert!(signed.settle(Some(true)).is_err());
    }

    #[test]
    fn test_sponsorship_moves_stage_only_with_paymaster_data() {
        let op: UserOperation = serde_json::from_value(v06_input()).unwrap();

        let mut lifecycle = OperationLifecycle::unsigned(op.clone());
        lifecycle
            .sponsor(&Sponsorship {
                call_gas_limit: Some(U256::from(99)),
                ..Sponsorship::default()
            })
            .unwrap();
        assert_eq!(lifecycle.stage(), Stage::Unsigned);

        let mut lifecycle = OperationLifecycle::unsigned(op);
        lifecycle
            .sponsor(&Sponsorship {
                paymaster_and_data: Some(Bytes::from(vec![0xaa])),
                ..Sponsorship::default()
            })
            .unwrap();
        assert_eq!(lifecycle.stage(), Stage::Sponsored);
        assert!(lifecycle.operation().is_sponsored());
    }

    #[test]
    fn test_parse_quantity_forms() {
        assert_eq!(parse_quantity("0x").unwrap(), U256::zero());
        assert_eq!(parse_quantity("").unwrap(), U256::zero());
        assert_eq!(parse_quantity("0xff").unwrap(), U256::from(255));
        assert_eq!(parse_quantity("255").unwrap(), U256::from(255));
        assert!(parse_quantity("-1").is_err());
    }
}
