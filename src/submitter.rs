// src/submitter.rs
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bundler::Bundler;
use crate::error::FacilitatorError;
use crate::poll::{PollOutcome, RetryPolicy};
use crate::types::{SubmissionReport, TxStatus};
use crate::user_op::{OperationLifecycle, Stage, UserOperation};

/// Sends signed operations to the bundler and waits for inclusion.
pub struct OperationSubmitter {
    bundler: Arc<dyn Bundler>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl OperationSubmitter {
    pub fn new(bundler: Arc<dyn Bundler>, cancel: CancellationToken) -> Self {
        Self {
            bundler,
            policy: RetryPolicy::USER_OP_RECEIPT,
            cancel,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Submit once, then poll for the receipt within the retry budget.
    ///
    /// A bundler rejection is returned immediately. Running out of attempts
    /// (or shutdown) is not an error: the report says `pending`.
    pub async fn submit(&self, operation: UserOperation) -> Result<SubmissionReport, FacilitatorError> {
        let mut lifecycle = OperationLifecycle::signed(operation)?;

        info!(
            sender = ?lifecycle.operation().sender(),
            version = lifecycle.operation().version(),
            sponsored = lifecycle.operation().is_sponsored(),
            "Submitting user operation"
        );

        let user_op_hash = self.bundler.send(lifecycle.operation()).await?;
        lifecycle.mark_submitted(user_op_hash)?;
        info!(user_op_hash = ?user_op_hash, "User operation accepted by bundler");

        let bundler = &self.bundler;
        let outcome = self
            .policy
            .poll(&self.cancel, |attempt| async move {
                match bundler.receipt(user_op_hash).await {
                    Ok(receipt) => receipt,
                    Err(e) => {
                        warn!(attempt, error = %e, "Receipt lookup failed");
                        None
                    }
                }
            })
            .await;

        let report = match outcome {
            PollOutcome::Ready(receipt) => {
                let stage = lifecycle.settle(Some(receipt.success))?;
                let summary = receipt.receipt;
                SubmissionReport {
                    success: receipt.success,
                    user_op_hash,
                    transaction_hash: summary.as_ref().map(|r| r.transaction_hash),
                    block_number: summary.and_then(|r| r.block_number),
                    status: if stage == Stage::Confirmed {
                        TxStatus::Confirmed
                    } else {
                        TxStatus::Failed
                    },
                }
            }
            PollOutcome::Exhausted | PollOutcome::Cancelled => {
                lifecycle.settle(None)?;
                debug!(user_op_hash = ?user_op_hash, "No receipt within budget");
                SubmissionReport {
                    success: true,
                    user_op_hash,
                    transaction_hash: None,
                    block_number: None,
                    status: TxStatus::Pending,
                }
            }
        };

        info!(
            user_op_hash = ?user_op_hash,
            status = ?report.status,
            tx_hash = ?report.transaction_hash,
            "User operation settled"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use ethers::types::U64;
    use serde_json::json;

    use crate::bundler::tests::{MockBundler, TX_HASH, USER_OP_HASH};
    use crate::user_op::{ENTRY_POINT_V06, ENTRY_POINT_V07};

    fn signed_v06() -> UserOperation {
        serde_json::from_value(json!({
            "sender": "0x1111111111111111111111111111111111111111",
            "nonce": "1",
            "initCode": "0x",
            "callData": "0x",
            "callGasLimit": "150000",
            "verificationGasLimit": "500000",
            "preVerificationGas": "80000",
            "maxFeePerGas": "100",
            "maxPriorityFeePerGas": "10",
            "paymasterAndData": "0x",
            "signature": "0xabcd"
        }))
        .unwrap()
    }

    fn signed_v07() -> UserOperation {
        serde_json::from_value(json!({
            "sender": "0x1111111111111111111111111111111111111111",
            "nonce": "0x1",
            "callData": "0x",
            "signature": "0xabcd"
        }))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_on_fifth_poll() {
        let mut bundler = MockBundler::new();
        bundler.receipt_on_poll = Some(5);
        let bundler = Arc::new(bundler);
        let submitter = OperationSubmitter::new(bundler.clone(), CancellationToken::new());

        let report = submitter.submit(signed_v06()).await.unwrap();

        assert_eq!(report.status, TxStatus::Confirmed);
        assert!(report.success);
        assert_eq!(report.user_op_hash, USER_OP_HASH);
        assert_eq!(report.transaction_hash, Some(TX_HASH));
        assert_eq!(report.block_number, Some(U64::from(1234)));
        assert_eq!(bundler.polls.load(Ordering::SeqCst), 5);

        let times = bundler.poll_times.lock().unwrap();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_receipt_is_pending_after_thirty_polls() {
        let mut bundler = MockBundler::new();
        bundler.receipt_on_poll = None;
        let bundler = Arc::new(bundler);
        let submitter = OperationSubmitter::new(bundler.clone(), CancellationToken::new());

        let report = submitter.submit(signed_v07()).await.unwrap();

        assert_eq!(report.status, TxStatus::Pending);
        assert!(report.success);
        assert!(report.transaction_hash.is_none());
        assert_eq!(bundler.polls.load(Ordering::SeqCst), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_receipt_reports_failed() {
        let mut bundler = MockBundler::new();
        bundler.receipt_success = false;
        let submitter = OperationSubmitter::new(Arc::new(bundler), CancellationToken::new());

        let report = submitter.submit(signed_v06()).await.unwrap();

        assert_eq!(report.status, TxStatus::Failed);
        assert!(!report.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_skips_polling() {
        let mut bundler = MockBundler::new();
        bundler.reject_send = Some("AA25 invalid account nonce".to_string());
        let bundler = Arc::new(bundler);
        let submitter = OperationSubmitter::new(bundler.clone(), CancellationToken::new());

        let result = submitter.submit(signed_v06()).await;

        assert!(matches!(
            result,
            Err(FacilitatorError::BundlerRejected(m)) if m == "AA25 invalid account nonce"
        ));
        assert_eq!(bundler.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_reports_pending() {
        let mut bundler = MockBundler::new();
        bundler.receipt_on_poll = None;
        let bundler = Arc::new(bundler);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let submitter = OperationSubmitter::new(bundler.clone(), cancel);

        let report = submitter.submit(signed_v06()).await.unwrap();

        assert_eq!(report.status, TxStatus::Pending);
        assert_eq!(bundler.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_each_version_to_its_entry_point() {
        let bundler = Arc::new(MockBundler::new());
        let submitter = OperationSubmitter::new(bundler.clone(), CancellationToken::new());

        submitter.submit(signed_v06()).await.unwrap();
        submitter.submit(signed_v07()).await.unwrap();

        let sent = bundler.sent.lock().unwrap();
        assert_eq!(sent[0].0, ENTRY_POINT_V06);
        assert_eq!(sent[0].1["paymasterAndData"], "0x");
        assert_eq!(sent[1].0, ENTRY_POINT_V07);
        assert!(sent[1].1["paymaster"].is_null());
        assert_eq!(sent[1].1["callGasLimit"], "0x0");
    }

    #[tokio::test]
    async fn test_unsigned_operation_is_refused() {
        let bundler = Arc::new(MockBundler::new());
        let submitter = OperationSubmitter::new(bundler.clone(), CancellationToken::new());
        let mut operation = signed_v07();
        if let UserOperation::V07(op) = &mut operation {
            op.signature = None;
        }

        assert!(matches!(
            submitter.submit(operation).await,
            Err(FacilitatorError::BadRequest(_))
        ));
        assert!(bundler.sent.lock().unwrap().is_empty());
    }
}
