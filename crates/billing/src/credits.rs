//! Credit ledger
//!
//! Balance changes are append-only `credit_transactions` rows; the cached
//! balance in `user_credits` moves in the same atomic step and never goes negative.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use whatsflow_shared::{Clock, CreditTransaction, CreditTransactionType};

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::store::{CreditEntry, LedgerStore};

/// Result of applying credits against an overage charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverageChargeResult {
    pub success: bool,
    pub paid_from_credits: i64,
    /// Uncovered amount left for external billing
    pub remaining_charge: i64,
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    events: BillingEventLogger,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        let events = BillingEventLogger::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            events,
        }
    }

    pub async fn balance(&self, user_id: Uuid) -> BillingResult<i64> {
        self.store.credit_balance(user_id).await
    }

    pub async fn history(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<CreditTransaction>> {
        self.store.list_credit_transactions(user_id, limit).await
    }

    /// Grant credits. `amount` must be positive.
    pub async fn add_credits(
        &self,
        user_id: Uuid,
        amount: i64,
        transaction_type: CreditTransactionType,
        description: &str,
        reference_id: Option<Uuid>,
    ) -> BillingResult<CreditTransaction> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(
                "credit amount must be positive".to_string(),
            ));
        }

        let entry = CreditEntry {
            user_id,
            amount,
            transaction_type,
            description: description.to_string(),
            reference_id,
            created_at: self.clock.now(),
        };
        let txn = self.store.apply_credit(&entry).await?.ok_or_else(|| {
            BillingError::Database("credit ledger refused a positive entry".to_string())
        })?;

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            balance = txn.balance_after,
            "Credits added"
        );
        self.events
            .record(
                BillingEventBuilder::new(user_id, BillingEventType::CreditsAdded).data(
                    serde_json::json!({
                        "amount": amount,
                        "type": transaction_type,
                        "balance_after": txn.balance_after,
                    }),
                ),
            )
            .await;

        Ok(txn)
    }

    /// Deduct credits. Returns `false` without any mutation when the balance is too low.
    pub async fn deduct_credits(
        &self,
        user_id: Uuid,
        amount: i64,
        description: &str,
        reference_id: Option<Uuid>,
    ) -> BillingResult<bool> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(
                "deduction amount must be positive".to_string(),
            ));
        }

        let entry = CreditEntry {
            user_id,
            amount: -amount,
            transaction_type: CreditTransactionType::Usage,
            description: description.to_string(),
            reference_id,
            created_at: self.clock.now(),
        };

        match self.store.apply_credit(&entry).await? {
            Some(txn) => {
                tracing::info!(
                    user_id = %user_id,
                    amount = amount,
                    balance = txn.balance_after,
                    "Credits deducted"
                );
                Ok(true)
            }
            None => {
                tracing::debug!(user_id = %user_id, amount = amount, "Insufficient credits");
                Ok(false)
            }
        }
    }

    /// Apply available credits to an overage charge before it is billed externally
    pub async fn process_overage_charges(
        &self,
        user_id: Uuid,
        amount: i64,
        reference_id: Option<Uuid>,
    ) -> BillingResult<OverageChargeResult> {
        if amount <= 0 {
            return Ok(OverageChargeResult {
                success: true,
                paid_from_credits: 0,
                remaining_charge: 0,
            });
        }

        // A concurrent deduction can shrink the balance between the read and the
        // deduction; the ledger refuses then and we re-read.
        for _ in 0..3 {
            let balance = self.balance(user_id).await?;
            if balance <= 0 {
                return Ok(OverageChargeResult {
                    success: false,
                    paid_from_credits: 0,
                    remaining_charge: amount,
                });
            }

            let applied = balance.min(amount);
            if self
                .deduct_credits(user_id, applied, "Applied to overage charges", reference_id)
                .await?
            {
                let remaining = amount - applied;
                self.events
                    .record(
                        BillingEventBuilder::new(user_id, BillingEventType::CreditApplied).data(
                            serde_json::json!({
                                "charge": amount,
                                "paid_from_credits": applied,
                                "remaining_charge": remaining,
                            }),
                        ),
                    )
                    .await;
                return Ok(OverageChargeResult {
                    success: remaining == 0,
                    paid_from_credits: applied,
                    remaining_charge: remaining,
                });
            }
        }

        Ok(OverageChargeResult {
            success: false,
            paid_from_credits: 0,
            remaining_charge: amount,
        })
    }
}
