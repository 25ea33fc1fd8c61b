//! Transfer validation and split construction.
//!
//! A charge for the full cart amount is split into 0..N transfers to
//! connected payout accounts. Amounts are positionally paired with the
//! configured destination list; everything here is pure and performs no
//! I/O, so a validation failure can never leave a partial charge behind.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One split entry: how many cents go to which connected account.
/// Serialized into payment-intent metadata (`splits_json`) with these
/// exact field names so reconciliation can recover the plan later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSpec {
    pub destination_account: String,
    pub amount: i64,
}

/// A validated split plan: the paired transfer list plus its sum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitPlan {
    pub transfers: Vec<TransferSpec>,
    pub total_transfer_amount: i64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SplitError {
    #[error("transferAmounts must be an array of non-negative integers (cents)")]
    NegativeAmount,

    #[error("destination accounts not configured")]
    NoDestinations,

    #[error("transferAmounts length ({given}) must match number of destination accounts ({configured})")]
    LengthMismatch { given: usize, configured: usize },

    #[error("sum of transferAmounts ({transfer_total}) cannot exceed total amount ({charge_total})")]
    ExceedsTotal {
        transfer_total: i64,
        charge_total: i64,
    },
}

/// Builds a split plan from the requested per-destination amounts and the
/// configured destination account list.
///
/// Absent or empty amounts are a valid zero-transfer plan regardless of
/// configuration. Otherwise every amount must be non-negative, the
/// destination list must be non-empty, and both lists must have the same
/// length. The `sum <= charge total` check is the caller's
/// ([`SplitPlan::ensure_within_total`]), after construction succeeds.
pub fn build_split_plan(
    transfer_amounts: Option<&[i64]>,
    destinations: &[String],
) -> Result<SplitPlan, SplitError> {
    let Some(amounts) = transfer_amounts.filter(|a| !a.is_empty()) else {
        return Ok(SplitPlan::default());
    };

    if amounts.iter().any(|&a| a < 0) {
        return Err(SplitError::NegativeAmount);
    }
    if destinations.is_empty() {
        return Err(SplitError::NoDestinations);
    }
    if amounts.len() != destinations.len() {
        return Err(SplitError::LengthMismatch {
            given: amounts.len(),
            configured: destinations.len(),
        });
    }

    let transfers = destinations
        .iter()
        .zip(amounts)
        .map(|(destination, &amount)| TransferSpec {
            destination_account: destination.clone(),
            amount,
        })
        .collect();

    Ok(SplitPlan {
        transfers,
        total_transfer_amount: amounts.iter().sum(),
    })
}

impl SplitPlan {
    pub fn ensure_within_total(&self, charge_total: i64) -> Result<(), SplitError> {
        if self.total_transfer_amount > charge_total {
            return Err(SplitError::ExceedsTotal {
                transfer_total: self.total_transfer_amount,
                charge_total,
            });
        }
        Ok(())
    }

    /// Rebuilds a plan from transfer specs recovered out-of-band (webhook
    /// metadata), recomputing the sum.
    pub fn from_transfers(transfers: Vec<TransferSpec>) -> Self {
        let total_transfer_amount = transfers.iter().map(|t| t.amount).sum();
        Self {
            transfers,
            total_transfer_amount,
        }
    }
}

/// Deterministic idempotency key for one transfer: the same charge and
/// position always derive the same key, so a replayed request can never
/// double-transfer.
pub fn transfer_idempotency_key(payment_intent_id: &str, index: usize) -> String {
    format!("tr_{payment_intent_id}_{index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destinations(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("acct_{i}")).collect()
    }

    #[test]
    fn absent_amounts_build_a_zero_transfer_plan() {
        let plan = build_split_plan(None, &destinations(2)).unwrap();
        assert!(plan.transfers.is_empty());
        assert_eq!(plan.total_transfer_amount, 0);

        // Empty destinations are fine too when there is nothing to split.
        let plan = build_split_plan(Some(&[]), &[]).unwrap();
        assert!(plan.transfers.is_empty());
    }

    #[test]
    fn negative_amounts_are_rejected() {
        let err = build_split_plan(Some(&[100, -1]), &destinations(2)).unwrap_err();
        assert_eq!(err, SplitError::NegativeAmount);
    }

    #[test]
    fn missing_destination_configuration_is_rejected() {
        let err = build_split_plan(Some(&[100]), &[]).unwrap_err();
        assert_eq!(err, SplitError::NoDestinations);
    }

    #[test]
    fn length_mismatch_names_both_counts() {
        let err = build_split_plan(Some(&[100, 200]), &destinations(1)).unwrap_err();
        assert_eq!(
            err,
            SplitError::LengthMismatch {
                given: 2,
                configured: 1
            }
        );
        let message = err.to_string();
        assert!(message.contains('2'), "missing given count: {message}");
        assert!(message.contains('1'), "missing configured count: {message}");
    }

    #[test]
    fn amounts_pair_positionally_with_destinations() {
        let plan = build_split_plan(Some(&[100, 0, 150]), &destinations(3)).unwrap();
        assert_eq!(plan.total_transfer_amount, 250);
        assert_eq!(plan.transfers[0].destination_account, "acct_0");
        assert_eq!(plan.transfers[0].amount, 100);
        assert_eq!(plan.transfers[1].amount, 0);
        assert_eq!(plan.transfers[2].destination_account, "acct_2");
        assert_eq!(plan.transfers[2].amount, 150);
    }

    #[test]
    fn transfer_sum_may_not_exceed_charge_total() {
        let plan = build_split_plan(Some(&[100, 150]), &destinations(2)).unwrap();
        assert!(plan.ensure_within_total(250).is_ok());
        let err = plan.ensure_within_total(249).unwrap_err();
        assert_eq!(
            err,
            SplitError::ExceedsTotal {
                transfer_total: 250,
                charge_total: 249
            }
        );
    }

    #[test]
    fn idempotency_keys_are_deterministic_per_charge_and_position() {
        assert_eq!(transfer_idempotency_key("pi_123", 0), "tr_pi_123_0");
        assert_eq!(
            transfer_idempotency_key("pi_123", 0),
            transfer_idempotency_key("pi_123", 0)
        );
        assert_ne!(
            transfer_idempotency_key("pi_123", 0),
            transfer_idempotency_key("pi_123", 1)
        );
    }

    #[test]
    fn splits_serialize_with_wire_field_names() {
        let spec = TransferSpec {
            destination_account: "acct_a".into(),
            amount: 100,
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["destination_account"], "acct_a");
        assert_eq!(value["amount"], 100);
    }
}
