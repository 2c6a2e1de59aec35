//! The root aggregate: a single user-facing mixing request and its state
//! machine (§3 DATA MODEL, §4.5 MixCoordinator).

use crate::amount::Amount;
use crate::currency::Currency;
use crate::ids::{KeyRef, MixId, SessionToken};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnonymityLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    PoolMix,
    CoinJoin,
}

/// One `{address, basis_points}` leg of a mix's payout split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSplit {
    pub address: String,
    pub basis_points: u16,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutputSplitError {
    #[error("must have at least 1 and at most 10 outputs, got {0}")]
    CountOutOfRange(usize),
    #[error("basis points must sum to exactly 10000, got {0}")]
    BasisPointsDoNotSumTo10000(u32),
    #[error("duplicate output address: {0}")]
    DuplicateAddress(String),
    #[error("output address failed currency format validation: {0}")]
    InvalidAddress(String),
    #[error("basis_points must be nonzero")]
    ZeroBasisPoints,
}

/// Validate the `outputs` invariant from §3: 1..=10 entries, basis points
/// summing to exactly 10000, distinct addresses, each address valid for
/// `currency`.
pub fn validate_outputs(outputs: &[OutputSplit], currency: Currency) -> Result<(), OutputSplitError> {
    if outputs.is_empty() || outputs.len() > 10 {
        return Err(OutputSplitError::CountOutOfRange(outputs.len()));
    }
    let mut seen = std::collections::HashSet::with_capacity(outputs.len());
    let mut total: u32 = 0;
    for out in outputs {
        if out.basis_points == 0 {
            return Err(OutputSplitError::ZeroBasisPoints);
        }
        if !seen.insert(out.address.as_str()) {
            return Err(OutputSplitError::DuplicateAddress(out.address.clone()));
        }
        if !currency.address_looks_valid(&out.address) {
            return Err(OutputSplitError::InvalidAddress(out.address.clone()));
        }
        total += out.basis_points as u32;
    }
    if total != 10_000 {
        return Err(OutputSplitError::BasisPointsDoNotSumTo10000(total));
    }
    Ok(())
}

/// States from §4.5. Terminal states are `Completed`, `Expired`, `Cancelled`,
/// `Failed` — monotonicity means a `MixRequest` never transitions out of one
/// of these once entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixStatus {
    PendingDeposit,
    DepositReceived,
    Pooling,
    Mixing,
    PayingOut,
    Completed,
    Expired,
    Cancelled,
    Failed,
}

impl MixStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MixStatus::Completed | MixStatus::Expired | MixStatus::Cancelled | MixStatus::Failed
        )
    }

    /// Whether a user-initiated cancel is permitted from this state (§4.5,
    /// §8 scenario S4).
    pub fn cancellable(self) -> bool {
        matches!(self, MixStatus::PendingDeposit | MixStatus::DepositReceived)
    }

    /// Validates one edge of the state diagram in §4.5. Expiry and fatal
    /// error are reachable from any non-terminal state; everything else
    /// follows the documented happy-path edges.
    pub fn can_transition_to(self, next: MixStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            MixStatus::Expired | MixStatus::Failed => true,
            MixStatus::Cancelled => self.cancellable(),
            MixStatus::DepositReceived => self == MixStatus::PendingDeposit,
            MixStatus::Pooling => self == MixStatus::DepositReceived,
            MixStatus::Mixing => self == MixStatus::Pooling,
            MixStatus::PayingOut => self == MixStatus::Mixing,
            MixStatus::Completed => self == MixStatus::PayingOut,
            MixStatus::PendingDeposit => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal state transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: MixStatus,
    pub to: MixStatus,
}

/// One output's payout bookkeeping, tracked against `outputs[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutLeg {
    pub output_index: usize,
    pub amount: Amount,
    pub scheduled_operation: Option<crate::ids::OperationId>,
    pub tx_hash: Option<String>,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixRequest {
    pub id: MixId,
    pub session_token: SessionToken,
    pub currency: Currency,
    pub input_amount: Amount,
    pub fee_amount: Amount,
    pub net_amount: Amount,
    pub anonymity_level: AnonymityLevel,
    pub algorithm: Algorithm,
    pub deposit_address: String,
    pub deposit_key_ref: Option<KeyRef>,
    pub outputs: Vec<OutputSplit>,
    pub delay_minutes: u32,
    pub created_at_unix: u64,
    pub expires_at_unix: u64,
    pub status: MixStatus,
    pub confirmations_seen: u32,
    pub confirmations_required: u32,
    pub payouts: Vec<PayoutLeg>,
}

impl MixRequest {
    /// Apply a state transition, enforcing monotonicity (§8: "a MixRequest's
    /// status never transitions from a terminal state").
    pub fn transition(&mut self, next: MixStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn sum_basis_points(&self) -> u32 {
        self.outputs.iter().map(|o| o.basis_points as u32).sum()
    }

    /// Split `self.net_amount` across `self.outputs` by basis points,
    /// assigning any integer-division remainder to the last output (§4.5).
    pub fn split_net_amount(&self) -> Vec<Amount> {
        if self.outputs.is_empty() {
            return Vec::new();
        }
        let mut amounts: Vec<Amount> = self
            .outputs
            .iter()
            .map(|o| {
                self.net_amount
                    .checked_mul_basis_points(o.basis_points)
                    .expect("basis point split does not overflow")
            })
            .collect();
        let allocated = amounts
            .iter()
            .take(amounts.len() - 1)
            .fold(Amount::zero(self.currency), |acc, a| {
                acc.checked_add(a).expect("sum of payout legs does not overflow")
            });
        let last = self
            .net_amount
            .checked_sub(&allocated)
            .expect("remainder assignment to last output cannot underflow");
        *amounts.last_mut().unwrap() = last;
        amounts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_outputs(splits: &[(u16, &str)]) -> Vec<OutputSplit> {
        splits
            .iter()
            .map(|(bp, addr)| OutputSplit {
                address: addr.to_string(),
                basis_points: *bp,
            })
            .collect()
    }

    #[test]
    fn rejects_split_not_summing_to_10000() {
        let outputs = sample_outputs(&[
            (6000, "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"),
            (3000, "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2"),
        ]);
        let err = validate_outputs(&outputs, Currency::Btc).unwrap_err();
        assert_eq!(err, OutputSplitError::BasisPointsDoNotSumTo10000(9000));
    }

    #[test]
    fn rejects_duplicate_addresses() {
        let addr = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
        let outputs = sample_outputs(&[(5000, addr), (5000, addr)]);
        assert_eq!(
            validate_outputs(&outputs, Currency::Btc).unwrap_err(),
            OutputSplitError::DuplicateAddress(addr.to_string())
        );
    }

    #[test]
    fn monotonic_status_never_leaves_terminal() {
        assert!(!MixStatus::Completed.can_transition_to(MixStatus::Pooling));
        assert!(!MixStatus::Failed.can_transition_to(MixStatus::PendingDeposit));
    }

    #[test]
    fn cancel_only_allowed_before_pooling() {
        assert!(MixStatus::PendingDeposit.can_transition_to(MixStatus::Cancelled));
        assert!(MixStatus::DepositReceived.can_transition_to(MixStatus::Cancelled));
        assert!(!MixStatus::Pooling.can_transition_to(MixStatus::Cancelled));
    }

    #[test]
    fn split_70_30_matches_s2_scenario() {
        let req = MixRequest {
            id: MixId::random(),
            session_token: SessionToken::random(),
            currency: Currency::Eth,
            input_amount: Amount::from_decimal_string(Currency::Eth, "1.0").unwrap(),
            fee_amount: Amount::from_decimal_string(Currency::Eth, "0.015").unwrap(),
            net_amount: Amount::from_decimal_string(Currency::Eth, "0.985").unwrap(),
            anonymity_level: AnonymityLevel::Low,
            algorithm: Algorithm::PoolMix,
            deposit_address: "0x0000000000000000000000000000000000dEaD".into(),
            deposit_key_ref: None,
            outputs: sample_outputs(&[
                (7000, "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"),
                (3000, "0x1111111111111111111111111111111111111c"),
            ]),
            delay_minutes: 60,
            created_at_unix: 0,
            expires_at_unix: 86_400,
            status: MixStatus::Pooling,
            confirmations_seen: 0,
            confirmations_required: 30,
            payouts: Vec::new(),
        };
        let legs = req.split_net_amount();
        assert_eq!(legs[0].to_decimal_string(), "0.689500000000000000");
        assert_eq!(legs[1].to_decimal_string(), "0.295500000000000000");
        let total = legs[0].checked_add(&legs[1]).unwrap();
        assert_eq!(total, req.net_amount);
    }
}
