//! DepositObservation — the event ConfirmationMonitor raises the first time
//! it sees a qualifying inbound transaction on a watched deposit address.

use crate::amount::Amount;
use crate::ids::MixId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositObservation {
    pub mix_id: MixId,
    pub tx_hash: String,
    pub observed_amount: Amount,
    pub confirmations: u32,
    pub first_seen_unix: u64,
    pub last_seen_unix: u64,
}

/// Outcome of comparing an observed deposit against the request's expected
/// `input_amount`, per the tolerance policy in §4.5 "Deposit observed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositAcceptance {
    /// Observed amount matches within tolerance (including overpayment,
    /// which is credited in full per the default "credit and mix" policy).
    Accept,
    /// Observed amount is short by more than `underpayment_tolerance`.
    Underpaid,
}

/// Decide whether an observed deposit should be accepted, per currency
/// tolerance policy: exact match for UTXO chains, `underpayment_tolerance`
/// for account chains, overpayment always credited.
pub fn evaluate_deposit(
    expected: Amount,
    observed: Amount,
    underpayment_tolerance_minor_units: u128,
) -> DepositAcceptance {
    debug_assert_eq!(expected.currency(), observed.currency());
    if observed.minor_units() >= expected.minor_units() {
        return DepositAcceptance::Accept;
    }
    let shortfall = expected.minor_units() - observed.minor_units();
    if shortfall <= underpayment_tolerance_minor_units {
        DepositAcceptance::Accept
    } else {
        DepositAcceptance::Underpaid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;

    #[test]
    fn overpayment_is_always_accepted() {
        let expected = Amount::from_minor_units(Currency::Btc, 100);
        let observed = Amount::from_minor_units(Currency::Btc, 150);
        assert_eq!(evaluate_deposit(expected, observed, 0), DepositAcceptance::Accept);
    }

    #[test]
    fn underpayment_beyond_tolerance_is_rejected() {
        let expected = Amount::from_minor_units(Currency::Eth, 1000);
        let observed = Amount::from_minor_units(Currency::Eth, 900);
        assert_eq!(evaluate_deposit(expected, observed, 50), DepositAcceptance::Underpaid);
        assert_eq!(evaluate_deposit(expected, observed, 100), DepositAcceptance::Accept);
    }
}
