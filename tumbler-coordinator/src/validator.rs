//! Validator (§2 component H): per-currency address/amount validation and
//! output-split constraints, applied before any deposit key or Store write.

use tumbler_config::CurrencyConfig;
use tumbler_types::{validate_outputs, Amount, Currency, OutputSplit, OutputSplitError};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error(transparent)]
    Outputs(#[from] OutputSplitError),
    #[error("amount {amount} outside allowed range [{min}, {max}] for {currency}")]
    AmountOutOfRange { currency: Currency, amount: u128, min: u128, max: u128 },
}

pub struct Validator;

impl Validator {
    /// Validates the create-mix request shape (§4.5 create flow, step 1):
    /// amount range first (cheap), then the output-split invariant.
    pub fn validate_create(
        currency: Currency,
        input_amount: Amount,
        outputs: &[OutputSplit],
        currency_config: &CurrencyConfig,
    ) -> Result<(), ValidationError> {
        let min = Amount::from_decimal_string(currency, &currency_config.min_amount)
            .expect("config min_amount already validated at load time");
        let max = Amount::from_decimal_string(currency, &currency_config.max_amount)
            .expect("config max_amount already validated at load time");
        if input_amount < min || input_amount > max {
            return Err(ValidationError::AmountOutOfRange {
                currency,
                amount: input_amount.minor_units(),
                min: min.minor_units(),
                max: max.minor_units(),
            });
        }
        validate_outputs(outputs, currency)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CurrencyConfig {
        CurrencyConfig {
            min_amount: "0.001".into(),
            max_amount: "10".into(),
            required_confirmations: 6,
            min_pool_size: "1".into(),
            max_pool_size: "100".into(),
            target_pool_size: "50".into(),
            poll_interval_ms: 15_000,
            address_format_rules: vec![],
            underpayment_tolerance: String::new(),
        }
    }

    #[test]
    fn rejects_amount_below_minimum() {
        let outputs = vec![OutputSplit { address: "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".into(), basis_points: 10_000 }];
        let amount = Amount::from_decimal_string(Currency::Btc, "0.0001").unwrap();
        let err = Validator::validate_create(Currency::Btc, amount, &outputs, &config()).unwrap_err();
        assert!(matches!(err, ValidationError::AmountOutOfRange { .. }));
    }

    #[test]
    fn s3_scenario_rejects_bad_basis_point_sum() {
        let outputs = vec![
            OutputSplit { address: "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".into(), basis_points: 6000 },
            OutputSplit { address: "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2".into(), basis_points: 3000 },
        ];
        let amount = Amount::from_decimal_string(Currency::Btc, "0.5").unwrap();
        let err = Validator::validate_create(Currency::Btc, amount, &outputs, &config()).unwrap_err();
        assert!(matches!(err, ValidationError::Outputs(OutputSplitError::BasisPointsDoNotSumTo10000(9000))));
    }
}
