//! FeeCalculator (§2 component I): per-currency dynamic fee times the
//! anonymity-level multiplier. §8 scenario S1 fixes the base rate at 1.5%.

use tumbler_config::AnonymityConfig;
use tumbler_types::{Amount, AnonymityLevel};

/// Base mixing fee, in basis points of `input_amount`, before the
/// anonymity-level multiplier is applied.
const BASE_FEE_BASIS_POINTS: u32 = 150; // 1.5%

pub struct FeeCalculator<'a> {
    anonymity: &'a AnonymityConfig,
}

impl<'a> FeeCalculator<'a> {
    pub fn new(anonymity: &'a AnonymityConfig) -> Self {
        FeeCalculator { anonymity }
    }

    /// `fee = input_amount * 1.5% * fee_multiplier[level]`, computed in
    /// integer minor units throughout -- the multiplier is rational
    /// (tenths), so we fold it into a basis-point numerator/denominator
    /// rather than ever touching a float on the amount path.
    pub fn compute_fee(&self, input_amount: Amount, level: AnonymityLevel) -> Amount {
        let tier = self.anonymity.tier(level);
        // fee_multiplier is specified to one decimal place (1.0, 1.2, 1.5);
        // represent it exactly as tenths to stay in integer arithmetic.
        let multiplier_tenths = (tier.fee_multiplier * 10.0).round() as u128;
        let minor = input_amount.minor_units();
        let fee_minor = minor
            .checked_mul(BASE_FEE_BASIS_POINTS as u128)
            .and_then(|v| v.checked_mul(multiplier_tenths))
            .and_then(|v| v.checked_div(10_000 * 10))
            .expect("fee computation overflow");
        Amount::from_minor_units(input_amount.currency(), fee_minor)
    }

    pub fn net_amount(&self, input_amount: Amount, level: AnonymityLevel) -> Amount {
        let fee = self.compute_fee(input_amount, level);
        input_amount.checked_sub(&fee).expect("fee must not exceed input amount")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tumbler_types::Currency;

    #[test]
    fn s1_scenario_fee_is_point_nine_percent_of_half_btc() {
        let anonymity = AnonymityConfig::default();
        let calc = FeeCalculator::new(&anonymity);
        let input = Amount::from_decimal_string(Currency::Btc, "0.5").unwrap();
        let fee = calc.compute_fee(input, AnonymityLevel::Medium);
        // 0.5 * 1.5% * 1.2 = 0.009
        assert_eq!(fee.to_decimal_string(), "0.00900000");
        let net = calc.net_amount(input, AnonymityLevel::Medium);
        assert_eq!(net.to_decimal_string(), "0.49100000");
    }

    #[test]
    fn s2_scenario_fee_is_one_point_five_percent_of_one_eth() {
        let anonymity = AnonymityConfig::default();
        let calc = FeeCalculator::new(&anonymity);
        let input = Amount::from_decimal_string(Currency::Eth, "1.0").unwrap();
        let net = calc.net_amount(input, AnonymityLevel::Low);
        assert_eq!(net.to_decimal_string(), "0.985000000000000000");
    }
}
