//! Currency enumeration and per-currency static parameters.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed enumeration of currencies the mixing engine can service.
///
/// `Xmr` needs a different `BlockchainClient` shape than the rest (view-key
/// scanning rather than address watching) but is listed unconditionally
/// here like every other currency; there is no cargo feature gating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Currency {
    Btc,
    Eth,
    Erc20Usdt,
    Ltc,
    Dash,
    Zec,
    Sol,
    Xmr,
}

impl Currency {
    /// All currencies this build was compiled with support for.
    pub fn all() -> &'static [Currency] {
        &[
            Currency::Btc,
            Currency::Eth,
            Currency::Erc20Usdt,
            Currency::Ltc,
            Currency::Dash,
            Currency::Zec,
            Currency::Sol,
            Currency::Xmr,
        ]
    }

    /// Number of decimal places used for this currency's minor-unit amounts.
    pub fn decimals(self) -> u32 {
        match self {
            Currency::Btc | Currency::Ltc | Currency::Dash | Currency::Zec => 8,
            Currency::Eth => 18,
            Currency::Erc20Usdt => 6,
            Currency::Sol => 9,
            Currency::Xmr => 12,
        }
    }

    /// Whether this chain is scanned block-by-block (UTXO-style) or polled
    /// by address balance (account-style). Drives ConfirmationMonitor's
    /// per-currency strategy indirection (§4.2 step 2).
    pub fn scan_strategy(self) -> ScanStrategy {
        match self {
            Currency::Btc | Currency::Ltc | Currency::Dash | Currency::Zec | Currency::Eth => {
                ScanStrategy::BlockScan
            }
            Currency::Erc20Usdt | Currency::Sol | Currency::Xmr => ScanStrategy::BalancePoll,
        }
    }

    /// Default required confirmations before a deposit is considered final.
    pub fn default_required_confirmations(self) -> u32 {
        match self {
            Currency::Btc => 6,
            Currency::Eth | Currency::Erc20Usdt => 30,
            Currency::Ltc => 12,
            Currency::Dash => 15,
            Currency::Zec => 10,
            Currency::Sol => 32,
            Currency::Xmr => 10,
        }
    }

    /// Default participant count a CoinJoin round needs for this currency.
    pub fn default_required_participants(self) -> usize {
        match self {
            Currency::Btc | Currency::Ltc | Currency::Dash | Currency::Zec => 3,
            _ => 0, // account-style chains default to POOL_MIX, not COINJOIN
        }
    }

    /// Denominations (in minor units) eligible for CoinJoin co-spends, per
    /// §4.5's `common_denominations[currency]` lookup. Kept small and
    /// explicit rather than computed — equal-value buckets are a policy
    /// choice, not something derivable from currency parameters.
    pub fn common_denominations(self) -> &'static [u128] {
        match self {
            Currency::Btc => &[1_000_000, 10_000_000, 100_000_000], // 0.01 / 0.1 / 1 BTC
            Currency::Ltc => &[100_000_000, 1_000_000_000],
            Currency::Dash => &[10_000_000, 100_000_000],
            Currency::Zec => &[10_000_000, 100_000_000],
            _ => &[],
        }
    }

    /// Cheap structural validation of an address string for this currency.
    /// This is NOT full checksum validation (that belongs to the
    /// currency-specific `BlockchainClient`), only the format predicate used
    /// by the Validator component (§4, Validator) before a deposit key or
    /// payout is ever attempted against an address.
    pub fn address_looks_valid(self, address: &str) -> bool {
        if address.is_empty() || address.len() > 128 || address.chars().any(char::is_whitespace) {
            return false;
        }
        match self {
            Currency::Btc => {
                (address.starts_with('1') || address.starts_with('3'))
                    && (26..=35).contains(&address.len())
                    || address.to_lowercase().starts_with("bc1") && address.len() >= 14
            }
            Currency::Ltc => {
                (address.starts_with('L') || address.starts_with('M') || address.starts_with('3'))
                    && (26..=35).contains(&address.len())
                    || address.to_lowercase().starts_with("ltc1") && address.len() >= 14
            }
            Currency::Dash => address.starts_with('X') && (26..=35).contains(&address.len()),
            Currency::Zec => {
                (address.starts_with("t1") || address.starts_with("t3"))
                    && (26..=35).contains(&address.len())
                    || address.starts_with("zs") && address.len() > 60
            }
            Currency::Eth | Currency::Erc20Usdt => {
                address.starts_with("0x")
                    && address.len() == 42
                    && address[2..].chars().all(|c| c.is_ascii_hexdigit())
            }
            Currency::Sol => {
                (32..=44).contains(&address.len())
                    && address
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() && c != '0' && c != 'O' && c != 'I' && c != 'l')
            }
            Currency::Xmr => address.len() == 95 && address.starts_with('4'),
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Currency::Btc => "BTC",
            Currency::Eth => "ETH",
            Currency::Erc20Usdt => "ERC20_USDT",
            Currency::Ltc => "LTC",
            Currency::Dash => "DASH",
            Currency::Zec => "ZEC",
            Currency::Sol => "SOL",
            Currency::Xmr => "XMR",
        };
        f.write_str(s)
    }
}

/// Per-currency strategy for turning chain state into deposit observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStrategy {
    /// Iterate block transactions looking for outputs to watched addresses.
    BlockScan,
    /// Poll each watched address's balance directly.
    BalancePoll,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btc_legacy_and_bech32_addresses_validate() {
        assert!(Currency::Btc.address_looks_valid("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"));
        assert!(Currency::Btc.address_looks_valid("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"));
        assert!(!Currency::Btc.address_looks_valid(""));
        assert!(!Currency::Btc.address_looks_valid("not an address"));
    }

    #[test]
    fn eth_requires_hex_checksum_shape() {
        assert!(Currency::Eth.address_looks_valid("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"));
        assert!(!Currency::Eth.address_looks_valid("5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"));
        assert!(!Currency::Eth.address_looks_valid("0xshort"));
    }

    #[test]
    fn decimals_are_currency_native() {
        assert_eq!(Currency::Btc.decimals(), 8);
        assert_eq!(Currency::Eth.decimals(), 18);
        assert_eq!(Currency::Erc20Usdt.decimals(), 6);
    }
}
