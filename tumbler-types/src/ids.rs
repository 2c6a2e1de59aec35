//! Opaque identifiers. `MixId` is the internal handle and is never exposed
//! across the upstream API; `SessionToken` is what the caller holds instead.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($name:ident, $len:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub fn random() -> Self {
                let mut bytes = [0u8; $len];
                rand::thread_rng().fill_bytes(&mut bytes);
                $name(bytes)
            }

            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                $name(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Option<Self> {
                let bytes = hex::decode(s).ok()?;
                if bytes.len() != $len {
                    return None;
                }
                let mut arr = [0u8; $len];
                arr.copy_from_slice(&bytes);
                Some($name(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

/// 128-bit internal identifier for a [`crate::mix_request::MixRequest`].
/// Never returned to the upstream API caller (§4.5 create flow).
opaque_id!(MixId, 16);

/// 256-bit opaque token the caller presents to query or cancel a mix.
/// Generated independently of [`MixId`] so leaking one never leaks the other.
opaque_id!(SessionToken, 32);

/// Handle into [`crate::pool_entry`] reservations.
opaque_id!(ReservationId, 16);

/// Handle returned by `ConfirmationMonitor::watch_address`.
opaque_id!(WatchRef, 16);

/// Handle for a tracked transaction (`ConfirmationMonitor::track_transaction`).
opaque_id!(TrackingId, 16);

/// Handle into [`crate::scheduled_op::ScheduledOperation`].
opaque_id!(OperationId, 16);

/// Opaque handle into KeyCustody's keystore. Never exposed outside KeyCustody
/// and the coordinator that holds it on a `MixRequest`.
opaque_id!(KeyRef, 16);

/// Opaque identifier for a liquidity pool entry.
opaque_id!(PoolEntryId, 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_and_round_trip_hex() {
        let a = MixId::random();
        let b = MixId::random();
        assert_ne!(a, b);
        let hex = a.to_hex();
        assert_eq!(MixId::from_hex(&hex), Some(a));
    }

    #[test]
    fn mix_id_and_session_token_are_independent() {
        // Different widths, different generators -- no derivation between them.
        let id = MixId::random();
        let token = SessionToken::random();
        assert_ne!(id.as_bytes().len(), token.as_bytes().len());
    }
}
