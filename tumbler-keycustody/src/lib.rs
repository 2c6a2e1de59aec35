//! KeyCustody (§4.1): deposit-address key generation and signing, backed by
//! either a PKCS#11 HSM or the in-process encrypted software keystore.

pub mod address;
pub mod algorithm;
pub mod error;
pub mod hsm;
pub mod software;

pub use address::derive_address;
pub use algorithm::KeyAlgorithm;
pub use error::KeyCustodyError;
pub use hsm::HsmBackend;
pub use software::SoftwareKeystore;

use std::sync::Arc;
use tumbler_types::{Currency, KeyRef};

enum Backend {
    Software(Arc<SoftwareKeystore>),
    Hsm(Arc<dyn HsmBackend>),
}

/// The public contract from §4.1, dispatching to whichever backend this
/// deployment was configured with. A deployment picks one backend at
/// startup; there is no per-key backend selection.
pub struct KeyCustody {
    backend: Backend,
}

impl KeyCustody {
    pub fn software(keystore: Arc<SoftwareKeystore>) -> Self {
        KeyCustody {
            backend: Backend::Software(keystore),
        }
    }

    pub fn hsm(backend: Arc<dyn HsmBackend>) -> Self {
        KeyCustody {
            backend: Backend::Hsm(backend),
        }
    }

    pub fn generate_key(&self, algorithm: KeyAlgorithm) -> Result<KeyRef, KeyCustodyError> {
        match &self.backend {
            Backend::Software(ks) => ks.generate_key(algorithm),
            Backend::Hsm(hsm) => hsm.generate_key(algorithm),
        }
    }

    pub fn public_key(&self, key_ref: KeyRef) -> Result<Vec<u8>, KeyCustodyError> {
        match &self.backend {
            Backend::Software(ks) => ks.public_key(key_ref),
            Backend::Hsm(hsm) => hsm.public_key(key_ref),
        }
    }

    pub fn sign(&self, key_ref: KeyRef, digest: &[u8]) -> Result<Vec<u8>, KeyCustodyError> {
        match &self.backend {
            Backend::Software(ks) => ks.sign(key_ref, digest),
            Backend::Hsm(hsm) => hsm.sign(key_ref, digest),
        }
    }

    pub fn derive_address(&self, key_ref: KeyRef, currency: Currency) -> Result<String, KeyCustodyError> {
        let public_key = self.public_key(key_ref)?;
        Ok(address::derive_address(currency, &public_key))
    }

    pub fn wipe(&self, key_ref: KeyRef) -> Result<(), KeyCustodyError> {
        match &self.backend {
            Backend::Software(ks) => ks.wipe(key_ref),
            Backend::Hsm(hsm) => hsm.wipe(key_ref),
        }
    }

    /// Mark a key terminal-safe (eligible for rotation/eviction). No-op on
    /// HSM backends, which manage their own lifecycle on the device.
    pub fn mark_terminal_safe(&self, key_ref: KeyRef) -> Result<(), KeyCustodyError> {
        match &self.backend {
            Backend::Software(ks) => ks.mark_terminal_safe(key_ref),
            Backend::Hsm(_) => Ok(()),
        }
    }

    /// Periodic sweep (§4.1 `rotate()`); a no-op on HSM backends.
    pub fn rotate(&self, rotation_interval_secs: u64) -> Vec<KeyRef> {
        match &self.backend {
            Backend::Software(ks) => ks.rotate(rotation_interval_secs),
            Backend::Hsm(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_backend_generates_address_and_signs() {
        let ks = Arc::new(SoftwareKeystore::new([9u8; 32], 100));
        let custody = KeyCustody::software(ks);
        let key_ref = custody.generate_key(KeyAlgorithm::Secp256k1).unwrap();
        let address = custody.derive_address(key_ref, Currency::Btc).unwrap();
        assert!(Currency::Btc.address_looks_valid(&address));

        let digest = blake3::hash(b"tx").as_bytes().to_vec();
        let sig = custody.sign(key_ref, &digest).unwrap();
        assert!(!sig.is_empty());

        custody.wipe(key_ref).unwrap();
        assert!(custody.public_key(key_ref).is_err());
    }
}
