//! The PKCS#11 HSM backend boundary. Like `BlockchainClient` and `Store`,
//! the concrete HSM binding is an external capability (§1 Out of scope):
//! this crate defines the trait a PKCS#11 driver must implement and ships
//! no device binding. Production deployments inject a real implementation
//! (e.g. wrapping a `cryptoki` session) at construction time.

use crate::algorithm::KeyAlgorithm;
use crate::error::KeyCustodyError;
use tumbler_types::KeyRef;

pub trait HsmBackend: Send + Sync {
    /// Generate a key inside the device; the private key never leaves it.
    fn generate_key(&self, algorithm: KeyAlgorithm) -> Result<KeyRef, KeyCustodyError>;
    fn public_key(&self, key_ref: KeyRef) -> Result<Vec<u8>, KeyCustodyError>;
    fn sign(&self, key_ref: KeyRef, digest: &[u8]) -> Result<Vec<u8>, KeyCustodyError>;
    fn wipe(&self, key_ref: KeyRef) -> Result<(), KeyCustodyError>;
}
