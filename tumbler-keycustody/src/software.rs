//! In-process encrypted keystore backend (§4.1). Private key material is
//! generated from a CSPRNG, validated, and stored only as
//! `nonce ‖ aead_sealed(ciphertext, tag)` under a per-process data-encryption
//! key (AES-256-GCM, fresh 96-bit nonce per key) — mirroring the
//! Arc<Mutex<HashMap<..>>> shared-state shape the teacher uses throughout
//! `rusty-masternode` (e.g. `pose_coordinator.rs`'s `PoseCoordinator`).

use crate::algorithm::KeyAlgorithm;
use crate::error::KeyCustodyError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use log::{debug, warn};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tumbler_types::KeyRef;
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;

struct StoredKey {
    algorithm: KeyAlgorithm,
    /// `nonce ‖ sealed(ciphertext ‖ tag)` for the 32-byte private scalar.
    sealed_private_key: Vec<u8>,
    public_key: Vec<u8>,
    created_at_unix: u64,
    /// Set once the owning MixRequest reaches a terminal state; only
    /// terminal-safe keys are eligible for LRU eviction or `rotate()`.
    terminal_safe: bool,
    wiped: bool,
}

pub struct SoftwareKeystore {
    cipher: Aes256Gcm,
    keys: Mutex<HashMap<KeyRef, StoredKey>>,
    max_keys_in_memory: usize,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl SoftwareKeystore {
    /// `data_encryption_key` is the 32-byte process-lifetime DEK, provided
    /// at startup and never persisted (§6 persisted state layout).
    pub fn new(data_encryption_key: [u8; 32], max_keys_in_memory: usize) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&data_encryption_key);
        SoftwareKeystore {
            cipher: Aes256Gcm::new(key),
            keys: Mutex::new(HashMap::new()),
            max_keys_in_memory,
        }
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, KeyCustodyError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| KeyCustodyError::CryptoFailure(format!("AES-GCM seal failed: {e}")))?;
        let mut record = Vec::with_capacity(NONCE_LEN + sealed.len());
        record.extend_from_slice(&nonce_bytes);
        record.extend_from_slice(&sealed);
        Ok(record)
    }

    fn open(&self, record: &[u8]) -> Result<Vec<u8>, KeyCustodyError> {
        if record.len() < NONCE_LEN {
            return Err(KeyCustodyError::CryptoFailure("truncated keystore record".into()));
        }
        let (nonce_bytes, sealed) = record.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, sealed)
            .map_err(|e| KeyCustodyError::CryptoFailure(format!("AES-GCM open failed: {e}")))
    }

    pub fn generate_key(&self, algorithm: KeyAlgorithm) -> Result<KeyRef, KeyCustodyError> {
        let (private_bytes, public_bytes) = generate_keypair(algorithm)?;
        let sealed_private_key = self.seal(&private_bytes)?;
        let key_ref = KeyRef::random();

        let mut keys = self.keys.lock().unwrap();
        self.evict_if_needed(&mut keys);
        keys.insert(
            key_ref,
            StoredKey {
                algorithm,
                sealed_private_key,
                public_key: public_bytes,
                created_at_unix: now_unix(),
                terminal_safe: false,
                wiped: false,
            },
        );
        Ok(key_ref)
    }

    /// Mark a key's owning MixRequest terminal, making it eligible for
    /// eviction/rotation. Called by the coordinator alongside its own
    /// terminal-state transition, never inferred by the keystore itself.
    pub fn mark_terminal_safe(&self, key_ref: KeyRef) -> Result<(), KeyCustodyError> {
        let mut keys = self.keys.lock().unwrap();
        let entry = keys.get_mut(&key_ref).ok_or(KeyCustodyError::UnknownKey)?;
        entry.terminal_safe = true;
        Ok(())
    }

    pub fn public_key(&self, key_ref: KeyRef) -> Result<Vec<u8>, KeyCustodyError> {
        let keys = self.keys.lock().unwrap();
        let entry = keys.get(&key_ref).ok_or(KeyCustodyError::UnknownKey)?;
        if entry.wiped {
            return Err(KeyCustodyError::KeyRotated);
        }
        Ok(entry.public_key.clone())
    }

    pub fn sign(&self, key_ref: KeyRef, digest: &[u8]) -> Result<Vec<u8>, KeyCustodyError> {
        let sealed_private_key;
        let algorithm;
        {
            let keys = self.keys.lock().unwrap();
            let entry = keys.get(&key_ref).ok_or(KeyCustodyError::UnknownKey)?;
            if entry.wiped {
                return Err(KeyCustodyError::KeyRotated);
            }
            sealed_private_key = entry.sealed_private_key.clone();
            algorithm = entry.algorithm;
        }
        let private_bytes = self.open(&sealed_private_key)?;
        sign_with_private_key(algorithm, &private_bytes, digest)
    }

    pub fn wipe(&self, key_ref: KeyRef) -> Result<(), KeyCustodyError> {
        let mut keys = self.keys.lock().unwrap();
        match keys.get_mut(&key_ref) {
            Some(entry) => {
                entry.wiped = true;
                entry.sealed_private_key.zeroize();
                debug!("wiped key {key_ref}");
                Ok(())
            }
            None => Err(KeyCustodyError::UnknownKey),
        }
    }

    /// Periodic sweep: wipe any terminal-safe key older than
    /// `rotation_interval_secs` (§4.1 `rotate()`).
    pub fn rotate(&self, rotation_interval_secs: u64) -> Vec<KeyRef> {
        let now = now_unix();
        let mut keys = self.keys.lock().unwrap();
        let mut rotated = Vec::new();
        for (key_ref, entry) in keys.iter_mut() {
            if entry.wiped || !entry.terminal_safe {
                continue;
            }
            if now.saturating_sub(entry.created_at_unix) >= rotation_interval_secs {
                entry.wiped = true;
                entry.sealed_private_key.zeroize();
                rotated.push(*key_ref);
            }
        }
        rotated
    }

    /// Evict the oldest terminal-safe keys until under the in-memory bound.
    /// Active (non-terminal) keys are never eviction candidates — per §4.1,
    /// evicting an active key is a fatal invariant violation, so this
    /// function simply cannot select one.
    fn evict_if_needed(&self, keys: &mut HashMap<KeyRef, StoredKey>) {
        if keys.len() < self.max_keys_in_memory {
            return;
        }
        let mut candidates: Vec<(KeyRef, u64)> = keys
            .iter()
            .filter(|(_, v)| v.terminal_safe && !v.wiped)
            .map(|(k, v)| (*k, v.created_at_unix))
            .collect();
        candidates.sort_by_key(|(_, created)| *created);
        let overflow = keys.len() + 1 - self.max_keys_in_memory;
        for (key_ref, _) in candidates.into_iter().take(overflow) {
            warn!("evicting terminal-safe key {key_ref} under memory pressure");
            keys.remove(&key_ref);
        }
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }
}

fn generate_keypair(algorithm: KeyAlgorithm) -> Result<(Vec<u8>, Vec<u8>), KeyCustodyError> {
    match algorithm {
        KeyAlgorithm::Secp256k1 => {
            let secp = secp256k1::Secp256k1::new();
            let mut rng = rand::thread_rng();
            let (secret_key, public_key) = secp.generate_keypair(&mut rng);
            Ok((
                secret_key.secret_bytes().to_vec(),
                public_key.serialize().to_vec(),
            ))
        }
        KeyAlgorithm::Ed25519 => {
            let signing_key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
            Ok((
                signing_key.to_bytes().to_vec(),
                signing_key.verifying_key().to_bytes().to_vec(),
            ))
        }
    }
}

fn sign_with_private_key(
    algorithm: KeyAlgorithm,
    private_bytes: &[u8],
    digest: &[u8],
) -> Result<Vec<u8>, KeyCustodyError> {
    match algorithm {
        KeyAlgorithm::Secp256k1 => {
            let secp = secp256k1::Secp256k1::signing_only();
            let secret_key = secp256k1::SecretKey::from_slice(private_bytes)
                .map_err(|e| KeyCustodyError::CryptoFailure(e.to_string()))?;
            let message = secp256k1::Message::from_digest_slice(digest)
                .map_err(|e| KeyCustodyError::CryptoFailure(e.to_string()))?;
            let sig = secp.sign_ecdsa(&message, &secret_key);
            Ok(sig.serialize_compact().to_vec())
        }
        KeyAlgorithm::Ed25519 => {
            use ed25519_dalek::Signer;
            let bytes: [u8; 32] = private_bytes
                .try_into()
                .map_err(|_| KeyCustodyError::CryptoFailure("bad ed25519 key length".into()))?;
            let signing_key = ed25519_dalek::SigningKey::from_bytes(&bytes);
            Ok(signing_key.sign(digest).to_bytes().to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keystore() -> SoftwareKeystore {
        SoftwareKeystore::new([7u8; 32], 1000)
    }

    #[test]
    fn generate_sign_and_wipe_round_trip() {
        let ks = keystore();
        let key_ref = ks.generate_key(KeyAlgorithm::Ed25519).unwrap();
        let digest = blake3::hash(b"hello").as_bytes().to_vec();
        let sig = ks.sign(key_ref, &digest).unwrap();
        assert_eq!(sig.len(), 64);

        ks.wipe(key_ref).unwrap();
        assert!(matches!(ks.sign(key_ref, &digest), Err(KeyCustodyError::KeyRotated)));
    }

    #[test]
    fn signing_unknown_key_fails_with_unknown_key() {
        let ks = keystore();
        let digest = vec![0u8; 32];
        assert!(matches!(
            ks.sign(KeyRef::random(), &digest),
            Err(KeyCustodyError::UnknownKey)
        ));
    }

    #[test]
    fn active_keys_survive_eviction_pressure() {
        let ks = SoftwareKeystore::new([1u8; 32], 4);
        let active = ks.generate_key(KeyAlgorithm::Ed25519).unwrap();
        for _ in 0..3 {
            let k = ks.generate_key(KeyAlgorithm::Ed25519).unwrap();
            ks.mark_terminal_safe(k).unwrap();
        }
        // Force one more insert over the cap; only terminal-safe keys may be evicted.
        let k = ks.generate_key(KeyAlgorithm::Ed25519).unwrap();
        ks.mark_terminal_safe(k).unwrap();
        assert!(ks.public_key(active).is_ok());
    }

    #[test]
    fn rotate_only_wipes_terminal_keys_past_interval() {
        let ks = keystore();
        let active = ks.generate_key(KeyAlgorithm::Ed25519).unwrap();
        let terminal = ks.generate_key(KeyAlgorithm::Ed25519).unwrap();
        ks.mark_terminal_safe(terminal).unwrap();

        let rotated = ks.rotate(0);
        assert_eq!(rotated, vec![terminal]);
        assert!(ks.public_key(active).is_ok());
        assert!(matches!(ks.public_key(terminal), Err(KeyCustodyError::KeyRotated)));
    }
}
