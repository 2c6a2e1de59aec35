//! Sled-backed `Store` adapter (§6 EXTERNAL INTERFACES). Mirrors the
//! teacher's `SledBlockchainState`: one `sled::Tree` per logical table, keyed
//! by the opaque id's raw bytes, values bincode-serialized.

use std::sync::Mutex;

use async_trait::async_trait;
use sled::Db;

use tumbler_coordinator::{Store, StoreError};
use tumbler_types::{Currency, MixId, MixRequest, SessionToken};

const TREE_REQUESTS: &str = "mix_requests";
const TREE_TOKEN_INDEX: &str = "mix_requests_by_token";
const TREE_ADDRESS_INDEX: &str = "deposit_addresses";

pub struct SledStore {
    requests: sled::Tree,
    token_index: sled::Tree,
    address_index: sled::Tree,
    // Guards the three-tree write below from concurrent insert_mix_request
    // races; sled itself has no cross-tree transaction primitive we use here.
    write_lock: Mutex<()>,
}

impl SledStore {
    pub fn open(db: &Db) -> Result<Self, StoreError> {
        Ok(SledStore {
            requests: db.open_tree(TREE_REQUESTS).map_err(|e| StoreError::Backend(e.to_string()))?,
            token_index: db.open_tree(TREE_TOKEN_INDEX).map_err(|e| StoreError::Backend(e.to_string()))?,
            address_index: db.open_tree(TREE_ADDRESS_INDEX).map_err(|e| StoreError::Backend(e.to_string()))?,
            write_lock: Mutex::new(()),
        })
    }

    fn address_key(currency: Currency, address: &str) -> Vec<u8> {
        let mut key = currency.to_string().into_bytes();
        key.push(0);
        key.extend_from_slice(address.as_bytes());
        key
    }

    fn get(&self, id: MixId) -> Result<Option<MixRequest>, StoreError> {
        let raw = self.requests.get(id.as_bytes()).map_err(|e| StoreError::Backend(e.to_string()))?;
        raw.map(|bytes| bincode::deserialize(&bytes).map_err(|e| StoreError::Backend(e.to_string())))
            .transpose()
    }
}

#[async_trait]
impl Store for SledStore {
    async fn insert_mix_request(&self, req: &MixRequest) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap();
        let addr_key = Self::address_key(req.currency, &req.deposit_address);
        if self.address_index.contains_key(&addr_key).map_err(|e| StoreError::Backend(e.to_string()))? {
            return Err(StoreError::AddressConflict);
        }
        let bytes = bincode::serialize(req).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.requests.insert(req.id.as_bytes(), bytes).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.token_index
            .insert(req.session_token.as_bytes(), req.id.as_bytes().to_vec())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.address_index.insert(addr_key, req.id.as_bytes().to_vec()).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn save_mix_request(&self, req: &MixRequest) -> Result<(), StoreError> {
        let bytes = bincode::serialize(req).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.requests.insert(req.id.as_bytes(), bytes).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_mix_request(&self, id: MixId) -> Result<Option<MixRequest>, StoreError> {
        self.get(id)
    }

    async fn get_mix_request_by_token(&self, token: SessionToken) -> Result<Option<MixRequest>, StoreError> {
        let id_bytes = self.token_index.get(token.as_bytes()).map_err(|e| StoreError::Backend(e.to_string()))?;
        let Some(id_bytes) = id_bytes else { return Ok(None) };
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&id_bytes);
        self.get(MixId::from_bytes(arr))
    }

    async fn deposit_address_in_use(&self, currency: Currency, address: &str) -> Result<bool, StoreError> {
        let key = Self::address_key(currency, address);
        self.address_index.contains_key(key).map_err(|e| StoreError::Backend(e.to_string()))
    }
}

/// Snapshot of every mix request in a given non-terminal status, used by the
/// housekeeping loop to drive expiry (`Store` itself has no enumeration
/// method in the upstream contract -- this lives on the concrete adapter,
/// same boundary shape as the teacher's `get_last_n_headers` helper that
/// isn't part of `BlockchainState` either).
pub fn expirable_snapshot(store: &SledStore) -> Result<Vec<MixRequest>, StoreError> {
    let mut out = Vec::new();
    for item in store.requests.iter() {
        let (_, bytes) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
        let req: MixRequest = bincode::deserialize(&bytes).map_err(|e| StoreError::Backend(e.to_string()))?;
        if !req.status.is_terminal() {
            out.push(req);
        }
    }
    Ok(out)
}
