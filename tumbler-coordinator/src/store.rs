//! The `Store` capability (§6 EXTERNAL INTERFACES). MixCoordinator persists
//! the `MixRequest` aggregate through this trait only; concrete storage
//! engines (the demo adapter in the node binary uses `sled`) live outside
//! this crate, same boundary shape as `BlockchainClient`.

use async_trait::async_trait;

use crate::error::StoreError;
use tumbler_types::{MixId, MixRequest, SessionToken};

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a brand-new `MixRequest`. Must fail with
    /// `StoreError::AddressConflict` if `deposit_address` is already in use
    /// by any request ever created (§8: "deposit_address is unique across
    /// all MixRequests ever created").
    async fn insert_mix_request(&self, req: &MixRequest) -> Result<(), StoreError>;

    /// Persists a mutation to an existing request (status transitions,
    /// payout bookkeeping, confirmation counts).
    async fn save_mix_request(&self, req: &MixRequest) -> Result<(), StoreError>;

    async fn get_mix_request(&self, id: MixId) -> Result<Option<MixRequest>, StoreError>;

    async fn get_mix_request_by_token(&self, token: SessionToken) -> Result<Option<MixRequest>, StoreError>;

    async fn deposit_address_in_use(&self, currency: tumbler_types::Currency, address: &str) -> Result<bool, StoreError>;
}
