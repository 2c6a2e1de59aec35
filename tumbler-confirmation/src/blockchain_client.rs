//! The `BlockchainClient` capability (§6 EXTERNAL INTERFACES). The engine
//! consumes per-currency chain access only through this trait; concrete RPC
//! clients (bitcoind, geth, solana-client, monero-wallet-rpc, ...) are out
//! of scope per §1 and live outside this crate.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum BlockchainClientError {
    #[error("RPC call timed out")]
    Timeout,
    #[error("RPC call failed: {0}")]
    Rpc(String),
    #[error("transaction not found")]
    TransactionNotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainTxStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub address: String,
    pub amount_minor_units: u128,
}

#[derive(Debug, Clone)]
pub struct ChainTransaction {
    pub tx_hash: String,
    pub confirmations: u32,
    pub outputs: Vec<ChainOutput>,
    pub status: ChainTxStatus,
}

#[derive(Debug, Clone)]
pub struct ScannedTx {
    pub tx_hash: String,
    pub outputs: Vec<ChainOutput>,
}

/// One signing input reference plus the chain-native output list; shaped
/// generically enough to cover both UTXO-style and account-style chains
/// without committing this crate to either model's address/fee details.
#[derive(Debug, Clone)]
pub struct TxInputRef {
    pub reference: String,
}

#[derive(Debug, Clone)]
pub struct TxOutputSpec {
    pub address: String,
    pub amount_minor_units: u128,
}

#[async_trait]
pub trait BlockchainClient: Send + Sync {
    async fn current_tip_height(&self) -> Result<u64, BlockchainClientError>;
    async fn get_balance(&self, address: &str) -> Result<u128, BlockchainClientError>;
    async fn get_transaction(&self, tx_hash: &str) -> Result<ChainTransaction, BlockchainClientError>;
    /// Only meaningful for chains where block scanning is practical
    /// (`ScanStrategy::BlockScan`); account-style chains implement this as
    /// an empty scan and rely on `get_balance` polling instead.
    async fn scan_block(&self, height: u64) -> Result<Vec<ScannedTx>, BlockchainClientError>;
    async fn build_and_sign(
        &self,
        inputs: &[TxInputRef],
        outputs: &[TxOutputSpec],
        signer_key_ref_hex: &str,
    ) -> Result<Vec<u8>, BlockchainClientError>;
    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, BlockchainClientError>;
}
