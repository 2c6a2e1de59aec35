//! A deterministic, in-memory stand-in for a real chain RPC client (bitcoind,
//! geth, solana-client, ...), which are out of scope per the engine's own
//! `BlockchainClient` boundary. Gives the node binary something to run
//! against without a live chain -- same role as the teacher's
//! `RustyCoinNode` gRPC stub in `rusty-coin-node/src/main.rs`, which answers
//! `get_block`/`send_transaction` with canned data rather than a real chain.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use tumbler_confirmation::blockchain_client::{
    BlockchainClient, BlockchainClientError, ChainOutput, ChainTransaction, ChainTxStatus, ScannedTx, TxInputRef,
    TxOutputSpec,
};

struct SubmittedTx {
    outputs: Vec<ChainOutput>,
    confirmations: u32,
}

/// Every broadcast transaction is treated as confirmed on the next poll --
/// this trades chain realism for deterministic, fast-settling demo behavior.
/// `confirmations_per_poll` lets a scenario simulate a slower chain without
/// needing a real confirmation threshold to wait out.
pub struct DemoBlockchainClient {
    confirmations_per_poll: u32,
    balances: Mutex<HashMap<String, u128>>,
    txs: Mutex<HashMap<String, SubmittedTx>>,
    tip_height: Mutex<u64>,
}

impl DemoBlockchainClient {
    pub fn new(confirmations_per_poll: u32) -> Self {
        DemoBlockchainClient {
            confirmations_per_poll,
            balances: Mutex::new(HashMap::new()),
            txs: Mutex::new(HashMap::new()),
            tip_height: Mutex::new(0),
        }
    }

    /// Test/demo hook: credit an address as if a deposit transaction had
    /// landed, so `scan_block`/`get_balance` observe it on the next poll.
    pub fn simulate_deposit(&self, address: &str, amount_minor_units: u128, tx_hash: &str) {
        *self.balances.lock().unwrap().entry(address.to_string()).or_insert(0) += amount_minor_units;
        self.txs.lock().unwrap().insert(
            tx_hash.to_string(),
            SubmittedTx {
                outputs: vec![ChainOutput { address: address.to_string(), amount_minor_units }],
                confirmations: self.confirmations_per_poll,
            },
        );
        *self.tip_height.lock().unwrap() += 1;
    }
}

#[async_trait]
impl BlockchainClient for DemoBlockchainClient {
    async fn current_tip_height(&self) -> Result<u64, BlockchainClientError> {
        Ok(*self.tip_height.lock().unwrap())
    }

    async fn get_balance(&self, address: &str) -> Result<u128, BlockchainClientError> {
        Ok(self.balances.lock().unwrap().get(address).copied().unwrap_or(0))
    }

    async fn get_transaction(&self, tx_hash: &str) -> Result<ChainTransaction, BlockchainClientError> {
        let txs = self.txs.lock().unwrap();
        let tx = txs.get(tx_hash).ok_or(BlockchainClientError::TransactionNotFound)?;
        Ok(ChainTransaction {
            tx_hash: tx_hash.to_string(),
            confirmations: tx.confirmations,
            outputs: tx.outputs.clone(),
            status: ChainTxStatus::Confirmed,
        })
    }

    async fn scan_block(&self, _height: u64) -> Result<Vec<ScannedTx>, BlockchainClientError> {
        let txs = self.txs.lock().unwrap();
        Ok(txs
            .iter()
            .map(|(hash, tx)| ScannedTx { tx_hash: hash.clone(), outputs: tx.outputs.clone() })
            .collect())
    }

    async fn build_and_sign(
        &self,
        inputs: &[TxInputRef],
        outputs: &[TxOutputSpec],
        signer_key_ref_hex: &str,
    ) -> Result<Vec<u8>, BlockchainClientError> {
        // No real transaction format to build here; the raw bytes are just
        // enough to derive a stable tx hash from in `broadcast`.
        let mut buf = signer_key_ref_hex.as_bytes().to_vec();
        for input in inputs {
            buf.extend_from_slice(input.reference.as_bytes());
        }
        for output in outputs {
            buf.extend_from_slice(output.address.as_bytes());
            buf.extend_from_slice(&output.amount_minor_units.to_le_bytes());
        }
        Ok(buf)
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, BlockchainClientError> {
        let tx_hash = blake3::hash(raw_tx).to_hex().to_string();
        // Demo outputs aren't recoverable from the opaque raw_tx bytes alone;
        // callers that need confirmation tracking register via
        // `simulate_deposit`-style bookkeeping at the call site instead.
        self.txs.lock().unwrap().insert(
            tx_hash.clone(),
            SubmittedTx { outputs: Vec::new(), confirmations: self.confirmations_per_poll },
        );
        *self.tip_height.lock().unwrap() += 1;
        Ok(tx_hash)
    }
}
