use bitcoin::{Transaction, Txid, consensus};

use super::types::{Block, Outpoint, Txo};

/// Working state of one transaction while it moves through the pipeline.
///
/// `spends` holds the outputs consumed by each input in input order (empty for coinbase) and
/// `txos` the outputs of this transaction in output order. `ancestors` collects outputs of earlier
/// transactions that analyzers updated along the way, they are persisted in the same batch.
pub struct IndexContext {
    pub txid: Txid,
    pub tx: Transaction,
    pub raw: Vec<u8>,
    pub block: Block,
    pub spends: Vec<Txo>,
    pub txos: Vec<Txo>,
    pub ancestors: Vec<Txo>,
}

impl IndexContext {
    pub fn new(tx: Transaction, block: Block) -> Self {
        Self {
            txid: tx.compute_txid(),
            raw: consensus::serialize(&tx),
            tx,
            block,
            spends: vec![],
            txos: vec![],
            ancestors: vec![],
        }
    }

    pub fn outpoint(&self, vout: usize) -> Outpoint {
        Outpoint::new(self.txid, vout as u32)
    }

    /// Satoshis of all outputs before `vout`.
    pub fn out_acc(&self, vout: usize) -> u64 {
        self.tx
            .output
            .iter()
            .take(vout)
            .map(|o| o.value.to_sat())
            .sum()
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx.is_coinbase()
    }
}
