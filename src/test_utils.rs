use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use bitcoin::{
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
    absolute::LockTime, transaction::Version,
};
use tempfile::TempDir;

use crate::{
    analyzers::AnalyzerFactory,
    error::Error,
    ingest::{
        Config,
        context::IndexContext,
        source::TxSource,
        store::TxoStore,
        types::{Block, PkHash, Txo},
    },
    script::{OP_0, OP_1, OP_ENDIF, OP_IF, p2pkh, pkhash_from_script, push},
    storage::kv_store::StorageHandler,
};

pub fn open_test_db() -> (StorageHandler, TempDir) {
    let tmp = TempDir::new().unwrap();
    let db = StorageHandler::open_at(tmp.path(), 16 * 1024 * 1024, true).unwrap();

    (db, tmp)
}

/// Transactions held in memory, standing in for a node.
#[derive(Default)]
pub struct MemorySource {
    txs: RwLock<HashMap<Txid, Transaction>>,
    proofs: RwLock<HashMap<Txid, Block>>,
}

impl MemorySource {
    pub fn insert(&self, tx: Transaction) -> Txid {
        let txid = tx.compute_txid();
        self.insert_as(txid, tx);
        txid
    }

    /// Stores `tx` under an arbitrary id, for graphs no real transactions could form.
    pub fn insert_as(&self, txid: Txid, tx: Transaction) {
        self.txs.write().unwrap().insert(txid, tx);
    }

    pub fn remove(&self, txid: &Txid) {
        self.txs.write().unwrap().remove(txid);
    }

    pub fn set_proof(&self, txid: Txid, block: Block) {
        self.proofs.write().unwrap().insert(txid, block);
    }
}

impl TxSource for MemorySource {
    fn load_tx(&self, txid: &Txid) -> Result<Transaction, Error> {
        self.txs
            .read()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or_else(|| Error::MissingAncestor(txid.to_string()))
    }

    fn load_proof(&self, txid: &Txid) -> Result<Option<Block>, Error> {
        if !self.txs.read().unwrap().contains_key(txid) {
            return Err(Error::MissingAncestor(txid.to_string()));
        }

        Ok(self.proofs.read().unwrap().get(txid).copied())
    }
}

pub struct TestStore {
    pub store: TxoStore,
    pub source: Arc<MemorySource>,
    _tmp: TempDir,
}

impl TestStore {
    pub fn new(analyzers: Vec<AnalyzerFactory>, max_ancestor_depth: usize) -> Self {
        let (db, tmp) = open_test_db();
        let source = Arc::new(MemorySource::default());

        let config = Config {
            max_ancestor_depth,
            analyzers,
            ..Default::default()
        };

        let store = TxoStore::new(db, source.clone(), &config).unwrap();

        Self {
            store,
            source,
            _tmp: tmp,
        }
    }
}

fn outputs(outputs: Vec<(u64, Vec<u8>)>) -> Vec<TxOut> {
    outputs
        .into_iter()
        .map(|(sats, script)| TxOut {
            value: Amount::from_sat(sats),
            script_pubkey: ScriptBuf::from_bytes(script),
        })
        .collect()
}

/// Coinbase style transaction. `n` goes into the input script so each one gets its own txid.
pub fn coinbase(n: u32, outs: Vec<(u64, Vec<u8>)>) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(push(&n.to_le_bytes())),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs(outs),
    }
}

pub fn tx_paying(inputs: &[(Txid, u32)], outs: Vec<(u64, Vec<u8>)>) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|(txid, vout)| TxIn {
                previous_output: OutPoint::new(*txid, *vout),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs(outs),
    }
}

/// Context with the outputs of `tx` filled in and no spends, for running a single analyzer.
pub fn context_for(tx: &Transaction, block: Block) -> IndexContext {
    let mut ctx = IndexContext::new(tx.clone(), block);

    ctx.txos = tx
        .output
        .iter()
        .enumerate()
        .map(|(vout, out)| {
            let mut txo = Txo::new(
                ctx.outpoint(vout),
                out.value.to_sat(),
                out.script_pubkey.to_bytes(),
                block,
            );
            txo.owner = pkhash_from_script(&txo.script).map(PkHash);
            txo
        })
        .collect();

    ctx
}

pub fn inscription_script(owner: Option<[u8; 20]>, content_type: &str, content: &[u8]) -> Vec<u8> {
    let mut script = owner.map(p2pkh).unwrap_or_default();

    script.extend([OP_0, OP_IF]);
    script.extend(push(b"ord"));
    script.push(OP_1);
    script.extend(push(content_type.as_bytes()));
    script.push(OP_0);
    script.extend(push(content));
    script.push(OP_ENDIF);

    script
}
