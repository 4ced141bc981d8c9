use std::sync::Arc;

use bitcoin::{Transaction, Txid, consensus, hashes::Hash};
use bitcoincore_rpc::{Auth, Client, RpcApi, jsonrpc};
use mini_moka::sync::Cache;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::{error::Error, storage::kv_store::StorageHandler};

use super::{
    tables::{RawTxKV, TxLogKV},
    types::Block,
};

/// Bitcoin Core style "no such transaction" RPC error code
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;

const DEFAULT_TX_CACHE_SIZE_GB: f64 = 0.25;

#[derive(Deserialize, Debug, Clone)]
pub struct SourceConfig {
    pub rpc_address: String,
    pub rpc_user: String,
    pub rpc_pass: String,
    /// Size of the in-memory raw transaction cache in GB
    pub cache_size: Option<f64>,
}

impl SourceConfig {
    pub fn cache_size_bytes(&self) -> u64 {
        (self.cache_size.unwrap_or(DEFAULT_TX_CACHE_SIZE_GB) * 1024.0 * 1024.0 * 1024.0) as u64
    }
}

/// Where transactions and their chain positions come from.
pub trait TxSource: Send + Sync {
    /// Fails with [`Error::MissingAncestor`] when the transaction is unknown.
    fn load_tx(&self, txid: &Txid) -> Result<Transaction, Error>;

    /// Chain position of a mined transaction, `None` while unconfirmed.
    fn load_proof(&self, txid: &Txid) -> Result<Option<Block>, Error>;
}

/// Serves transactions this store has already ingested or cached.
#[derive(Clone)]
pub struct StoreSource {
    db: StorageHandler,
}

impl StoreSource {
    pub fn new(db: StorageHandler) -> Self {
        Self { db }
    }

    fn load_raw(&self, txid: &Txid) -> Result<Option<Transaction>, Error> {
        let raw = self.db.reader().get::<RawTxKV>(&txid.to_byte_array())?;

        raw.map(|bytes| consensus::deserialize(&bytes).map_err(Error::from))
            .transpose()
    }

    fn save_raw(&self, txid: &Txid, tx: &Transaction) -> Result<(), Error> {
        let mut task = self.db.begin_indexing_task()?;
        task.set::<RawTxKV>(txid.to_byte_array(), consensus::serialize(tx))?;
        self.db.apply_indexing_task(task.finalize())
    }
}

impl TxSource for StoreSource {
    fn load_tx(&self, txid: &Txid) -> Result<Transaction, Error> {
        self.load_raw(txid)?
            .ok_or_else(|| Error::MissingAncestor(txid.to_string()))
    }

    fn load_proof(&self, txid: &Txid) -> Result<Option<Block>, Error> {
        let entry = self.db.reader().get::<TxLogKV>(&txid.to_byte_array())?;

        Ok(entry.map(|e| e.block).filter(Block::is_confirmed))
    }
}

/// Node RPC backed source.
pub struct RpcSource {
    client: Client,
}

impl RpcSource {
    pub fn new(config: &SourceConfig) -> Result<Self, Error> {
        let auth = Auth::UserPass(config.rpc_user.clone(), config.rpc_pass.clone());
        let client = Client::new(&config.rpc_address, auth)?;

        Ok(Self { client })
    }
}

fn is_not_found(err: &bitcoincore_rpc::Error) -> bool {
    matches!(
        err,
        bitcoincore_rpc::Error::JsonRpc(jsonrpc::error::Error::Rpc(e))
            if e.code == RPC_INVALID_ADDRESS_OR_KEY
    )
}

impl TxSource for RpcSource {
    fn load_tx(&self, txid: &Txid) -> Result<Transaction, Error> {
        trace!(%txid, "fetching transaction over rpc");

        self.client
            .get_raw_transaction(txid, None)
            .map_err(|e| match is_not_found(&e) {
                true => Error::MissingAncestor(txid.to_string()),
                false => Error::from(e),
            })
    }

    fn load_proof(&self, txid: &Txid) -> Result<Option<Block>, Error> {
        let info = match self.client.get_raw_transaction_info(txid, None) {
            Ok(info) => info,
            Err(e) if is_not_found(&e) => return Err(Error::MissingAncestor(txid.to_string())),
            Err(e) => return Err(e.into()),
        };

        let Some(hash) = info.blockhash else {
            return Ok(None);
        };

        let block = self.client.get_block_info(&hash)?;
        let idx = block
            .tx
            .iter()
            .position(|t| t == txid)
            .ok_or_else(|| Error::Custom(format!("{txid} not listed in block {hash}")))?;

        Ok(Some(Block::confirmed(
            block.height as u32,
            idx as u64,
            hash.to_byte_array(),
        )))
    }
}

/// Memory cache, then the local store, then the remote source. Remote hits are written back to
/// the store so later runs do not refetch them.
pub struct CachedSource<R> {
    cache: Cache<Txid, Arc<Transaction>>,
    store: StoreSource,
    remote: R,
}

impl<R: TxSource> CachedSource<R> {
    pub fn new(db: StorageHandler, remote: R, max_size_bytes: u64) -> Self {
        Self {
            cache: Cache::builder()
                .weigher(|_key: &Txid, tx: &Arc<Transaction>| -> u32 {
                    tx.total_size() as u32 + 32
                })
                .max_capacity(max_size_bytes)
                .build(),
            store: StoreSource::new(db),
            remote,
        }
    }
}

impl<R: TxSource> TxSource for CachedSource<R> {
    fn load_tx(&self, txid: &Txid) -> Result<Transaction, Error> {
        if let Some(tx) = self.cache.get(txid) {
            return Ok(tx.as_ref().clone());
        }

        let tx = match self.store.load_raw(txid)? {
            Some(tx) => tx,
            None => {
                let tx = self.remote.load_tx(txid)?;
                debug!(%txid, "caching remote transaction");
                self.store.save_raw(txid, &tx)?;
                tx
            }
        };

        self.cache.insert(*txid, Arc::new(tx.clone()));

        Ok(tx)
    }

    fn load_proof(&self, txid: &Txid) -> Result<Option<Block>, Error> {
        match self.store.load_proof(txid)? {
            Some(block) => Ok(Some(block)),
            None => self.remote.load_proof(txid),
        }
    }
}
