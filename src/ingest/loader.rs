use std::sync::Arc;

use bitcoin::{Txid, hashes::Hash};
use tracing::trace;

use crate::{
    DecodingError,
    analyzers::IndexItem,
    error::Error,
    script::pkhash_from_script,
    storage::{kv_store::StorageHandler, table::Table},
};

use super::{
    context::IndexContext,
    query::TxoFields,
    source::TxSource,
    tables::{SpendKV, TxLogKV, TxoDataKV, TxoKV},
    types::{IndexData, Outpoint, PkHash, Spend, Txo},
};

/// Turns the stored bytes of a tag back into a typed item. `None` means the tag is not known to
/// the decoder and the bytes are kept opaque.
pub trait DataDecoder {
    fn decode_data(&self, tag: &str, raw: &[u8]) -> Result<Option<IndexItem>, DecodingError>;
}

/// Decodes every tag this crate ships an analyzer for.
pub struct BuiltinDecoder;

impl DataDecoder for BuiltinDecoder {
    fn decode_data(&self, tag: &str, raw: &[u8]) -> Result<Option<IndexItem>, DecodingError> {
        IndexItem::unmarshal(tag, raw)
    }
}

/// Read side of the txo store, shared by the pipeline and analyzers that need to look at other
/// transactions.
#[derive(Clone)]
pub struct TxoLoader {
    db: StorageHandler,
    source: Arc<dyn TxSource>,
}

impl TxoLoader {
    pub fn new(db: StorageHandler, source: Arc<dyn TxSource>) -> Self {
        Self { db, source }
    }

    pub fn db(&self) -> &StorageHandler {
        &self.db
    }

    pub fn source(&self) -> &dyn TxSource {
        self.source.as_ref()
    }

    pub fn is_ingested(&self, txid: &Txid) -> Result<bool, Error> {
        Ok(self
            .db
            .reader()
            .get::<TxLogKV>(&txid.to_byte_array())?
            .is_some())
    }

    /// A persisted output with its spend and the requested tag data.
    pub fn load_txo(
        &self,
        outpoint: &Outpoint,
        fields: &TxoFields,
        decoder: &dyn DataDecoder,
    ) -> Result<Option<Txo>, Error> {
        let reader = self.db.reader();

        let Some(record) = reader.get::<TxoKV>(outpoint)? else {
            return Ok(None);
        };

        let mut txo = Txo::new(*outpoint, record.satoshis, record.script, record.block);
        txo.owner = record.owner;
        txo.spend = reader.get::<SpendKV>(outpoint)?;

        for kv in reader.iter_kvs::<TxoDataKV>(TxoDataKV::encode_prefix_range(outpoint), false)? {
            let (key, value) = kv?;

            if !fields.includes(&key.tag) {
                continue;
            }

            let item = decoder.decode_data(&key.tag, &value.data)?;
            txo.insert_data(IndexData::stored(
                key.tag,
                value.data,
                item,
                value.events,
                value.deps,
            ));
        }

        Ok(Some(txo))
    }

    /// The persisted output, or a bare one built from its source transaction when this store has
    /// never seen it.
    pub fn load_or_stub(
        &self,
        outpoint: &Outpoint,
        decoder: &dyn DataDecoder,
    ) -> Result<Txo, Error> {
        if let Some(txo) = self.load_txo(outpoint, &TxoFields::All, decoder)? {
            return Ok(txo);
        }

        trace!(%outpoint, "stubbing output from source transaction");

        let txid = outpoint.txid();
        let tx = self.source.load_tx(&txid)?;
        let output = tx
            .output
            .get(outpoint.vout as usize)
            .ok_or_else(|| Error::MissingAncestor(outpoint.to_string()))?;

        let block = self.source.load_proof(&txid)?.unwrap_or_default();
        let script = output.script_pubkey.to_bytes();

        let mut txo = Txo::new(*outpoint, output.value.to_sat(), script, block);
        txo.owner = pkhash_from_script(&txo.script).map(PkHash);

        Ok(txo)
    }

    /// Context of another transaction with inputs and outputs resolved from storage, without
    /// running any analyzer.
    pub fn load_shallow(&self, txid: &Txid) -> Result<IndexContext, Error> {
        let tx = self.source.load_tx(txid)?;

        let block = match self.db.reader().get::<TxLogKV>(&txid.to_byte_array())? {
            Some(entry) => entry.block,
            None => self.source.load_proof(txid)?.unwrap_or_default(),
        };

        let mut ctx = IndexContext::new(tx, block);
        let spend_txid = ctx.txid.to_byte_array();

        let mut spends = Vec::with_capacity(ctx.tx.input.len());
        if !ctx.is_coinbase() {
            for (vin, input) in ctx.tx.input.iter().enumerate() {
                let mut spend = self.load_or_stub(&input.previous_output.into(), &BuiltinDecoder)?;
                spend.spend = Some(Spend {
                    txid: spend_txid,
                    vin: vin as u32,
                    block: ctx.block,
                });
                spends.push(spend);
            }
        }

        let mut txos = Vec::with_capacity(ctx.tx.output.len());
        for (vout, output) in ctx.tx.output.iter().enumerate() {
            let outpoint = ctx.outpoint(vout);

            let txo = match self.load_txo(&outpoint, &TxoFields::All, &BuiltinDecoder)? {
                Some(txo) => txo,
                None => {
                    let script = output.script_pubkey.to_bytes();
                    let mut txo = Txo::new(outpoint, output.value.to_sat(), script, ctx.block);
                    txo.owner = pkhash_from_script(&txo.script).map(PkHash);
                    txo
                }
            };

            txos.push(txo);
        }

        ctx.spends = spends;
        ctx.txos = txos;

        Ok(ctx)
    }
}
