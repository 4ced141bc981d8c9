use std::sync::Arc;

use bitcoin::{Transaction, Txid, hashes::Hash};
use chrono::Utc;
use itertools::Itertools;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, trace};

use crate::{
    DecodingError,
    analyzers::{Analyzer, IndexItem},
    error::Error,
    script::pkhash_from_script,
    storage::{
        kv_store::{IndexingTask, StorageHandler},
        table::Table,
    },
};

use super::{
    Config,
    context::IndexContext,
    loader::{DataDecoder, TxoLoader},
    query::TxoFields,
    source::TxSource,
    tables::{
        EventKey, EventIndexKV, OwnerEventIndexKV, OwnerEventKey, OwnerTxoKV, OwnerTxoKey,
        RawTxKV, SpendKV, TxLogEntry, TxLogKV, TxoDataKV, TxoDataKey, TxoDataRecord, TxoKV,
        TxoRecord,
    },
    types::{Block, PkHash, Spend, Txo},
};

/// Runs transactions through the analyzers and persists everything derived from them.
pub struct TxoStore {
    loader: TxoLoader,
    analyzers: Vec<Arc<dyn Analyzer>>,
    by_tag: FxHashMap<&'static str, Arc<dyn Analyzer>>,
    max_ancestor_depth: usize,
}

impl TxoStore {
    /// Store with the analyzers listed in the config, in config order.
    pub fn new(
        db: StorageHandler,
        source: Arc<dyn TxSource>,
        config: &Config,
    ) -> Result<Self, Error> {
        let loader = TxoLoader::new(db, source);

        let analyzers = config
            .analyzers
            .iter()
            .cloned()
            .map(|factory| factory.create_analyzer(&loader))
            .collect::<Result<Vec<_>, _>>()?;

        Self::with_analyzers(loader, analyzers, config.max_ancestor_depth)
    }

    pub fn with_analyzers(
        loader: TxoLoader,
        analyzers: Vec<Arc<dyn Analyzer>>,
        max_ancestor_depth: usize,
    ) -> Result<Self, Error> {
        let mut by_tag = FxHashMap::default();

        for analyzer in &analyzers {
            if by_tag.insert(analyzer.tag(), analyzer.clone()).is_some() {
                return Err(Error::Config(config::ConfigError::Message(format!(
                    "analyzer tag {} registered twice",
                    analyzer.tag()
                ))));
            }
        }

        info!(
            "txo store ready with analyzers [{}]",
            analyzers.iter().map(|a| a.tag()).join(", ")
        );

        Ok(Self {
            loader,
            analyzers,
            by_tag,
            max_ancestor_depth,
        })
    }

    pub fn loader(&self) -> &TxoLoader {
        &self.loader
    }

    pub fn db(&self) -> &StorageHandler {
        self.loader.db()
    }

    /// Fetches a transaction and its chain position from the source, then ingests it.
    pub fn ingest_txid(&self, txid: &Txid) -> Result<IndexContext, Error> {
        let tx = self.loader.source().load_tx(txid)?;
        let block = self.loader.source().load_proof(txid)?;

        self.ingest(&tx, block)
    }

    /// Ingests one transaction. `None` for `block` marks it unconfirmed, unless it was already
    /// logged, in which case the logged position is kept.
    ///
    /// Missing ancestors are ingested first, each committed on its own. Everything derived from
    /// `tx` itself is committed in one batch, or not at all.
    pub fn ingest(&self, tx: &Transaction, block: Option<Block>) -> Result<IndexContext, Error> {
        let mut visited = FxHashSet::default();
        self.ingest_inner(tx, block, 0, &mut visited)
    }

    fn ingest_inner(
        &self,
        tx: &Transaction,
        block: Option<Block>,
        depth: usize,
        visited: &mut FxHashSet<Txid>,
    ) -> Result<IndexContext, Error> {
        let txid = tx.compute_txid();
        visited.insert(txid);

        let block = self.resolve_block(&txid, block)?;
        let mut ctx = IndexContext::new(tx.clone(), block);

        trace!(%txid, depth, "ingesting transaction");

        self.populate_inputs(&mut ctx, depth, visited)?;
        self.parse_outputs(&mut ctx)?;

        for analyzer in &self.analyzers {
            analyzer.save(&mut ctx)?;
        }

        self.persist(&ctx)?;

        debug!(
            %txid,
            height = ctx.block.height,
            spends = ctx.spends.len(),
            outputs = ctx.txos.len(),
            "ingested transaction"
        );

        Ok(ctx)
    }

    fn resolve_block(&self, txid: &Txid, block: Option<Block>) -> Result<Block, Error> {
        if let Some(block) = block {
            return Ok(block);
        }

        if let Some(entry) = self.db().reader().get::<TxLogKV>(&txid.to_byte_array())? {
            return Ok(entry.block);
        }

        mempool_block(Utc::now().timestamp())
    }

    fn populate_inputs(
        &self,
        ctx: &mut IndexContext,
        depth: usize,
        visited: &mut FxHashSet<Txid>,
    ) -> Result<(), Error> {
        if ctx.is_coinbase() {
            return Ok(());
        }

        let spend_txid = ctx.txid.to_byte_array();
        let prevouts = ctx
            .tx
            .input
            .iter()
            .map(|input| input.previous_output)
            .collect::<Vec<_>>();

        for (vin, prevout) in prevouts.into_iter().enumerate() {
            if depth < self.max_ancestor_depth
                && !visited.contains(&prevout.txid)
                && !self.loader.is_ingested(&prevout.txid)?
            {
                let source = self.loader.source();
                let parent = source.load_tx(&prevout.txid)?;
                let parent_block = source.load_proof(&prevout.txid)?;

                trace!(txid = %ctx.txid, ancestor = %prevout.txid, "ingesting ancestor");
                self.ingest_inner(&parent, parent_block, depth + 1, visited)?;
            }

            let mut spend = self.loader.load_or_stub(&prevout.into(), self)?;
            spend.spend = Some(Spend {
                txid: spend_txid,
                vin: vin as u32,
                block: ctx.block,
            });

            ctx.spends.push(spend);
        }

        Ok(())
    }

    fn parse_outputs(&self, ctx: &mut IndexContext) -> Result<(), Error> {
        for vout in 0..ctx.tx.output.len() {
            let outpoint = ctx.outpoint(vout);
            let output = &ctx.tx.output[vout];
            let satoshis = output.value.to_sat();
            let script = output.script_pubkey.to_bytes();

            let mut txo = match self.loader.load_txo(&outpoint, &TxoFields::All, self)? {
                Some(txo) => txo,
                None => Txo::new(outpoint, satoshis, vec![], ctx.block),
            };

            // registered tags are derived again, others are carried over untouched
            txo.data.retain(|tag, _| !self.by_tag.contains_key(tag.as_str()));
            txo.satoshis = satoshis;
            txo.block = ctx.block;
            txo.owner = pkhash_from_script(&script).map(PkHash);
            txo.script = script;

            ctx.txos.push(txo);

            for analyzer in &self.analyzers {
                if let Some(data) = analyzer.parse(ctx, vout)? {
                    ctx.txos[vout].insert_data(data);
                }
            }
        }

        Ok(())
    }

    fn persist(&self, ctx: &IndexContext) -> Result<(), Error> {
        let db = self.db();

        // other workers may have committed spends of these outputs since they were loaded
        let _guard = db.write_guard();
        let mut task = db.begin_indexing_task()?;

        for txo in ctx
            .spends
            .iter()
            .chain(ctx.txos.iter())
            .chain(ctx.ancestors.iter())
        {
            self.persist_txo(&mut task, txo)?;
        }

        let txid = ctx.txid.to_byte_array();
        task.set::<TxLogKV>(txid, TxLogEntry { block: ctx.block })?;
        task.set::<RawTxKV>(txid, ctx.raw.clone())?;

        let finalized = task.finalize();
        trace!(txid = %ctx.txid, actions = finalized.len(), "committing ingest batch");

        db.apply_indexing_task(finalized)
    }

    /// Rewrites one output and every secondary entry derived from it. Entries written under the
    /// previous score, owner or events are removed first.
    fn persist_txo(&self, task: &mut IndexingTask, txo: &Txo) -> Result<(), Error> {
        let outpoint = txo.outpoint;

        let stored_spend = match txo.spend {
            Some(_) => None,
            None => task.get::<SpendKV>(&outpoint)?,
        };

        let merged;
        let txo = match stored_spend {
            Some(spend) => {
                trace!(%outpoint, "keeping spend committed since load");
                merged = Txo {
                    spend: Some(spend),
                    ..txo.clone()
                };
                &merged
            }
            None => txo,
        };

        let txo_score = txo.score();

        let prev_owner = task.get::<TxoKV>(&outpoint)?.and_then(|prev| {
            prev.owner.map(|owner| OwnerTxoKey {
                owner,
                score: prev.score,
                outpoint,
            })
        });

        if let Some(key) = prev_owner {
            task.delete::<OwnerTxoKV>(key)?;
        }

        for (key, prev) in task.range::<TxoDataKV>(TxoDataKV::encode_prefix_range(&outpoint))? {
            Self::delete_events(task, &key, &prev)?;

            if !txo.data.contains_key(&key.tag) {
                task.delete::<TxoDataKV>(key)?;
            }
        }

        task.set::<TxoKV>(
            outpoint,
            TxoRecord {
                satoshis: txo.satoshis,
                script: txo.script.clone(),
                block: txo.block,
                owner: txo.owner,
                score: txo_score,
            },
        )?;

        if let Some(spend) = txo.spend {
            task.set::<SpendKV>(outpoint, spend)?;
        }

        if let Some(owner) = txo.owner {
            task.set::<OwnerTxoKV>(
                OwnerTxoKey {
                    owner,
                    score: txo_score,
                    outpoint,
                },
                (),
            )?;
        }

        for (tag, data) in &txo.data {
            let score = match self.by_tag.get(tag.as_str()) {
                Some(analyzer) => analyzer.score(txo),
                None => txo_score,
            };

            for event in &data.events {
                task.set::<EventIndexKV>(
                    EventKey {
                        tag: tag.clone(),
                        label: event.label.clone(),
                        value: event.value.clone(),
                        score,
                        outpoint,
                    },
                    (),
                )?;

                if let Some(owner) = txo.owner {
                    task.set::<OwnerEventIndexKV>(
                        OwnerEventKey {
                            owner,
                            tag: tag.clone(),
                            label: event.label.clone(),
                            value: event.value.clone(),
                            score,
                            outpoint,
                        },
                        (),
                    )?;
                }
            }

            task.set::<TxoDataKV>(
                TxoDataKey {
                    outpoint,
                    tag: tag.clone(),
                },
                TxoDataRecord {
                    data: data.data().to_vec(),
                    events: data.events.clone(),
                    deps: data.deps.clone(),
                    score,
                    owner: txo.owner,
                },
            )?;
        }

        Ok(())
    }

    fn delete_events(
        task: &mut IndexingTask,
        key: &TxoDataKey,
        prev: &TxoDataRecord,
    ) -> Result<(), Error> {
        for event in &prev.events {
            if let Some(owner) = prev.owner {
                task.delete::<OwnerEventIndexKV>(OwnerEventKey {
                    owner,
                    tag: key.tag.clone(),
                    label: event.label.clone(),
                    value: event.value.clone(),
                    score: prev.score,
                    outpoint: key.outpoint,
                })?;
            }

            task.delete::<EventIndexKV>(EventKey {
                tag: key.tag.clone(),
                label: event.label.clone(),
                value: event.value.clone(),
                score: prev.score,
                outpoint: key.outpoint,
            })?;
        }

        Ok(())
    }
}

/// Unconfirmed position first seen at unix time `now`.
fn mempool_block(now: i64) -> Result<Block, Error> {
    let first_seen = u32::try_from(now)
        .map_err(|_| Error::Custom(format!("clock time {now} does not fit a mempool height")))?;

    Ok(Block::mempool(first_seen))
}

impl DataDecoder for TxoStore {
    fn decode_data(&self, tag: &str, raw: &[u8]) -> Result<Option<IndexItem>, DecodingError> {
        match self.by_tag.get(tag) {
            Some(analyzer) => analyzer.unmarshal_data(raw).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use rocksdb::IteratorMode;

    use super::*;
    use crate::{
        analyzers::{AnalyzerFactory, INSCRIPTION_TAG},
        ingest::{query::EventQuery, types::Outpoint},
        script::p2pkh,
        test_utils::{TestStore, coinbase, inscription_script, tx_paying},
    };

    fn dump(db: &StorageHandler) -> Vec<(Box<[u8]>, Box<[u8]>)> {
        db.db
            .iterator_cf(db.cf_handle().unwrap(), IteratorMode::Start)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_reingest_is_idempotent() {
        let test = TestStore::new(AnalyzerFactory::defaults(), 0);
        let tx = coinbase(
            1,
            vec![
                (1, inscription_script(Some([1; 20]), "text/plain", b"hello")),
                (500, p2pkh([2; 20])),
            ],
        );

        test.store
            .ingest(&tx, Some(Block::confirmed(10, 1, [1; 32])))
            .unwrap();
        let first = dump(test.store.db());

        test.store
            .ingest(&tx, Some(Block::confirmed(10, 1, [1; 32])))
            .unwrap();
        assert_eq!(dump(test.store.db()), first);
    }

    #[test]
    fn test_mempool_reingest_keeps_first_seen() {
        let test = TestStore::new(AnalyzerFactory::defaults(), 0);
        let tx = coinbase(1, vec![(1, p2pkh([1; 20]))]);

        let first = test.store.ingest(&tx, None).unwrap();
        let before = dump(test.store.db());

        let again = test.store.ingest(&tx, None).unwrap();

        assert!(!first.block.is_confirmed());
        assert_eq!(again.block, first.block);
        assert_eq!(dump(test.store.db()), before);
    }

    #[test]
    fn test_spend_order_independent() {
        let parent = coinbase(1, vec![(1000, p2pkh([1; 20]))]);
        let parent_block = Block::confirmed(1, 0, [1; 32]);
        let child_block = Block::confirmed(2, 0, [2; 32]);

        let in_order = TestStore::new(AnalyzerFactory::defaults(), 0);
        let parent_txid = in_order.source.insert(parent.clone());
        in_order.source.set_proof(parent_txid, parent_block);
        let child = tx_paying(&[(parent_txid, 0)], vec![(900, p2pkh([2; 20]))]);

        in_order.store.ingest(&parent, Some(parent_block)).unwrap();
        in_order.store.ingest(&child, Some(child_block)).unwrap();

        let reversed = TestStore::new(AnalyzerFactory::defaults(), 0);
        reversed.source.insert(parent.clone());
        reversed.source.set_proof(parent_txid, parent_block);

        reversed.store.ingest(&child, Some(child_block)).unwrap();
        reversed.store.ingest(&parent, Some(parent_block)).unwrap();

        assert_eq!(dump(in_order.store.db()), dump(reversed.store.db()));

        let spent = reversed
            .store
            .load_txo(&Outpoint::new(parent_txid, 0), &TxoFields::All)
            .unwrap()
            .unwrap();
        assert_eq!(spent.spend.map(|s| s.block), Some(child_block));

        let owned = reversed
            .store
            .txos_by_owner(&PkHash([1; 20]), Some(true), 0, 10)
            .unwrap();
        assert_eq!(owned.len(), 1);
    }

    #[test]
    fn test_spend_committed_during_reingest_is_kept() {
        let test = TestStore::new(AnalyzerFactory::defaults(), 0);
        let owner = PkHash([1; 20]);
        let parent = coinbase(
            1,
            vec![(1000, inscription_script(Some(owner.0), "text/plain", b"gm"))],
        );
        let parent_block = Block::confirmed(1, 0, [1; 32]);
        let parent_txid = test.source.insert(parent.clone());
        test.store.ingest(&parent, Some(parent_block)).unwrap();

        // a second ingest of the parent loads its outputs while they are still unspent
        let mut ctx = IndexContext::new(parent.clone(), parent_block);
        test.store.parse_outputs(&mut ctx).unwrap();

        // the child commits its spend before that ingest persists
        let child = tx_paying(&[(parent_txid, 0)], vec![(900, p2pkh([2; 20]))]);
        test.store
            .ingest(&child, Some(Block::confirmed(2, 0, [2; 32])))
            .unwrap();

        for analyzer in &test.store.analyzers {
            analyzer.save(&mut ctx).unwrap();
        }
        test.store.persist(&ctx).unwrap();

        let outpoint = Outpoint::new(parent_txid, 0);
        let txo = test.store.load_txo(&outpoint, &TxoFields::All).unwrap().unwrap();
        assert!(txo.is_spent());

        let words = |spent| {
            let mut query = EventQuery::new(INSCRIPTION_TAG, "word", "gm");
            query.spent = Some(spent);
            test.store.search(&query).unwrap()
        };
        assert!(words(false).is_empty());
        assert_eq!(words(true).len(), 1);

        assert!(test.store.txos_by_owner(&owner, Some(false), 0, 10).unwrap().is_empty());
        assert_eq!(test.store.txos_by_owner(&owner, Some(true), 0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_mempool_height_out_of_range() {
        let block = mempool_block(1_700_000_000).unwrap();
        assert_eq!(block.height, 1_700_000_000);
        assert!(!block.is_confirmed());

        assert!(matches!(
            mempool_block(i64::from(u32::MAX) + 1),
            Err(Error::Custom(_))
        ));
        assert!(matches!(mempool_block(-1), Err(Error::Custom(_))));
    }

    #[test]
    fn test_ancestors_ingested_up_to_depth() {
        let test = TestStore::new(AnalyzerFactory::defaults(), 1);

        let mint = coinbase(1, vec![(1000, p2pkh([1; 20]))]);
        let mint_txid = test.source.insert(mint);
        let middle = tx_paying(&[(mint_txid, 0)], vec![(900, p2pkh([2; 20]))]);
        let middle_txid = test.source.insert(middle);
        let tip = tx_paying(&[(middle_txid, 0)], vec![(800, p2pkh([3; 20]))]);

        test.store.ingest(&tip, None).unwrap();

        let loader = test.store.loader();
        assert!(loader.is_ingested(&tip.compute_txid()).unwrap());
        assert!(loader.is_ingested(&middle_txid).unwrap());
        assert!(!loader.is_ingested(&mint_txid).unwrap());

        // the mint output was stubbed from the source while ingesting the middle transaction
        let stub = test
            .store
            .load_txo(&Outpoint::new(mint_txid, 0), &TxoFields::All)
            .unwrap()
            .unwrap();
        assert_eq!(stub.satoshis, 1000);
        assert!(stub.is_spent());
    }

    #[test]
    fn test_missing_ancestor_writes_nothing() {
        let test = TestStore::new(AnalyzerFactory::defaults(), 2);
        let unknown = Txid::from_byte_array([7; 32]);
        let tx = tx_paying(&[(unknown, 0)], vec![(1, p2pkh([1; 20]))]);

        let res = test.store.ingest(&tx, None);

        assert!(matches!(res, Err(Error::MissingAncestor(_))));
        assert!(dump(test.store.db()).is_empty());
    }

    #[test]
    fn test_unregistered_tags_retained() {
        let test = TestStore::new(AnalyzerFactory::defaults(), 0);
        let tx = coinbase(1, vec![(1, inscription_script(Some([1; 20]), "text/plain", b"hi"))]);
        let ctx = test.store.ingest(&tx, None).unwrap();
        let outpoint = ctx.outpoint(0);

        let config = Config {
            analyzers: vec![AnalyzerFactory::Map],
            ..Default::default()
        };
        let narrow = TxoStore::new(test.store.db().clone(), test.source.clone(), &config).unwrap();
        narrow.ingest(&tx, None).unwrap();

        let txo = narrow.load_txo(&outpoint, &TxoFields::All).unwrap().unwrap();
        let kept = txo.data.get(INSCRIPTION_TAG).unwrap();
        assert!(kept.item().is_none());
        assert!(kept.has_event("type", "text/plain"));

        let found = narrow
            .search(&EventQuery::new(INSCRIPTION_TAG, "type", "text/plain"))
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
