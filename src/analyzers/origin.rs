//! Lineage of single-satoshi outputs back to the output where they were first minted.

use casemod_indexer_macros::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::Error,
    ingest::{
        context::IndexContext,
        loader::TxoLoader,
        types::{Event, IndexData, Outpoint, Txo},
    },
};

use super::{Analyzer, IndexItem, MAP_TAG, ORIGIN_TAG, bitcom::map::Map};

const DEFAULT_MAX_DEPTH: u32 = 1024;

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct OriginConfig {
    /// How many predecessor transactions a single lookup may walk through
    pub max_depth: Option<u32>,
}

#[derive(Encode, Decode, Clone, Debug, PartialEq, Serialize)]
pub struct Origin {
    pub outpoint: Outpoint,
    /// Number of transfers since the origin
    pub nonce: u32,
    pub map: Map,
}

impl Origin {
    fn event(&self) -> Event {
        Event::new("outpoint", self.outpoint.to_string())
    }

    fn into_data(self) -> IndexData {
        let event = self.event();
        IndexData::new(ORIGIN_TAG, self).with_events(vec![event])
    }
}

pub struct OriginAnalyzer {
    loader: TxoLoader,
    max_depth: u32,
}

impl OriginAnalyzer {
    pub fn new(loader: TxoLoader, config: OriginConfig) -> Self {
        Self {
            loader,
            max_depth: config.max_depth.unwrap_or(DEFAULT_MAX_DEPTH),
        }
    }

    /// Resolves the origin of output `vout` of `ctx`.
    ///
    /// The satoshi of the output is followed to the input that carried it: the input whose
    /// running satoshi offset equals the output's, when that input holds exactly one satoshi.
    /// Predecessors without a cached origin are resolved from storage. Every link resolved that
    /// way gets the origin cached on it: the direct predecessor in `ctx.spends`, deeper ones in
    /// `ctx.ancestors`, so all of them are persisted along with this transaction.
    pub fn calc_origin(
        &self,
        ctx: &mut IndexContext,
        vout: usize,
        depth: u32,
    ) -> Result<Option<Origin>, Error> {
        let mut links = vec![];
        let origin = self.walk(ctx, vout, depth, &mut links)?;

        ctx.ancestors.extend(links);

        Ok(origin)
    }

    fn walk(
        &self,
        ctx: &mut IndexContext,
        vout: usize,
        depth: u32,
        links: &mut Vec<Txo>,
    ) -> Result<Option<Origin>, Error> {
        if depth > self.max_depth {
            debug!(txid = %ctx.txid, vout, depth, "origin lookup exceeded max depth");
            return Ok(None);
        }

        if vout >= ctx.txos.len() {
            return Ok(None);
        }

        let out_acc = ctx.out_acc(vout);
        let own_map = ctx.txos[vout]
            .item(MAP_TAG)
            .and_then(IndexItem::as_map)
            .cloned();

        let mut in_acc = 0u64;
        for vin in 0..ctx.spends.len() {
            let spend = &ctx.spends[vin];

            if in_acc == out_acc && spend.satoshis == 1 {
                let predecessor = match spend.item(ORIGIN_TAG).and_then(IndexItem::as_origin) {
                    Some(cached) => Some(cached.clone()),
                    None => self.resolve_spend(ctx, vin, depth, links)?,
                };

                return Ok(predecessor.map(|mut origin| {
                    origin.nonce += 1;
                    if let Some(map) = &own_map {
                        origin.map.merge(map);
                    }
                    origin
                }));
            }

            if in_acc > out_acc {
                break;
            }

            in_acc += spend.satoshis;
        }

        Ok(Some(Origin {
            outpoint: ctx.txos[vout].outpoint,
            nonce: 0,
            map: own_map.unwrap_or_default(),
        }))
    }

    fn resolve_spend(
        &self,
        ctx: &mut IndexContext,
        vin: usize,
        depth: u32,
        links: &mut Vec<Txo>,
    ) -> Result<Option<Origin>, Error> {
        let outpoint = ctx.spends[vin].outpoint;

        let mut prev_ctx = self.loader.load_shallow(&outpoint.txid())?;
        let resolved = self.walk(&mut prev_ctx, outpoint.vout as usize, depth + 1, links)?;

        if let Some(origin) = &resolved {
            ctx.spends[vin].insert_data(origin.clone().into_data());

            // below the first level `ctx` is a shallow context that is dropped after the walk
            if depth > 0 {
                links.push(ctx.spends[vin].clone());
            }
        }

        Ok(resolved)
    }
}

impl Analyzer for OriginAnalyzer {
    fn tag(&self) -> &'static str {
        ORIGIN_TAG
    }

    fn parse(&self, ctx: &mut IndexContext, vout: usize) -> Result<Option<IndexData>, Error> {
        if ctx.txos[vout].satoshis != 1 {
            return Ok(None);
        }

        Ok(self.calc_origin(ctx, vout, 0)?.map(Origin::into_data))
    }
}
