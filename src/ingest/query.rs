use std::ops::Range;

use serde::Serialize;

use crate::{
    error::Error,
    storage::{
        encdec::{Encode, EncodeBuilder, prefix_key_range},
        table::Table,
    },
};

use super::{
    store::TxoStore,
    tables::{EventIndexKV, OwnerEventIndexKV, OwnerTxoKV},
    types::{Outpoint, PkHash, SPENT_THRESHOLD, Score, Txo},
};

pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// Which tag data to attach when loading an output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TxoFields {
    #[default]
    All,
    Tags(Vec<String>),
}

impl TxoFields {
    pub fn includes(&self, tag: &str) -> bool {
        match self {
            TxoFields::All => true,
            TxoFields::Tags(tags) => tags.iter().any(|t| t == tag),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventQuery {
    pub tag: String,
    pub label: String,
    pub value: String,
    /// Only entries written while this key owned the output
    pub owner: Option<PkHash>,
    /// `None` returns both partitions, unspent first
    pub spent: Option<bool>,
    pub offset: usize,
    pub limit: usize,
}

impl EventQuery {
    pub fn new(tag: impl Into<String>, label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            label: label.into(),
            value: value.into(),
            owner: None,
            spent: None,
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub outpoint: Outpoint,
    #[serde(serialize_with = "serialize_score")]
    pub score: Score,
}

fn serialize_score<S: serde::Serializer>(score: &Score, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(score)
}

/// Raw key range of the entries under `prefix`, narrowed to one score partition.
fn score_range<T: Table, P: Encode>(prefix: &P, spent: Option<bool>) -> Range<Vec<u8>> {
    let raw_prefix = EncodeBuilder::new()
        .append(&T::prefix())
        .append(prefix)
        .build();

    let with_score = |score: Score| {
        EncodeBuilder::new()
            .append(&raw_prefix)
            .append(&score)
            .build()
    };

    match spent {
        None => prefix_key_range(&raw_prefix),
        Some(false) => with_score(0)..with_score(SPENT_THRESHOLD),
        Some(true) => with_score(SPENT_THRESHOLD)..prefix_key_range(&raw_prefix).end,
    }
}

impl TxoStore {
    pub fn load_txo(&self, outpoint: &Outpoint, fields: &TxoFields) -> Result<Option<Txo>, Error> {
        self.loader().load_txo(outpoint, fields, self)
    }

    /// Outputs carrying an event, in score order.
    pub fn search(&self, query: &EventQuery) -> Result<Vec<SearchResult>, Error> {
        let reader = self.db().reader();

        let results = match query.owner {
            Some(owner) => {
                let prefix = (owner, &query.tag, &query.label, &query.value);
                let range = score_range::<OwnerEventIndexKV, _>(&prefix, query.spent);

                reader
                    .iter_kvs::<OwnerEventIndexKV>(range, false)?
                    .skip(query.offset)
                    .take(query.limit)
                    .map(|kv| {
                        kv.map(|(key, ())| SearchResult {
                            outpoint: key.outpoint,
                            score: key.score,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let prefix = (&query.tag, &query.label, &query.value);
                let range = score_range::<EventIndexKV, _>(&prefix, query.spent);

                reader
                    .iter_kvs::<EventIndexKV>(range, false)?
                    .skip(query.offset)
                    .take(query.limit)
                    .map(|kv| {
                        kv.map(|(key, ())| SearchResult {
                            outpoint: key.outpoint,
                            score: key.score,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(results)
    }

    /// Outputs currently or formerly held by `owner`, in score order.
    pub fn txos_by_owner(
        &self,
        owner: &PkHash,
        spent: Option<bool>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SearchResult>, Error> {
        let range = score_range::<OwnerTxoKV, _>(owner, spent);

        self.db()
            .reader()
            .iter_kvs::<OwnerTxoKV>(range, false)?
            .skip(offset)
            .take(limit)
            .map(|kv| {
                kv.map(|(key, ())| SearchResult {
                    outpoint: key.outpoint,
                    score: key.score,
                })
            })
            .collect()
    }
}
