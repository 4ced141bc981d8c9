use std::{fmt, str::FromStr};

use bitcoin::{Txid, hashes::Hash};
use casemod_indexer_macros::{Decode, Encode};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::{
    analyzers::IndexItem,
    storage::encdec::Encode as _,
};

/// Sort key of every secondary index entry.
///
/// Packs `(spent, height, idx)` as `spent << 96 | height << 64 | idx`, so all unspent entries sort
/// below [`SPENT_THRESHOLD`] and within each partition entries sort by height, then position in
/// block.
pub type Score = u128;

pub const SPENT_THRESHOLD: Score = 1 << 96;

pub fn score(spent: bool, height: u32, idx: u64) -> Score {
    (u128::from(spent) << 96) | (u128::from(height) << 64) | u128::from(idx)
}

#[derive(Encode, Decode, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub struct Outpoint {
    /// Txid in internal byte order
    pub txid: [u8; 32],
    pub vout: u32,
}

impl Outpoint {
    pub fn new(txid: Txid, vout: u32) -> Self {
        Self {
            txid: txid.to_byte_array(),
            vout,
        }
    }

    pub fn txid(&self) -> Txid {
        Txid::from_byte_array(self.txid)
    }

    /// Wire form used inside scripts: txid then little-endian vout.
    pub fn to_bytes36(&self) -> [u8; 36] {
        let mut out = [0u8; 36];
        out[..32].copy_from_slice(&self.txid);
        out[32..].copy_from_slice(&self.vout.to_le_bytes());
        out
    }

    pub fn from_bytes36(raw: &[u8]) -> Option<Self> {
        if raw.len() != 36 {
            return None;
        }

        let mut txid = [0u8; 32];
        txid.copy_from_slice(&raw[..32]);
        let mut vout = [0u8; 4];
        vout.copy_from_slice(&raw[32..]);

        Some(Self {
            txid,
            vout: u32::from_le_bytes(vout),
        })
    }
}

impl From<bitcoin::OutPoint> for Outpoint {
    fn from(outpoint: bitcoin::OutPoint) -> Self {
        Self::new(outpoint.txid, outpoint.vout)
    }
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.txid(), self.vout)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid outpoint: {0}")]
pub struct ParseOutpointError(String);

impl FromStr for Outpoint {
    type Err = ParseOutpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, vout) = s
            .rsplit_once('_')
            .ok_or_else(|| ParseOutpointError(s.to_string()))?;

        let txid = Txid::from_str(txid).map_err(|_| ParseOutpointError(s.to_string()))?;
        let vout = vout.parse().map_err(|_| ParseOutpointError(s.to_string()))?;

        Ok(Self::new(txid, vout))
    }
}

impl Serialize for Outpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Position of a transaction in the chain. Unconfirmed transactions carry no hash and use their
/// first-seen unix time as height.
#[derive(Encode, Decode, Clone, Copy, PartialEq, Eq, Debug, Default, Serialize)]
pub struct Block {
    pub height: u32,
    pub idx: u64,
    #[serde(serialize_with = "serialize_hex_opt")]
    pub hash: Option<[u8; 32]>,
}

impl Block {
    pub fn confirmed(height: u32, idx: u64, hash: [u8; 32]) -> Self {
        Self {
            height,
            idx,
            hash: Some(hash),
        }
    }

    pub fn mempool(first_seen: u32) -> Self {
        Self {
            height: first_seen,
            idx: 0,
            hash: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.hash.is_some()
    }
}

#[derive(Encode, Decode, Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub struct Spend {
    #[serde(serialize_with = "serialize_txid")]
    pub txid: [u8; 32],
    pub vin: u32,
    pub block: Block,
}

#[derive(Encode, Decode, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PkHash(pub [u8; 20]);

impl fmt::Display for PkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for PkHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 20];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }
}

impl Serialize for PkHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Encode, Decode, Clone, PartialEq, Eq, Debug, Serialize)]
pub struct Event {
    pub label: String,
    pub value: String,
}

impl Event {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

/// Facts one analyzer derived for one output.
///
/// `data` always holds the encoding of `item` when `item` is present. Data whose analyzer is not
/// registered is carried as raw bytes only.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexData {
    #[serde(skip)]
    pub tag: String,
    #[serde(skip)]
    data: Vec<u8>,
    item: Option<IndexItem>,
    pub events: Vec<Event>,
    pub deps: Vec<Outpoint>,
}

impl IndexData {
    pub fn new(tag: &str, item: impl Into<IndexItem>) -> Self {
        let item = item.into();

        Self {
            tag: tag.to_string(),
            data: item.encode(),
            item: Some(item),
            events: vec![],
            deps: vec![],
        }
    }

    /// Rebuilds data read back from storage.
    pub fn stored(
        tag: String,
        data: Vec<u8>,
        item: Option<IndexItem>,
        events: Vec<Event>,
        deps: Vec<Outpoint>,
    ) -> Self {
        Self {
            tag,
            data,
            item,
            events,
            deps,
        }
    }

    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn item(&self) -> Option<&IndexItem> {
        self.item.as_ref()
    }

    /// Replaces the item, keeping the serialized bytes in step.
    pub fn set_item(&mut self, item: impl Into<IndexItem>) {
        let item = item.into();
        self.data = item.encode();
        self.item = Some(item);
    }

    pub fn has_event(&self, label: &str, value: &str) -> bool {
        self.events
            .iter()
            .any(|e| e.label == label && e.value == value)
    }
}

/// A transaction output together with everything derived about it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Txo {
    pub outpoint: Outpoint,
    pub satoshis: u64,
    #[serde(serialize_with = "serialize_hex")]
    pub script: Vec<u8>,
    pub block: Block,
    pub spend: Option<Spend>,
    pub owner: Option<PkHash>,
    pub data: IndexMap<String, IndexData>,
}

impl Txo {
    pub fn new(outpoint: Outpoint, satoshis: u64, script: Vec<u8>, block: Block) -> Self {
        Self {
            outpoint,
            satoshis,
            script,
            block,
            spend: None,
            owner: None,
            data: IndexMap::new(),
        }
    }

    /// Spent outputs are ordered by the block of the spending transaction.
    pub fn score(&self) -> Score {
        match &self.spend {
            Some(spend) => score(true, spend.block.height, spend.block.idx),
            None => score(false, self.block.height, self.block.idx),
        }
    }

    pub fn is_spent(&self) -> bool {
        self.spend.is_some()
    }

    pub fn item(&self, tag: &str) -> Option<&IndexItem> {
        self.data.get(tag).and_then(IndexData::item)
    }

    pub fn insert_data(&mut self, data: IndexData) {
        self.data.insert(data.tag.clone(), data);
    }
}

fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

fn serialize_hex_opt<S: Serializer>(
    bytes: &Option<[u8; 32]>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(b) => serializer.serialize_str(&hex::encode(b)),
        None => serializer.serialize_none(),
    }
}

fn serialize_txid<S: Serializer>(txid: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&Txid::from_byte_array(*txid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_partitions() {
        let unspent_late = score(false, u32::MAX, u64::MAX);
        let spent_early = score(true, 0, 0);

        assert!(unspent_late < SPENT_THRESHOLD);
        assert!(spent_early >= SPENT_THRESHOLD);
        assert!(score(false, 10, 5) < score(false, 11, 0));
        assert!(score(false, 10, 5) < score(false, 10, 6));
    }

    #[test]
    fn test_mempool_sorts_after_confirmed() {
        let confirmed = Block::confirmed(850_000, 12, [1; 32]);
        let mempool = Block::mempool(1_700_000_000);

        assert!(
            score(false, confirmed.height, confirmed.idx)
                < score(false, mempool.height, mempool.idx)
        );
        assert!(!mempool.is_confirmed());
    }

    #[test]
    fn test_txo_score_follows_spend() {
        let mut txo = Txo::new(Outpoint::default(), 1, vec![], Block::confirmed(5, 1, [0; 32]));
        assert_eq!(txo.score(), score(false, 5, 1));

        txo.spend = Some(Spend {
            txid: [9; 32],
            vin: 0,
            block: Block::confirmed(7, 3, [2; 32]),
        });
        assert_eq!(txo.score(), score(true, 7, 3));
    }

    #[test]
    fn test_outpoint_string_form() {
        let txid =
            Txid::from_str("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
                .unwrap();
        let outpoint = Outpoint::new(txid, 7);
        let text = outpoint.to_string();

        assert_eq!(
            text,
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b_7"
        );
        assert_eq!(Outpoint::from_str(&text).unwrap(), outpoint);
        assert!(Outpoint::from_str("nope").is_err());
        assert_eq!(Outpoint::from_bytes36(&outpoint.to_bytes36()), Some(outpoint));
    }
}
