use casemod_indexer_macros::{Decode, Encode};

use crate::define_core_table;

use super::types::{Block, Event, Outpoint, PkHash, Score, Spend};

#[repr(u8)]
pub enum CoreTables {
    Txo = 0,
    Spend = 1,
    TxoData = 2,
    EventIndex = 3,
    OwnerEventIndex = 4,
    OwnerTxo = 5,
    TxLog = 6,
    RawTx = 7,
}

// ----------

#[derive(Encode, Decode, Clone, Debug, PartialEq)]
pub struct TxoRecord {
    pub satoshis: u64,
    pub script: Vec<u8>,
    pub block: Block,
    pub owner: Option<PkHash>,
    /// Score the secondary entries of this output were last written with
    pub score: Score,
}

define_core_table! {
    name: TxoKV,
    key_type: Outpoint,
    value_type: TxoRecord,
    table: CoreTables::Txo
}

// ----------

define_core_table! {
    name: SpendKV,
    key_type: Outpoint,
    value_type: Spend,
    table: CoreTables::Spend
}

// ----------

#[derive(Encode, Decode, Clone, Debug, PartialEq)]
pub struct TxoDataKey {
    pub outpoint: Outpoint,
    pub tag: String,
}

#[derive(Encode, Decode, Clone, Debug, PartialEq)]
pub struct TxoDataRecord {
    pub data: Vec<u8>,
    pub events: Vec<Event>,
    pub deps: Vec<Outpoint>,
    pub score: Score,
    pub owner: Option<PkHash>,
}

define_core_table! {
    name: TxoDataKV,
    key_type: TxoDataKey,
    value_type: TxoDataRecord,
    table: CoreTables::TxoData
}

// ----------

#[derive(Encode, Decode, Clone, Debug, PartialEq)]
pub struct EventKey {
    pub tag: String,
    pub label: String,
    pub value: String,
    pub score: Score,
    pub outpoint: Outpoint,
}

define_core_table! {
    name: EventIndexKV,
    key_type: EventKey,
    value_type: (),
    table: CoreTables::EventIndex
}

// ----------

#[derive(Encode, Decode, Clone, Debug, PartialEq)]
pub struct OwnerEventKey {
    pub owner: PkHash,
    pub tag: String,
    pub label: String,
    pub value: String,
    pub score: Score,
    pub outpoint: Outpoint,
}

define_core_table! {
    name: OwnerEventIndexKV,
    key_type: OwnerEventKey,
    value_type: (),
    table: CoreTables::OwnerEventIndex
}

// ----------

#[derive(Encode, Decode, Clone, Debug, PartialEq)]
pub struct OwnerTxoKey {
    pub owner: PkHash,
    pub score: Score,
    pub outpoint: Outpoint,
}

define_core_table! {
    name: OwnerTxoKV,
    key_type: OwnerTxoKey,
    value_type: (),
    table: CoreTables::OwnerTxo
}

// ----------

/// Presence marks a transaction as ingested.
#[derive(Encode, Decode, Clone, Debug, PartialEq)]
pub struct TxLogEntry {
    pub block: Block,
}

define_core_table! {
    name: TxLogKV,
    key_type: [u8; 32],
    value_type: TxLogEntry,
    table: CoreTables::TxLog
}

// ----------

define_core_table! {
    name: RawTxKV,
    key_type: [u8; 32],
    value_type: Vec<u8>,
    table: CoreTables::RawTx
}
