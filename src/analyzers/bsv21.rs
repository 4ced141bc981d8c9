//! BSV-21 fungible tokens, deployed and transferred through `application/bsv-20` inscriptions.

use std::str::FromStr;

use casemod_indexer_macros::{Decode, Encode};
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::{debug, trace};

use crate::{
    error::Error,
    ingest::{
        context::IndexContext,
        types::{Event, IndexData, Outpoint},
    },
};

use super::{Analyzer, BSV21_TAG, INSCRIPTION_TAG, IndexItem};

pub const BSV20_CONTENT_TYPE: &str = "application/bsv-20";
pub const INSUFFICIENT_INPUTS: &str = "insufficient-inputs";

const MAX_DECIMALS: u8 = 18;

#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Bsv21Op {
    #[serde(rename = "deploy+mint")]
    DeployMint,
    Transfer,
    Burn,
}

impl Bsv21Op {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "deploy+mint" => Some(Self::DeployMint),
            "transfer" => Some(Self::Transfer),
            "burn" => Some(Self::Burn),
            _ => None,
        }
    }

    fn moves_tokens(&self) -> bool {
        matches!(self, Self::Transfer | Self::Burn)
    }
}

#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Bsv21Status {
    Invalid,
    Pending,
    Valid,
}

#[derive(Encode, Decode, Clone, Debug, PartialEq, Serialize)]
pub struct Bsv21 {
    /// Outpoint of the deploy+mint output
    pub id: Outpoint,
    pub op: Bsv21Op,
    pub amt: u64,
    pub dec: u8,
    pub sym: Option<String>,
    pub icon: Option<Outpoint>,
    pub contract: Option<String>,
    pub status: Bsv21Status,
    pub reason: Option<String>,
}

impl Bsv21 {
    fn events(&self) -> Vec<Event> {
        let mut events = vec![Event::new("id", self.id.to_string())];
        if let Some(contract) = &self.contract {
            events.push(Event::new("contract", contract.clone()));
        }
        events
    }
}

/// Token fields of an inscription body. Every value is a JSON string.
fn parse_payload(content: &[u8], own_outpoint: Outpoint) -> Option<Bsv21> {
    let fields: IndexMap<String, String> = serde_json::from_slice(content).ok()?;

    let op = Bsv21Op::parse(fields.get("op")?)?;

    let amt = match fields.get("amt") {
        Some(raw) => match raw.parse::<u64>() {
            Ok(amt) => amt,
            Err(_) => {
                debug!(amt = %raw, "bsv21 amount is not a u64");
                return None;
            }
        },
        None => 0,
    };

    let (id, dec, status) = match op {
        Bsv21Op::DeployMint => {
            let dec = match fields.get("dec") {
                Some(raw) => raw.parse::<u8>().ok().filter(|d| *d <= MAX_DECIMALS)?,
                None => 0,
            };
            (own_outpoint, dec, Bsv21Status::Valid)
        }
        Bsv21Op::Transfer | Bsv21Op::Burn => {
            let id = Outpoint::from_str(fields.get("id")?).ok()?;
            (id, 0, Bsv21Status::Pending)
        }
    };

    Some(Bsv21 {
        id,
        op,
        amt,
        dec,
        sym: fields.get("sym").cloned(),
        icon: fields.get("icon").and_then(|i| Outpoint::from_str(i).ok()),
        contract: fields.get("contract").cloned(),
        status,
        reason: None,
    })
}

/// Tokens a transaction may spend for one id.
struct Funding {
    balance: u64,
    inputs: Vec<Outpoint>,
    /// First valid input, the source of the token's metadata
    token: Bsv21,
}

pub struct Bsv21Analyzer;

impl Analyzer for Bsv21Analyzer {
    fn tag(&self) -> &'static str {
        BSV21_TAG
    }

    fn parse(&self, ctx: &mut IndexContext, vout: usize) -> Result<Option<IndexData>, Error> {
        let txo = &ctx.txos[vout];

        let Some(insc) = txo.item(INSCRIPTION_TAG).and_then(IndexItem::as_inscription) else {
            return Ok(None);
        };

        if insc.file.content_type != BSV20_CONTENT_TYPE {
            return Ok(None);
        }

        let Some(token) = parse_payload(&insc.file.content, txo.outpoint) else {
            return Ok(None);
        };

        let events = token.events();

        Ok(Some(IndexData::new(BSV21_TAG, token).with_events(events)))
    }

    /// Settles transfers against the valid token inputs. Outputs are debited in output order,
    /// and once one output of an id cannot be covered every later output of that id is invalid
    /// as well.
    fn save(&self, ctx: &mut IndexContext) -> Result<(), Error> {
        let mut funding: IndexMap<Outpoint, Funding> = IndexMap::new();

        for spend in &ctx.spends {
            let Some(token) = spend.item(BSV21_TAG).and_then(IndexItem::as_bsv21) else {
                continue;
            };

            if token.status != Bsv21Status::Valid {
                continue;
            }

            let entry = funding.entry(token.id).or_insert_with(|| Funding {
                balance: 0,
                inputs: vec![],
                token: token.clone(),
            });
            entry.balance = entry.balance.saturating_add(token.amt);
            entry.inputs.push(spend.outpoint);
        }

        let mut poisoned: FxHashSet<Outpoint> = FxHashSet::default();

        for txo in ctx.txos.iter_mut() {
            let Some(data) = txo.data.get_mut(BSV21_TAG) else {
                continue;
            };

            let Some(mut token) = data.item().and_then(IndexItem::as_bsv21).cloned() else {
                continue;
            };

            if !token.op.moves_tokens() {
                continue;
            }

            let covered = funding
                .get_mut(&token.id)
                .filter(|f| !poisoned.contains(&token.id) && f.balance >= token.amt);

            match covered {
                Some(source) => {
                    source.balance -= token.amt;

                    token.status = Bsv21Status::Valid;
                    token.sym = source.token.sym.clone();
                    token.dec = source.token.dec;
                    token.icon = source.token.icon;
                    token.contract = source.token.contract.clone();

                    data.deps = source.inputs.clone();
                    data.events = token.events();
                }
                None => {
                    trace!(id = %token.id, outpoint = %txo.outpoint, "bsv21 transfer not covered");
                    poisoned.insert(token.id);

                    token.status = Bsv21Status::Invalid;
                    token.reason = Some(INSUFFICIENT_INPUTS.to_string());

                    data.events.push(Event::new("reason", INSUFFICIENT_INPUTS));
                }
            }

            data.set_item(token);
        }

        Ok(())
    }
}
