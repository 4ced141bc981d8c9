//! OrdLock listings: a 1sat output locked by a contract that releases it to whoever pays the
//! seller's payout output.

use std::sync::LazyLock;

use bitcoin::{TxOut, consensus};
use casemod_indexer_macros::{Decode, Encode};
use serde::Serialize;
use tracing::trace;

use crate::{
    error::Error,
    ingest::{
        context::IndexContext,
        types::{Event, IndexData, PkHash},
    },
    script::ops,
};

use super::{Analyzer, BSV21_TAG, IndexItem, LISTING_TAG, bsv21::Bsv21Status};

const ORDLOCK_PREFIX_HEX: &str = "2097dfd76851bf465e8f715593b217714858bbe9570ff3bd5e33840a34e20ff0262102ba79df5f8ae7604a9830f03c7933028186aede0675a16f025dc4f8be8eec0382201008ce7480da41702918d1ec8e6849ba32b4d65b1e40dc669c31a1e6306b266c0000";
const ORDLOCK_SUFFIX_HEX: &str = "615179547a75537a537a537a0079537a75527a527a7575615579008763567901c161517957795779210ac407f0e4bd44bfc207355a778b046225a7068fc59ee7eda43ad905aadbffc800206c266b30e6a1319c66dc401e5bd6b432ba49688eecd118297041da8074ce081059795679615679aa0079610079517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e01007e81517a75615779567956795679567961537956795479577995939521414136d08c5ed2bf3ba048afe6dcaebafeffffffffffffffffffffffffffffff00517951796151795179970079009f63007952799367007968517a75517a75517a7561527a75517a517951795296a0630079527994527a75517a6853798277527982775379012080517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e01205279947f7754537993527993013051797e527e54797e58797e527e53797e52797e57797e0079517a75517a75517a75517a75517a75517a75517a75517a75517a75517a75517a75517a75517a756100795779ac517a75517a75517a75517a75517a75517a75517a75517a75517a7561517a75517a756169587951797e58797eaa577961007982775179517958947f7551790128947f77517a75517a75618777777777777777777767557951876351795779a9876957795779ac777777777777777767006868";

static ORDLOCK_PREFIX: LazyLock<Vec<u8>> =
    LazyLock::new(|| hex::decode(ORDLOCK_PREFIX_HEX).unwrap_or_default());
static ORDLOCK_SUFFIX: LazyLock<Vec<u8>> =
    LazyLock::new(|| hex::decode(ORDLOCK_SUFFIX_HEX).unwrap_or_default());

#[derive(Encode, Decode, Clone, Debug, PartialEq, Serialize)]
pub struct Listing {
    /// Satoshis the seller asks for
    pub price: u64,
    /// Serialized output the buyer must create
    #[serde(serialize_with = "serialize_hex")]
    pub pay_out: Vec<u8>,
    /// Price per whole token when the listed output carries BSV-21 tokens
    pub price_per: Option<f64>,
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }

    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Seller and payout output of an OrdLock script.
fn parse_ordlock(script: &[u8]) -> Option<([u8; 20], Vec<u8>, TxOut)> {
    let start = find(script, &ORDLOCK_PREFIX)? + ORDLOCK_PREFIX.len();
    let end = find(script, &ORDLOCK_SUFFIX)?;

    let params = ops(script.get(start..end)?);
    let (seller, pay_out) = match params.as_slice() {
        [seller, pay_out, ..] => (seller, pay_out),
        _ => return None,
    };

    let seller: [u8; 20] = seller.data.try_into().ok()?;
    let payout = consensus::deserialize::<TxOut>(pay_out.data).ok()?;

    Some((seller, pay_out.data.to_vec(), payout))
}

pub struct OrdLockAnalyzer;

impl Analyzer for OrdLockAnalyzer {
    fn tag(&self) -> &'static str {
        LISTING_TAG
    }

    fn parse(&self, ctx: &mut IndexContext, vout: usize) -> Result<Option<IndexData>, Error> {
        let txo = &mut ctx.txos[vout];

        let Some((seller, pay_out, payout)) = parse_ordlock(&txo.script) else {
            return Ok(None);
        };

        let price = payout.value.to_sat();

        trace!(outpoint = %txo.outpoint, price, "ordlock listing");

        txo.owner = Some(PkHash(seller));

        let event = Event::new("listing", txo.outpoint.to_string());
        let listing = Listing {
            price,
            pay_out,
            price_per: None,
        };

        Ok(Some(IndexData::new(LISTING_TAG, listing).with_events(vec![event])))
    }

    /// Prices listed tokens per whole unit, once transfers are settled and carry their decimals.
    fn save(&self, ctx: &mut IndexContext) -> Result<(), Error> {
        for txo in ctx.txos.iter_mut() {
            let Some(mut listing) = txo.item(LISTING_TAG).and_then(IndexItem::as_listing).cloned()
            else {
                continue;
            };

            listing.price_per = txo
                .item(BSV21_TAG)
                .and_then(IndexItem::as_bsv21)
                .filter(|token| token.status == Bsv21Status::Valid && token.amt > 0)
                .map(|token| {
                    listing.price as f64 / (token.amt as f64 / 10f64.powi(i32::from(token.dec)))
                });

            if let Some(data) = txo.data.get_mut(LISTING_TAG) {
                data.set_item(listing);
            }
        }

        Ok(())
    }
}
