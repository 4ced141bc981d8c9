use std::sync::Arc;

use bitcoin::hashes::{Hash, sha256};
use casemod_indexer_macros::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::{
    DecodingError,
    error::Error,
    ingest::{context::IndexContext, loader::TxoLoader, types::{IndexData, Score, Txo}},
    storage::encdec::{Decode as _, Encode},
};

pub mod bitcom;
pub mod bsv21;
pub mod inscription;
pub mod ordlock;
pub mod origin;

use bitcom::{b::BFile, b::BAnalyzer, map::Map, map::MapAnalyzer};
use bsv21::{Bsv21, Bsv21Analyzer};
use inscription::{Inscription, InscriptionAnalyzer};
use ordlock::{Listing, OrdLockAnalyzer};
use origin::{Origin, OriginAnalyzer, OriginConfig};

pub const INSCRIPTION_TAG: &str = "insc";
pub const MAP_TAG: &str = "map";
pub const B_TAG: &str = "b";
pub const ORIGIN_TAG: &str = "origin";
pub const BSV21_TAG: &str = "bsv21";
pub const LISTING_TAG: &str = "list";

/// A protocol decoder plugged into the ingest pipeline.
///
/// `parse` runs once per output, in output order, and sees whatever earlier analyzers attached to
/// that output. `save` runs once per transaction after every output was parsed, for protocols
/// whose result depends on the transaction as a whole.
pub trait Analyzer: Send + Sync {
    fn tag(&self) -> &'static str;

    fn parse(&self, ctx: &mut IndexContext, vout: usize) -> Result<Option<IndexData>, Error>;

    fn save(&self, _ctx: &mut IndexContext) -> Result<(), Error> {
        Ok(())
    }

    /// Sort key of this analyzer's event entries for `txo`.
    fn score(&self, txo: &Txo) -> Score {
        txo.score()
    }

    fn unmarshal_data(&self, raw: &[u8]) -> Result<IndexItem, DecodingError> {
        IndexItem::unmarshal(self.tag(), raw)?
            .ok_or_else(|| DecodingError::UnknownTag(self.tag().to_string()))
    }
}

/// Typed result of one of the built-in analyzers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum IndexItem {
    Inscription(Inscription),
    Map(Map),
    B(BFile),
    Origin(Origin),
    Bsv21(Bsv21),
    Listing(Listing),
}

impl IndexItem {
    /// Decodes the stored bytes of `tag`, `None` for tags without a built-in analyzer.
    pub fn unmarshal(tag: &str, raw: &[u8]) -> Result<Option<Self>, DecodingError> {
        let item = match tag {
            INSCRIPTION_TAG => Self::Inscription(Inscription::decode_all(raw)?),
            MAP_TAG => Self::Map(Map::decode_all(raw)?),
            B_TAG => Self::B(BFile::decode_all(raw)?),
            ORIGIN_TAG => Self::Origin(Origin::decode_all(raw)?),
            BSV21_TAG => Self::Bsv21(Bsv21::decode_all(raw)?),
            LISTING_TAG => Self::Listing(Listing::decode_all(raw)?),
            _ => return Ok(None),
        };

        Ok(Some(item))
    }

    pub fn as_inscription(&self) -> Option<&Inscription> {
        match self {
            Self::Inscription(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Self::Map(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_b(&self) -> Option<&BFile> {
        match self {
            Self::B(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_origin(&self) -> Option<&Origin> {
        match self {
            Self::Origin(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_bsv21(&self) -> Option<&Bsv21> {
        match self {
            Self::Bsv21(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_listing(&self) -> Option<&Listing> {
        match self {
            Self::Listing(x) => Some(x),
            _ => None,
        }
    }
}

// the tag already tells the variant apart, so only the inner item is stored
impl Encode for IndexItem {
    fn encode(&self) -> Vec<u8> {
        match self {
            Self::Inscription(x) => x.encode(),
            Self::Map(x) => x.encode(),
            Self::B(x) => x.encode(),
            Self::Origin(x) => x.encode(),
            Self::Bsv21(x) => x.encode(),
            Self::Listing(x) => x.encode(),
        }
    }
}

macro_rules! impl_into_index_item {
    ($variant:ident, $type:ty) => {
        impl From<$type> for IndexItem {
            fn from(item: $type) -> Self {
                IndexItem::$variant(item)
            }
        }
    };
}

impl_into_index_item!(Inscription, Inscription);
impl_into_index_item!(Map, Map);
impl_into_index_item!(B, BFile);
impl_into_index_item!(Origin, Origin);
impl_into_index_item!(Bsv21, Bsv21);
impl_into_index_item!(Listing, Listing);

/// File payload carried by an inscription or a B protocol output.
#[derive(Encode, Decode, Clone, Debug, PartialEq, Serialize)]
pub struct File {
    #[serde(serialize_with = "serialize_hex")]
    pub hash: [u8; 32],
    pub size: u32,
    #[serde(rename = "type")]
    pub content_type: String,
    pub encoding: Option<String>,
    #[serde(skip)]
    pub content: Vec<u8>,
}

impl File {
    pub fn new(content: Vec<u8>, content_type: String, encoding: Option<String>) -> Self {
        Self {
            hash: sha256::Hash::hash(&content).to_byte_array(),
            size: content.len() as u32,
            content_type,
            encoding,
            content,
        }
    }
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum AnalyzerFactory {
    Inscription,
    Map,
    B,
    Origin(OriginConfig),
    Bsv21,
    OrdLock,
}

impl AnalyzerFactory {
    /// Every built-in analyzer, in an order where each one runs after those it reads from.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::Inscription,
            Self::Map,
            Self::B,
            Self::Origin(OriginConfig::default()),
            Self::Bsv21,
            Self::OrdLock,
        ]
    }

    pub fn create_analyzer(self, loader: &TxoLoader) -> Result<Arc<dyn Analyzer>, Error> {
        let analyzer: Arc<dyn Analyzer> = match self {
            Self::Inscription => Arc::new(InscriptionAnalyzer),
            Self::Map => Arc::new(MapAnalyzer),
            Self::B => Arc::new(BAnalyzer),
            Self::Origin(config) => Arc::new(OriginAnalyzer::new(loader.clone(), config)),
            Self::Bsv21 => Arc::new(Bsv21Analyzer),
            Self::OrdLock => Arc::new(OrdLockAnalyzer),
        };

        Ok(analyzer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ingest::{Config, store::TxoStore},
        test_utils::TestStore,
    };

    struct Named(&'static str);

    impl Analyzer for Named {
        fn tag(&self) -> &'static str {
            self.0
        }

        fn parse(&self, _ctx: &mut IndexContext, _vout: usize) -> Result<Option<IndexData>, Error> {
            Ok(None)
        }
    }

    #[test]
    fn test_duplicate_tags_rejected() {
        let test = TestStore::new(vec![], 0);
        let analyzers: Vec<Arc<dyn Analyzer>> = vec![Arc::new(Named("x")), Arc::new(Named("x"))];

        let res = TxoStore::with_analyzers(test.store.loader().clone(), analyzers, 0);
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn test_factories_from_config() {
        let raw = r#"
            max_ancestor_depth = 3

            [[analyzers]]
            type = "Inscription"

            [[analyzers]]
            type = "Origin"
            max_depth = 10
        "#;

        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.max_ancestor_depth, 3);
        assert_eq!(
            config.analyzers,
            vec![
                AnalyzerFactory::Inscription,
                AnalyzerFactory::Origin(OriginConfig { max_depth: Some(10) }),
            ]
        );
    }

    #[test]
    fn test_unknown_tag_stays_opaque() {
        assert_eq!(IndexItem::unmarshal("sigma", &[1, 2, 3]).unwrap(), None);
        assert!(IndexItem::unmarshal(ORIGIN_TAG, &[1, 2, 3]).is_err());
    }
}
