use casemod_indexer_macros::{Decode, Encode};
use indexmap::IndexMap;
use serde::Serialize;

use crate::{
    analyzers::{Analyzer, INSCRIPTION_TAG, IndexItem, MAP_TAG},
    error::Error,
    ingest::{context::IndexContext, types::IndexData},
    script::{OP_RETURN, Op},
};

use super::{MAP_PREFIX, find_section};

const MAX_KEY_LEN: usize = 256;
const MAX_VALUE_LEN: usize = 1024;

/// Key/value metadata set through the MAP protocol.
#[derive(Encode, Decode, Clone, Debug, Default, PartialEq, Serialize)]
pub struct Map(pub IndexMap<String, String>);

impl Map {
    /// Later keys win.
    pub fn merge(&mut self, other: &Map) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn map_value(data: &[u8]) -> Option<String> {
    // a lone zero byte stands for the empty string
    if data == [0] {
        return Some(String::new());
    }

    String::from_utf8(data.to_vec()).ok()
}

/// Reads a `SET` command from the ops following the MAP prefix. Pairs with an oversized or
/// non-UTF-8 key or value are skipped.
pub fn parse_map(ops: &[Op]) -> Option<Map> {
    let (cmd, pairs) = ops.split_first()?;
    if cmd.data != b"SET" {
        return None;
    }

    let mut map = Map::default();

    for pair in pairs.chunks_exact(2) {
        let (key, value) = (&pair[0], &pair[1]);
        if key.opcode == OP_RETURN || key.is_separator() {
            break;
        }

        if key.len() > MAX_KEY_LEN || value.len() > MAX_VALUE_LEN {
            continue;
        }

        let (Some(key), Some(value)) = (map_value(key.data), map_value(value.data)) else {
            continue;
        };

        map.0.insert(key, value);
    }

    Some(map)
}

pub struct MapAnalyzer;

impl Analyzer for MapAnalyzer {
    fn tag(&self) -> &'static str {
        MAP_TAG
    }

    fn parse(&self, ctx: &mut IndexContext, vout: usize) -> Result<Option<IndexData>, Error> {
        let txo = &ctx.txos[vout];

        let map = match find_section(&txo.script, MAP_PREFIX) {
            Some(section) => parse_map(&section.ops),
            None => txo
                .item(INSCRIPTION_TAG)
                .and_then(IndexItem::as_inscription)
                .and_then(|insc| insc.map.clone()),
        };

        Ok(map
            .filter(|m| !m.is_empty())
            .map(|m| IndexData::new(MAP_TAG, m)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{ops, push};

    fn set_ops(pairs: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
        let mut script = push(b"SET");
        for (k, v) in pairs {
            script.extend(push(k));
            script.extend(push(v));
        }
        script
    }

    #[test]
    fn test_parse_set() {
        let script = set_ops(&[
            (b"app".to_vec(), b"casemod".to_vec()),
            (b"type".to_vec(), b"ord".to_vec()),
            (b"empty".to_vec(), vec![0]),
        ]);
        let map = parse_map(&ops(&script)).unwrap();

        assert_eq!(map.get("app"), Some("casemod"));
        assert_eq!(map.get("type"), Some("ord"));
        assert_eq!(map.get("empty"), Some(""));
    }

    #[test]
    fn test_skips_bad_pairs() {
        let long_value = vec![b'v'; MAX_VALUE_LEN + 1];
        let script = set_ops(&[
            (b"big".to_vec(), long_value),
            (vec![0xff, 0xfe], b"x".to_vec()),
            (b"ok".to_vec(), b"yes".to_vec()),
        ]);
        let map = parse_map(&ops(&script)).unwrap();

        assert_eq!(map.0.len(), 1);
        assert_eq!(map.get("ok"), Some("yes"));
    }

    #[test]
    fn test_requires_set() {
        let script = [push(b"ADD"), push(b"k"), push(b"v")].concat();
        assert!(parse_map(&ops(&script)).is_none());
    }

    #[test]
    fn test_merge_overrides() {
        let mut base = Map(IndexMap::from([("a".to_string(), "1".to_string())]));
        base.merge(&Map(IndexMap::from([
            ("a".to_string(), "2".to_string()),
            ("b".to_string(), "3".to_string()),
        ])));

        assert_eq!(base.get("a"), Some("2"));
        assert_eq!(base.get("b"), Some("3"));
    }
}
