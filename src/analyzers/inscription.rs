//! Ordinal inscriptions: `OP_FALSE OP_IF "ord" <field> <value> ... OP_0 <content> OP_ENDIF`.

use std::collections::BTreeSet;

use casemod_indexer_macros::{Decode, Encode};
use indexmap::IndexMap;
use serde::Serialize;

use crate::{
    error::Error,
    ingest::{
        context::IndexContext,
        types::{Event, IndexData, Outpoint, PkHash},
    },
    script::{OP_0, OP_16, OP_CODESEPARATOR, OP_ENDIF, OP_IF, OP_PUSHDATA4, read_op, pkhash_at},
};

use super::{
    Analyzer, File, INSCRIPTION_TAG,
    bitcom::{MAP_PREFIX, map::{Map, parse_map}},
};

const ENVELOPE_MARKER: &[u8] = b"ord";
const MAX_CLASSIFIED_SIZE: usize = 1024;
const MAX_TYPE_LEN: usize = 256;
const MAX_FIELD_NAME_LEN: usize = 64;

const FIELD_CONTENT: i32 = 0;
const FIELD_TYPE: i32 = 1;
const FIELD_POINTER: i32 = 2;
const FIELD_PARENT: i32 = 3;
const FIELD_METAPROTO: i32 = 7;
const FIELD_ENCODING: i32 = 9;

#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    File,
    Text,
    Json,
}

#[derive(Encode, Decode, Clone, Debug, PartialEq, Serialize)]
pub struct Inscription {
    pub file: File,
    pub kind: ContentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<String>,
    pub pointer: Option<u64>,
    pub parent: Option<Outpoint>,
    #[serde(skip)]
    pub metaproto: Option<Vec<u8>>,
    /// Named fields, keyed by their UTF-8 name
    #[serde(skip)]
    pub fields: IndexMap<String, Vec<u8>>,
    /// MAP data embedded as a named field
    pub map: Option<Map>,
}

impl Inscription {
    /// Text content as JSON, when the inscription was classified as such.
    pub fn json_value(&self) -> Option<serde_json::Value> {
        self.json.as_deref().and_then(|j| serde_json::from_str(j).ok())
    }
}

fn field_number(opcode: u8, data: &[u8]) -> Option<i32> {
    if opcode > OP_PUSHDATA4 {
        // OP_1NEGATE lands on -1 and is ignored
        return Some(i32::from(opcode) - 80);
    }

    match data.len() {
        0 => Some(FIELD_CONTENT),
        1 => Some(i32::from(data[0])),
        _ => None,
    }
}

fn is_clean_text(data: &[u8]) -> bool {
    std::str::from_utf8(data).is_ok()
        && !data.contains(&0)
        && !data.windows(6).any(|w| w == b"\\u0000")
}

/// Decodes an envelope whose marker ends at `cursor`. On success the cursor points just after
/// `OP_ENDIF`.
fn parse_envelope(
    script: &[u8],
    cursor: &mut usize,
    spends: &[Outpoint],
) -> Option<(Inscription, Vec<Event>)> {
    let mut pos = *cursor;
    let mut events = vec![];

    let mut content = vec![];
    let mut content_type = String::new();
    let mut encoding = None;
    let mut pointer = None;
    let mut parent = None;
    let mut metaproto = None;
    let mut fields = IndexMap::new();
    let mut map = None;

    loop {
        let field = read_op(script, &mut pos).ok().filter(|op| op.opcode <= OP_16)?;
        let value = read_op(script, &mut pos).ok().filter(|op| op.opcode <= OP_16)?;

        let Some(number) = field_number(field.opcode, field.data) else {
            if field.len() <= MAX_FIELD_NAME_LEN && is_clean_text(field.data) {
                let name = String::from_utf8_lossy(field.data).into_owned();
                fields.insert(name, value.data.to_vec());
            }

            if field.data == MAP_PREFIX {
                map = parse_map(&crate::script::ops(value.data));
            }

            continue;
        };

        match number {
            FIELD_CONTENT => {
                content = value.data.to_vec();
                break;
            }
            FIELD_TYPE => {
                let valid = std::str::from_utf8(value.data)
                    .ok()
                    .filter(|_| value.len() < MAX_TYPE_LEN);

                if let Some(t) = valid {
                    content_type = t.to_string();
                    events.push(Event::new("type", t));
                }
            }
            FIELD_POINTER => {
                let mut le = [0u8; 8];
                let n = value.len().min(8);
                le[..n].copy_from_slice(&value.data[..n]);
                pointer = Some(u64::from_le_bytes(le));
            }
            FIELD_PARENT => {
                // a parent only counts when this transaction spends it
                if let Some(p) = Outpoint::from_bytes36(value.data).filter(|p| spends.contains(p)) {
                    events.push(Event::new("parent", p.to_string()));
                    parent = Some(p);
                }
            }
            FIELD_METAPROTO => metaproto = Some(value.data.to_vec()),
            FIELD_ENCODING => {
                encoding = Some(String::from_utf8_lossy(value.data).into_owned());
            }
            _ => {}
        }
    }

    let end = read_op(script, &mut pos).ok()?;
    if end.opcode != OP_ENDIF {
        return None;
    }

    *cursor = pos;

    let file = File::new(content, content_type, encoding);
    let (kind, text, json) = classify(&file, &mut events);

    let inscription = Inscription {
        file,
        kind,
        text,
        json,
        pointer,
        parent,
        metaproto,
        fields,
        map,
    };

    Some((inscription, events))
}

/// Small UTF-8 application and text payloads are classified as JSON when they parse, or as text
/// when they are plain ASCII. Text is indexed by its lowercased words.
fn classify(file: &File, events: &mut Vec<Event>) -> (ContentKind, Option<String>, Option<String>) {
    let none = (ContentKind::File, None, None);

    if file.content.len() > MAX_CLASSIFIED_SIZE || !is_clean_text(&file.content) {
        return none;
    }

    let mime = file.content_type.to_lowercase();
    if !mime.starts_with("application") && !mime.starts_with("text") {
        return none;
    }

    let Ok(body) = std::str::from_utf8(&file.content) else {
        return none;
    };

    if serde_json::from_str::<serde_json::Value>(body).is_ok() {
        return (ContentKind::Json, None, Some(body.to_string()));
    }

    if !body.is_ascii() {
        return none;
    }

    let words = body
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<BTreeSet<_>>();

    events.extend(words.into_iter().map(|w| Event::new("word", w)));

    (ContentKind::Text, Some(body.to_string()), None)
}

pub struct InscriptionAnalyzer;

impl Analyzer for InscriptionAnalyzer {
    fn tag(&self) -> &'static str {
        INSCRIPTION_TAG
    }

    fn parse(&self, ctx: &mut IndexContext, vout: usize) -> Result<Option<IndexData>, Error> {
        let spends = ctx.spends.iter().map(|s| s.outpoint).collect::<Vec<_>>();
        let txo = &mut ctx.txos[vout];
        let script = txo.script.as_slice();

        let mut cursor = 0;
        while cursor < script.len() {
            let start = cursor;
            let Ok(op) = read_op(script, &mut cursor) else {
                break;
            };

            let opens_envelope = op.data == ENVELOPE_MARKER
                && start >= 2
                && script[start - 2] == OP_0
                && script[start - 1] == OP_IF;
            if !opens_envelope {
                continue;
            }

            let Some((inscription, events)) = parse_envelope(script, &mut cursor, &spends) else {
                continue;
            };

            if txo.owner.is_none() {
                let owner = pkhash_at(script, cursor).or_else(|| {
                    (script.get(cursor) == Some(&OP_CODESEPARATOR))
                        .then(|| pkhash_at(script, cursor + 1))
                        .flatten()
                });
                txo.owner = owner.map(PkHash);
            }

            let data = IndexData::new(INSCRIPTION_TAG, inscription).with_events(events);
            return Ok(Some(data));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analyzers::IndexItem,
        ingest::types::{Block, Txo},
        script::{p2pkh, push},
        test_utils::{coinbase, context_for, inscription_script},
    };

    fn parse_script(script: Vec<u8>) -> (Option<IndexData>, Option<PkHash>) {
        let tx = coinbase(1, vec![(1, script)]);
        let mut ctx = context_for(&tx, Block::default());
        ctx.txos[0].owner = None;

        let data = InscriptionAnalyzer.parse(&mut ctx, 0).unwrap();
        (data, ctx.txos[0].owner)
    }

    fn inscription(data: &IndexData) -> &Inscription {
        match data.item() {
            Some(IndexItem::Inscription(i)) => i,
            other => panic!("expected inscription, got {other:?}"),
        }
    }

    #[test]
    fn test_text_inscription_words() {
        let script = inscription_script(None, "text/plain;charset=utf-8", b"Hello, hello WORLD_1!");
        let (data, _) = parse_script(script);
        let data = data.unwrap();
        let insc = inscription(&data);

        assert_eq!(insc.kind, ContentKind::Text);
        assert_eq!(insc.file.size, 21);
        assert!(data.has_event("type", "text/plain;charset=utf-8"));
        assert!(data.has_event("word", "hello"));
        assert!(data.has_event("word", "world_1"));
        assert_eq!(data.events.iter().filter(|e| e.label == "word").count(), 2);
    }

    #[test]
    fn test_json_and_binary_content() {
        let (data, _) = parse_script(inscription_script(None, "application/json", br#"{"a":1}"#));
        let data = data.unwrap();
        assert_eq!(inscription(&data).kind, ContentKind::Json);
        assert!(inscription(&data).json_value().is_some());

        let (data, _) = parse_script(inscription_script(None, "image/png", &[0x89, 0x50, 0x4e, 0x47]));
        assert_eq!(inscription(&data.unwrap()).kind, ContentKind::File);
    }

    #[test]
    fn test_owner_after_envelope() {
        let owner = [8u8; 20];

        let mut script = inscription_script(None, "text/plain", b"x");
        script.extend(p2pkh(owner));
        let (_, found) = parse_script(script);
        assert_eq!(found, Some(PkHash(owner)));

        let mut script = inscription_script(None, "text/plain", b"x");
        script.push(OP_CODESEPARATOR);
        script.extend(p2pkh(owner));
        let (_, found) = parse_script(script);
        assert_eq!(found, Some(PkHash(owner)));
    }

    #[test]
    fn test_missing_endif_rejected() {
        let mut script = vec![OP_0, OP_IF];
        script.extend(push(b"ord"));
        script.push(0x51);
        script.extend(push(b"text/plain"));
        script.push(OP_0);
        script.extend(push(b"body"));

        assert!(parse_script(script).0.is_none());
    }

    #[test]
    fn test_embedded_map_and_named_fields() {
        let map_script = [push(b"SET"), push(b"app"), push(b"casemod")].concat();

        let mut script = vec![OP_0, OP_IF];
        script.extend(push(b"ord"));
        script.extend(push(MAP_PREFIX));
        script.extend(push(&map_script));
        script.extend(push(b"note"));
        script.extend(push(b"kept"));
        script.push(OP_0);
        script.extend(push(b"body"));
        script.push(OP_ENDIF);

        let (data, _) = parse_script(script);
        let data = data.unwrap();
        let insc = inscription(&data);

        assert_eq!(insc.map.as_ref().and_then(|m| m.get("app")), Some("casemod"));
        assert_eq!(insc.fields.get("note").map(Vec::as_slice), Some(b"kept".as_slice()));
        assert_eq!(insc.file.content, b"body");
    }

    #[test]
    fn test_parent_requires_spend() {
        let parent = Outpoint {
            txid: [5; 32],
            vout: 2,
        };

        let mut script = vec![OP_0, OP_IF];
        script.extend(push(b"ord"));
        script.push(0x53);
        script.extend(push(&parent.to_bytes36()));
        script.push(OP_0);
        script.extend(push(b"child"));
        script.push(OP_ENDIF);

        let tx = coinbase(1, vec![(1, script)]);

        let mut ctx = context_for(&tx, Block::default());
        let data = InscriptionAnalyzer.parse(&mut ctx, 0).unwrap().unwrap();
        assert_eq!(inscription(&data).parent, None);

        let mut ctx = context_for(&tx, Block::default());
        ctx.spends.push(Txo::new(parent, 1, vec![], Block::default()));
        let data = InscriptionAnalyzer.parse(&mut ctx, 0).unwrap().unwrap();
        assert_eq!(inscription(&data).parent, Some(parent));
        assert!(data.has_event("parent", &parent.to_string()));
    }
}
