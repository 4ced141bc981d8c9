use casemod_indexer_macros::{Decode, Encode};
use serde::Serialize;

use crate::{
    analyzers::{Analyzer, B_TAG, File},
    error::Error,
    ingest::{context::IndexContext, types::IndexData},
};

use super::{B_PREFIX, find_section};

/// File stored on chain through the B protocol.
#[derive(Encode, Decode, Clone, Debug, PartialEq, Serialize)]
pub struct BFile {
    #[serde(flatten)]
    pub file: File,
    pub name: Option<String>,
}

pub struct BAnalyzer;

impl Analyzer for BAnalyzer {
    fn tag(&self) -> &'static str {
        B_TAG
    }

    fn parse(&self, ctx: &mut IndexContext, vout: usize) -> Result<Option<IndexData>, Error> {
        let Some(section) = find_section(&ctx.txos[vout].script, B_PREFIX) else {
            return Ok(None);
        };

        // content, media type, encoding, filename
        let mut fields = section.ops.iter().map(|op| op.data);
        let Some(content) = fields.next() else {
            return Ok(None);
        };

        let text = |raw: &[u8]| String::from_utf8_lossy(raw).into_owned();
        let content_type = fields.next().map(text).unwrap_or_default();
        let encoding = fields.next().map(text).filter(|e| !e.is_empty());
        let name = fields.next().map(text).filter(|n| !n.is_empty());

        let file = File::new(content.to_vec(), content_type, encoding);

        Ok(Some(IndexData::new(B_TAG, BFile { file, name })))
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::{Hash, sha256};

    use super::*;
    use crate::{
        analyzers::IndexItem,
        ingest::types::Block,
        script::{OP_RETURN, push},
        test_utils::{coinbase, context_for},
    };

    #[test]
    fn test_b_file() {
        let mut script = vec![0x00, OP_RETURN];
        script.extend(push(B_PREFIX));
        script.extend(push(b"# hello"));
        script.extend(push(b"text/markdown"));
        script.extend(push(b"utf-8"));
        script.extend(push(b"readme.md"));

        let tx = coinbase(1, vec![(0, script)]);
        let mut ctx = context_for(&tx, Block::default());

        let data = BAnalyzer.parse(&mut ctx, 0).unwrap().unwrap();
        let Some(IndexItem::B(b)) = data.item() else {
            panic!("expected b file");
        };

        assert_eq!(b.file.content, b"# hello");
        assert_eq!(b.file.content_type, "text/markdown");
        assert_eq!(b.file.encoding.as_deref(), Some("utf-8"));
        assert_eq!(b.name.as_deref(), Some("readme.md"));
        assert_eq!(b.file.hash, sha256::Hash::hash(b"# hello").to_byte_array());
        assert!(data.events.is_empty());
    }

    #[test]
    fn test_no_b_section() {
        let tx = coinbase(1, vec![(1, vec![OP_RETURN])]);
        let mut ctx = context_for(&tx, Block::default());

        assert!(BAnalyzer.parse(&mut ctx, 0).unwrap().is_none());
    }
}
