//! Bitcom protocols: data pushed after `OP_RETURN`, each section introduced by a protocol prefix
//! and separated from the next by a `|` push.

use crate::script::{OP_RETURN, Op, ops};

pub mod b;
pub mod map;

pub const MAP_PREFIX: &[u8] = b"1PuQa7K62MiKCtssSLKy1kh56WWU7MtUR5";
pub const B_PREFIX: &[u8] = b"19HxigV4QyBv3tHpQVcUEQyq1pzZVdoAut";

/// One protocol section of a bitcom script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section<'a> {
    pub prefix: &'a [u8],
    pub ops: Vec<Op<'a>>,
}

/// Every protocol section of `script`, in script order. Scripts without `OP_RETURN` have none.
pub fn sections(script: &[u8]) -> Vec<Section<'_>> {
    let all = ops(script);

    let Some(start) = all.iter().position(|op| op.opcode == OP_RETURN) else {
        return vec![];
    };

    all[start + 1..]
        .split(|op| op.is_separator() || op.opcode == OP_RETURN)
        .filter_map(|chunk| {
            let (prefix, rest) = chunk.split_first()?;
            Some(Section {
                prefix: prefix.data,
                ops: rest.to_vec(),
            })
        })
        .collect()
}

/// First section using `prefix`.
pub fn find_section<'a>(script: &'a [u8], prefix: &[u8]) -> Option<Section<'a>> {
    sections(script).into_iter().find(|s| s.prefix == prefix)
}
