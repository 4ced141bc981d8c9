//! Locking script primitives shared by every protocol decoder.

use thiserror::Error;

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_IF: u8 = 0x63;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CODESEPARATOR: u8 = 0xab;
pub const OP_CHECKSIG: u8 = 0xac;

const P2PKH_LEN: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("no operation at offset {0}")]
    EndOfScript(usize),
    #[error("operation at offset {at} declares {declared} bytes but the script ends first")]
    Truncated { at: usize, declared: usize },
}

/// One decoded script operation. `data` borrows the pushed payload, and is empty for opcodes that
/// carry none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Op<'a> {
    pub opcode: u8,
    pub data: &'a [u8],
}

impl Op<'_> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bitcom protocol separator: a single byte push of `|`.
    pub fn is_separator(&self) -> bool {
        self.opcode == 1 && self.data == b"|"
    }

    /// Small integer value of `OP_1`..`OP_16`.
    pub fn small_int(&self) -> Option<u8> {
        (OP_1..=OP_16)
            .contains(&self.opcode)
            .then(|| self.opcode - OP_1 + 1)
    }
}

/// Reads the operation starting at `cursor`.
///
/// On success the cursor is moved past the whole operation. On failure it is left where it was,
/// so callers can stop at the last complete operation.
pub fn read_op<'a>(script: &'a [u8], cursor: &mut usize) -> Result<Op<'a>, ScriptError> {
    let at = *cursor;
    let opcode = *script.get(at).ok_or(ScriptError::EndOfScript(at))?;

    let (len_width, declared) = match opcode {
        0x01..=0x4b => (0, opcode as usize),
        OP_PUSHDATA1 => (1, read_le_len(script, at, 1)?),
        OP_PUSHDATA2 => (2, read_le_len(script, at, 2)?),
        OP_PUSHDATA4 => (4, read_le_len(script, at, 4)?),
        _ => {
            *cursor = at + 1;
            return Ok(Op { opcode, data: &[] });
        }
    };

    let start = at + 1 + len_width;
    let data = start
        .checked_add(declared)
        .and_then(|end| script.get(start..end))
        .ok_or(ScriptError::Truncated { at, declared })?;

    *cursor = start + declared;

    Ok(Op { opcode, data })
}

fn read_le_len(script: &[u8], at: usize, width: usize) -> Result<usize, ScriptError> {
    let raw = script
        .get(at + 1..at + 1 + width)
        .ok_or(ScriptError::Truncated { at, declared: width })?;

    let mut le = [0u8; 8];
    le[..width].copy_from_slice(raw);

    Ok(u64::from_le_bytes(le) as usize)
}

/// Decodes every operation of a script, stopping silently at the first malformed one.
pub fn ops(script: &[u8]) -> Vec<Op<'_>> {
    let mut cursor = 0;
    let mut out = Vec::new();

    while let Ok(op) = read_op(script, &mut cursor) {
        out.push(op);
    }

    out
}

/// Public key hash of a standard pay-to-pubkey-hash template at `pos`.
pub fn pkhash_at(script: &[u8], pos: usize) -> Option<[u8; 20]> {
    let template = script.get(pos..pos.checked_add(P2PKH_LEN)?)?;

    let matches = template[0] == OP_DUP
        && template[1] == OP_HASH160
        && template[2] == 20
        && template[23] == OP_EQUALVERIFY
        && template[24] == OP_CHECKSIG;

    matches.then(|| {
        let mut pkhash = [0u8; 20];
        pkhash.copy_from_slice(&template[3..23]);
        pkhash
    })
}

/// Owner of a script whose first 25 bytes are a pay-to-pubkey-hash template.
pub fn pkhash_from_script(script: &[u8]) -> Option<[u8; 20]> {
    pkhash_at(script, 0)
}

#[cfg(test)]
pub(crate) fn push(data: &[u8]) -> Vec<u8> {
    let len = data.len();
    let mut out = match len {
        0 => vec![OP_0],
        1..=0x4b => vec![len as u8],
        0x4c..=0xff => vec![OP_PUSHDATA1, len as u8],
        0x100..=0xffff => [vec![OP_PUSHDATA2], (len as u16).to_le_bytes().to_vec()].concat(),
        _ => [vec![OP_PUSHDATA4], (len as u32).to_le_bytes().to_vec()].concat(),
    };
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
pub(crate) fn p2pkh(pkhash: [u8; 20]) -> Vec<u8> {
    [
        vec![OP_DUP, OP_HASH160, 20],
        pkhash.to_vec(),
        vec![OP_EQUALVERIFY, OP_CHECKSIG],
    ]
    .concat()
}
