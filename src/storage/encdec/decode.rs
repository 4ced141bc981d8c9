use super::{Decode, VarUInt};

use indexmap::IndexMap;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DecodingError {
    #[error("Malformed input: {0} ({1:?})")]
    MalformedInput(String, Vec<u8>),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("VarUInt casting: {0}")]
    VarUIntCasting(u128),
    #[error("Enum kind: {0:?}")]
    InvalidEnumKind(Vec<u8>),
    #[error("Unknown data tag: {0}")]
    UnknownTag(String),
}

// Helper method to create MalformedInput error with just a message
pub fn malformed_input<S: Into<String>>(msg: S, bytes: &[u8]) -> DecodingError {
    DecodingError::MalformedInput(msg.into(), bytes.to_vec())
}

pub type DecodingResult<'a, T> = Result<(T, &'a [u8]), DecodingError>;

impl<const N: usize> Decode for [u8; N] {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (head, rest) = bytes
            .split_at_checked(N)
            .ok_or_else(|| malformed_input("array insufficient bytes", bytes))?;

        let mut out = [0u8; N];
        out.copy_from_slice(head);

        Ok((out, rest))
    }
}

impl Decode for u8 {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        bytes
            .split_first()
            .map(|(b, rest)| (*b, rest))
            .ok_or_else(|| malformed_input("u8 insufficient bytes", bytes))
    }
}

impl Decode for bool {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        match u8::decode(bytes)? {
            (0, rest) => Ok((false, rest)),
            (1, rest) => Ok((true, rest)),
            _ => Err(malformed_input("bool out of range", bytes)),
        }
    }
}

impl Decode for () {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        Ok(((), bytes))
    }
}

impl Decode for VarUInt {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (len, rest) = bytes
            .split_first()
            .ok_or_else(|| malformed_input("varuint insufficient bytes", bytes))?;
        let len = *len as usize;

        if len > 16 {
            return Err(malformed_input("varuint len exceeds maximum", bytes));
        }

        let (data, rest) = rest
            .split_at_checked(len)
            .ok_or_else(|| malformed_input("varuint insufficient bytes", bytes))?;

        let mut be_128 = [0u8; 16];
        be_128[16 - len..].copy_from_slice(data);

        Ok((VarUInt(u128::from_be_bytes(be_128)), rest))
    }
}

macro_rules! impl_uint_decode {
    ($t:ty) => {
        impl Decode for $t {
            fn decode(bytes: &[u8]) -> DecodingResult<'_, $t> {
                let (varuint, rem) = VarUInt::decode(bytes)?;

                let casted = Self::try_from(varuint)?;

                Ok((casted, rem))
            }
        }
    };
}

impl_uint_decode!(usize);
impl_uint_decode!(u16);
impl_uint_decode!(u32);
impl_uint_decode!(u64);
impl_uint_decode!(u128);

impl Decode for f64 {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (raw, rest) = <[u8; 8]>::decode(bytes)?;

        Ok((f64::from_bits(u64::from_be_bytes(raw)), rest))
    }
}

impl Decode for String {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (raw, rest) = Vec::<u8>::decode(bytes)?;

        Ok((String::from_utf8(raw)?, rest))
    }
}

impl<A: Decode> Decode for Option<A> {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        match u8::decode(bytes)? {
            (0, rest) => Ok((None, rest)),
            (1, rest) => {
                let (inner, rest) = A::decode(rest)?;
                Ok((Some(inner), rest))
            }
            _ => Err(malformed_input("option marker out of range", bytes)),
        }
    }
}

impl<A: Decode> Decode for Vec<A> {
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let (len, mut bytes) = usize::decode(bytes)?;
        // never trust a length prefix for the allocation size
        let mut vec = Vec::with_capacity(len.min(bytes.len()));

        for _ in 0..len {
            let (item, rest) = A::decode(bytes)?;
            bytes = rest;

            vec.push(item);
        }

        Ok((vec, bytes))
    }
}

impl<K, V> Decode for IndexMap<K, V>
where
    K: Decode + Eq + std::hash::Hash,
    V: Decode,
{
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
        let mut map = IndexMap::new();

        let (len, mut bytes) = usize::decode(bytes)?;

        for _ in 0..len {
            let (key, rest) = K::decode(bytes)?;
            bytes = rest;
            let (value, rest) = V::decode(bytes)?;
            bytes = rest;
            map.insert(key, value);
        }

        Ok((map, bytes))
    }
}

macro_rules! impl_tuple_decode {
    ($($name:ident $var:ident),+) => {
        impl<$($name: Decode),+> Decode for ($($name,)+) {
            fn decode(bytes: &[u8]) -> DecodingResult<'_, Self> {
                $(let ($var, bytes) = <$name as Decode>::decode(bytes)?;)+
                Ok((($($var,)+), bytes))
            }
        }
    };
}

impl_tuple_decode!(A a, B b);
impl_tuple_decode!(A a, B b, C c);
impl_tuple_decode!(A a, B b, C c, D d);
impl_tuple_decode!(A a, B b, C c, D d, E e);
