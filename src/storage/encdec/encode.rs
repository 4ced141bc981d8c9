use indexmap::IndexMap;

use super::{Encode, VarUInt};

impl<const N: usize> Encode for [u8; N] {
    fn encode(&self) -> Vec<u8> {
        self.to_vec()
    }
}

impl Encode for u8 {
    fn encode(&self) -> Vec<u8> {
        vec![*self]
    }
}

impl Encode for bool {
    fn encode(&self) -> Vec<u8> {
        vec![u8::from(*self)]
    }
}

impl Encode for () {
    fn encode(&self) -> Vec<u8> {
        vec![]
    }
}

impl Encode for VarUInt {
    fn encode(&self) -> Vec<u8> {
        let bend = self.0.to_be_bytes();

        match bend.iter().position(|b| *b != 0x00) {
            Some(idx) => {
                let size = 16 - idx;
                let mut out = Vec::with_capacity(1 + size);

                out.push(size as u8);
                out.extend_from_slice(&bend[idx..]);

                out
            }
            None => vec![0],
        }
    }
}

macro_rules! impl_uint_encode {
    ($type:ty) => {
        impl Encode for $type {
            fn encode(&self) -> Vec<u8> {
                Into::<VarUInt>::into(*self).encode()
            }
        }
    };
}

// u8 encoding is more efficient than if we used our varuint
impl_uint_encode!(usize);
impl_uint_encode!(u16);
impl_uint_encode!(u32);
impl_uint_encode!(u64);
impl_uint_encode!(u128);

// Not order preserving, only used inside values
impl Encode for f64 {
    fn encode(&self) -> Vec<u8> {
        self.to_bits().to_be_bytes().to_vec()
    }
}

impl Encode for [u8] {
    fn encode(&self) -> Vec<u8> {
        [self.len().encode(), self.to_vec()].concat()
    }
}

impl Encode for str {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().encode()
    }
}

impl Encode for String {
    fn encode(&self) -> Vec<u8> {
        self.as_str().encode()
    }
}

impl<A: Encode> Encode for Option<A> {
    fn encode(&self) -> Vec<u8> {
        match self {
            None => vec![0],
            Some(inner) => [vec![1], inner.encode()].concat(),
        }
    }
}

impl<A: Encode> Encode for Vec<A> {
    fn encode(&self) -> Vec<u8> {
        [
            self.len().encode(),
            self.iter().flat_map(|t| t.encode()).collect(),
        ]
        .concat()
    }
}

impl<K: Encode, V: Encode> Encode for IndexMap<K, V> {
    fn encode(&self) -> Vec<u8> {
        [
            self.len().encode(),
            self.iter()
                .flat_map(|(k, v)| [k.encode(), v.encode()].concat())
                .collect(),
        ]
        .concat()
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self) -> Vec<u8> {
        (**self).encode()
    }
}

macro_rules! impl_tuple_encode {
    ($($name:ident $idx:tt),+) => {
        impl<$($name: Encode),+> Encode for ($($name,)+) {
            fn encode(&self) -> Vec<u8> {
                let mut out = Vec::new();
                $(out.extend(self.$idx.encode());)+
                out
            }
        }
    };
}

impl_tuple_encode!(A 0, B 1);
impl_tuple_encode!(A 0, B 1, C 2);
impl_tuple_encode!(A 0, B 1, C 2, D 3);
impl_tuple_encode!(A 0, B 1, C 2, D 3, E 4);
