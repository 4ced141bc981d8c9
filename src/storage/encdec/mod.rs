pub mod decode;
pub mod encode;

use std::ops::Range;

pub use decode::{DecodingError, DecodingResult};

pub trait Encode {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decode
where
    Self: Sized,
{
    fn decode(bytes: &[u8]) -> DecodingResult<'_, Self>;

    /// `decode` but ignoring, and not returning, any remaining bytes
    fn decode_all(bytes: &[u8]) -> Result<Self, DecodingError> {
        Self::decode(bytes).map(|x| x.0)
    }
}

#[derive(Default, Clone)]
pub struct EncodeBuilder {
    output: Vec<u8>,
}

impl EncodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append<T: Encode + ?Sized>(mut self, data: &T) -> Self {
        self.output.extend(data.encode());
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.output
    }
}

/// Unsigned integer with more efficient serialisation while maintaining lexicographic ordering.
///
/// Encoded as a single length byte followed by the minimal big-endian representation, so a longer
/// encoding always sorts after a shorter one and equal lengths compare bytewise.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub(crate) struct VarUInt(pub u128);

macro_rules! impl_to_varuint {
    ($type:ty) => {
        impl From<$type> for VarUInt {
            fn from(val: $type) -> Self {
                VarUInt(val as u128)
            }
        }
    };
}

impl_to_varuint!(usize);
impl_to_varuint!(u8);
impl_to_varuint!(u16);
impl_to_varuint!(u32);
impl_to_varuint!(u64);
impl_to_varuint!(u128);

macro_rules! impl_try_from_varuint {
    ($type:ty) => {
        impl TryFrom<VarUInt> for $type {
            type Error = DecodingError;

            fn try_from(val: VarUInt) -> Result<$type, Self::Error> {
                let inner_val = val.0;
                inner_val
                    .try_into()
                    .map_err(|_| DecodingError::VarUIntCasting(inner_val))
            }
        }
    };
}

impl_try_from_varuint!(usize);
impl_try_from_varuint!(u8);
impl_try_from_varuint!(u16);
impl_try_from_varuint!(u32);
impl_try_from_varuint!(u64);
impl_try_from_varuint!(u128);

pub fn prefix_key_range(prefix: &[u8]) -> Range<Vec<u8>> {
    let start = prefix.to_vec();
    let mut end = prefix.to_vec();

    // Work backwards to handle the case where the last byte(s) are 255
    for i in (0..end.len()).rev() {
        if end[i] != 255 {
            end[i] += 1;
            end.truncate(i + 1);
            return start..end;
        }
    }

    // If all bytes are 255, the range is unbounded at the upper end
    start..vec![]
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;

    #[test]
    fn test_varuint_preserves_order() {
        let values = [0u128, 1, 255, 256, 65_535, 1 << 40, 1 << 96, u128::MAX];

        for pair in values.windows(2) {
            let a = VarUInt(pair[0]).encode();
            let b = VarUInt(pair[1]).encode();
            assert!(a < b, "{} should sort before {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_varuint_widths() {
        assert_eq!(VarUInt(0).encode(), vec![0]);
        assert_eq!(VarUInt(1).encode(), vec![1, 1]);
        assert_eq!(VarUInt(256).encode(), vec![2, 1, 0]);
        assert_eq!(VarUInt(u128::MAX).encode().len(), 17);
    }

    #[test]
    fn test_varuint_rejects_oversized_length() {
        let mut bytes = vec![17];
        bytes.extend([0xff; 17]);

        assert!(VarUInt::decode(&bytes).is_err());
    }

    #[test]
    fn test_narrowing_decode_fails() {
        let encoded = 300u32.encode();

        assert!(matches!(
            u8::try_from(VarUInt::decode_all(&encoded).unwrap()),
            Err(DecodingError::VarUIntCasting(300))
        ));
    }

    #[test]
    fn test_composite_values_decode_back() {
        let mut map = IndexMap::new();
        map.insert("name".to_string(), "value".to_string());
        map.insert("empty".to_string(), String::new());

        let value = (
            Some("text".to_string()),
            None::<u64>,
            vec![true, false],
            map.clone(),
        );
        let bytes = value.encode();

        let (decoded, rest) = <(Option<String>, Option<u64>, Vec<bool>, IndexMap<String, String>)>::decode(&bytes).unwrap();

        assert!(rest.is_empty());
        assert_eq!(decoded.0.as_deref(), Some("text"));
        assert_eq!(decoded.1, None);
        assert_eq!(decoded.2, vec![true, false]);
        assert_eq!(decoded.3, map);
    }

    #[test]
    fn test_invalid_utf8_string() {
        let bytes = vec![1, 2, 0xff, 0xfe];

        assert!(matches!(
            String::decode(&bytes),
            Err(DecodingError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_prefix_key_range() {
        assert_eq!(prefix_key_range(&[1, 2]), vec![1, 2]..vec![1, 3]);
        assert_eq!(prefix_key_range(&[1, 255]), vec![1, 255]..vec![2]);
        assert_eq!(prefix_key_range(&[255, 255]), vec![255, 255]..vec![]);
    }
}
