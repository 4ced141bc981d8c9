use std::{marker::PhantomData, ops::Range};

use rocksdb::{DB, DBIteratorWithThreadMode};

use crate::error::Error;

use super::encdec::{Decode, DecodingError, Encode, EncodeBuilder, decode::malformed_input, prefix_key_range};

const CORE_TABLE_TAG: u8 = b'C';

/// Length of every table prefix, also used as the fixed prefix extractor length.
pub const TABLE_PREFIX_LEN: usize = 2;

/// Defines a CoreTable.
///
/// # Example
/// ```ignore
/// define_core_table! {
///     name: TxoKV,
///     key_type: Outpoint,
///     value_type: TxoRecord,
///     table: CoreTables::Txo
/// }
/// ```
#[macro_export]
macro_rules! define_core_table {
    {
        name: $name:ident,
        key_type: $key_type:ty,
        value_type: $value_type:ty,
        table: $table_id:expr
    } => {
        pub struct $name;

        impl $crate::storage::table::TableBase for $name {
            type Key = $key_type;
            type Value = $value_type;
        }

        impl $crate::storage::table::CoreTable for $name {
            const TABLE_ID: u8 = $table_id as u8;
        }
    };
}

/// Common trait with basic table requirements
pub trait TableBase {
    /// Key type for the table.
    type Key: Encode + Decode;

    /// Value type for the table.
    type Value: Encode + Decode;
}

/// Represents a table with a unique prefix and key-value types.
pub trait CoreTable: TableBase {
    /// The unique id of this table within the core namespace.
    const TABLE_ID: u8;
}

/// A common trait for tables with a unique prefix and key-value types.
pub trait Table: TableBase {
    fn prefix() -> [u8; TABLE_PREFIX_LEN];

    /// Encodes the full key by combining the table prefix and the encoded key.
    fn encode_key(key: &Self::Key) -> Vec<u8> {
        EncodeBuilder::new()
            .append(&Self::prefix())
            .append(key)
            .build()
    }

    fn decode_key(raw: &[u8]) -> Result<Self::Key, DecodingError> {
        let key = raw
            .strip_prefix(Self::prefix().as_slice())
            .ok_or_else(|| malformed_input("key outside of table", raw))?;

        Self::Key::decode_all(key)
    }

    /// Range of raw keys between two (possibly partial) encoded keys. A missing bound extends to
    /// the start or end of the table.
    fn encode_range<S: Encode, E: Encode>(start: Option<&S>, end: Option<&E>) -> Range<Vec<u8>> {
        let prefix = Self::prefix();
        let table_range = prefix_key_range(&prefix);

        let start = match start {
            Some(s) => EncodeBuilder::new().append(&prefix).append(s).build(),
            None => table_range.start,
        };

        let end = match end {
            Some(e) => EncodeBuilder::new().append(&prefix).append(e).build(),
            None => table_range.end,
        };

        start..end
    }

    /// Range of raw keys that start with the given partial key.
    fn encode_prefix_range<P: Encode>(partial: &P) -> Range<Vec<u8>> {
        let raw = EncodeBuilder::new()
            .append(&Self::prefix())
            .append(partial)
            .build();

        prefix_key_range(&raw)
    }
}

impl<T: CoreTable> Table for T {
    fn prefix() -> [u8; TABLE_PREFIX_LEN] {
        [CORE_TABLE_TAG, T::TABLE_ID]
    }
}

/// Iterator over the decoded key-value pairs of a table within a raw key range.
pub struct TableIterator<'a, T: Table> {
    inner: DBIteratorWithThreadMode<'a, DB>,
    _table: PhantomData<T>,
}

impl<'a, T: Table> TableIterator<'a, T> {
    pub fn new(inner: DBIteratorWithThreadMode<'a, DB>) -> Self {
        Self {
            inner,
            _table: PhantomData,
        }
    }
}

impl<T: Table> Iterator for TableIterator<'_, T> {
    type Item = Result<(T::Key, T::Value), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let (raw_key, raw_value) = match self.inner.next()? {
            Ok(kv) => kv,
            Err(e) => return Some(Err(e.into())),
        };

        let decoded = T::decode_key(&raw_key)
            .and_then(|key| Ok((key, T::Value::decode_all(&raw_value)?)))
            .map_err(Error::from);

        Some(decoded)
    }
}
