pub use storage::encdec::{DecodingError, DecodingResult};

pub mod analyzers;
pub mod error;
pub mod ingest;
pub mod script;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_utils;
