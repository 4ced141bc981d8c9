use thiserror::Error;

use crate::DecodingError;

#[derive(Error, Debug)]
pub enum Error {
    /// Stored bytes no longer decode under the current schema
    #[error("decoding error: {0}")]
    Decoding(#[from] DecodingError),

    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),

    /// A transaction referenced by an input could not be fetched from any source
    #[error("missing ancestor transaction {0}")]
    MissingAncestor(String),

    #[error("transaction decoding error: {0}")]
    Consensus(#[from] bitcoin::consensus::encode::Error),

    #[error("rpc error: {0}")]
    Rpc(#[from] bitcoincore_rpc::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Custom(String),
}
