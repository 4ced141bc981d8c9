use serde::Deserialize;

use crate::analyzers::AnalyzerFactory;

pub mod backfill;
pub mod context;
pub mod loader;
pub mod query;
pub mod source;
pub mod store;
pub mod tables;
pub mod types;

const DEFAULT_MAX_ANCESTOR_DEPTH: usize = 64;
const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// How many generations of unseen ancestors are ingested before a transaction (0 = none,
    /// their outputs are stubbed from the source instead)
    pub max_ancestor_depth: usize,
    /// Transactions ingested at once during a backfill
    pub concurrency: usize,
    /// Analyzers in the order they run on each output
    pub analyzers: Vec<AnalyzerFactory>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_ancestor_depth: DEFAULT_MAX_ANCESTOR_DEPTH,
            concurrency: DEFAULT_CONCURRENCY,
            analyzers: AnalyzerFactory::defaults(),
        }
    }
}
