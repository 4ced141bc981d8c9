use std::path::PathBuf;

use serde::Deserialize;
use sysinfo::System;
use tracing::info;

pub mod encdec;
pub mod kv_store;
pub mod table;

const DEFAULT_DB_PATH: &str = "./tmp/casemod";

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Directory holding the RocksDB files
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Total memory budget for RocksDB in GB (default 40% of available system memory)
    pub rocksdb_memory_budget: Option<f64>,
    /// Skip the write-ahead log, trading crash durability for ingest speed
    #[serde(default)]
    pub disable_wal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            rocksdb_memory_budget: None,
            disable_wal: false,
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

impl Config {
    pub fn rocksdb_memory_budget_bytes(&self) -> u64 {
        match self.rocksdb_memory_budget {
            Some(gb) => (gb * 1024.0 * 1024.0 * 1024.0) as u64,
            None => Self::default_rocksdb_memory_budget(),
        }
    }

    fn default_rocksdb_memory_budget() -> u64 {
        let mut system = System::new_all();

        system.refresh_memory();

        let total_memory = system
            .cgroup_limits()
            .map(|x| x.total_memory)
            .unwrap_or_else(|| system.total_memory());

        let default_budget = (total_memory as f64 * 0.4) as u64;

        info!(
            "No RocksDB memory budget specified, using 40% of system memory: {:.2} GB ({} bytes) out of {:.2} GB total",
            default_budget as f64 / (1024.0 * 1024.0 * 1024.0),
            default_budget,
            total_memory as f64 / (1024.0 * 1024.0 * 1024.0)
        );

        default_budget
    }
}
