use std::{path::PathBuf, str::FromStr, sync::Arc};

use bitcoin::{Transaction, Txid, consensus};
use casemod_indexer::{
    error::Error,
    ingest::{
        self,
        backfill::Backfill,
        query::{DEFAULT_PAGE_LIMIT, EventQuery, TxoFields},
        source::{CachedSource, RpcSource, SourceConfig, StoreSource, TxSource},
        store::TxoStore,
        types::{Outpoint, PkHash, Txo},
    },
    storage::{self, kv_store::StorageHandler},
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod shutdown;

use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let config = Config::new(&args.config)?;

    info!("running casemod with config: {config:?}");

    let db = StorageHandler::open(&config.storage)?;

    let source: Arc<dyn TxSource> = match &config.source {
        Some(source) => Arc::new(CachedSource::new(
            db.clone(),
            RpcSource::new(source)?,
            source.cache_size_bytes(),
        )),
        None => {
            info!("no remote source configured, serving ancestors from the local store only");
            Arc::new(StoreSource::new(db.clone()))
        }
    };

    let store = TxoStore::new(db, source, &config.ingest)?;

    match args.command {
        Command::Ingest(args) => {
            let contexts = match args.raw {
                Some(raw) => {
                    let bytes = hex::decode(raw.trim())
                        .map_err(|e| Error::Custom(format!("invalid transaction hex: {e}")))?;
                    let tx: Transaction = consensus::deserialize(&bytes)?;

                    vec![store.ingest(&tx, None)?]
                }
                None => args
                    .txids
                    .iter()
                    .map(|txid| store.ingest_txid(txid))
                    .collect::<Result<Vec<_>, _>>()?,
            };

            let ingested = contexts
                .into_iter()
                .map(|ctx| IngestOutput {
                    txid: ctx.txid,
                    spends: ctx.spends,
                    txos: ctx.txos,
                })
                .collect::<Vec<_>>();

            print_json(&ingested)
        }
        Command::Backfill(args) => {
            let mut txids = args.txids;
            if let Some(path) = args.file {
                txids.extend(read_txids(&path)?);
            }

            let shutdown = ShutdownManager::new();
            let backfill = Backfill::new(Arc::new(store), config.ingest.concurrency);
            let report = backfill.run(txids, shutdown.subscribe()).await;

            print_json(&report)
        }
        Command::Txo(args) => {
            let fields = match args.tags {
                Some(tags) => TxoFields::Tags(tags),
                None => TxoFields::All,
            };

            print_json(&store.load_txo(&args.outpoint, &fields)?)
        }
        Command::Search(args) => {
            let query = EventQuery {
                owner: args.owner,
                spent: args.spent,
                offset: args.offset,
                limit: args.limit,
                ..EventQuery::new(args.tag, args.label, args.value)
            };

            print_json(&store.search(&query)?)
        }
        Command::Owner(args) => print_json(&store.txos_by_owner(
            &args.owner,
            args.spent,
            args.offset,
            args.limit,
        )?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Error> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Custom(format!("failed to serialize output: {e}")))?;

    println!("{out}");

    Ok(())
}

/// One txid per line, blank lines and `#` comments skipped.
fn read_txids(path: &PathBuf) -> Result<Vec<Txid>, Error> {
    std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            Txid::from_str(line).map_err(|e| Error::Custom(format!("invalid txid {line}: {e}")))
        })
        .collect()
}

#[derive(Serialize)]
struct IngestOutput {
    txid: Txid,
    spends: Vec<Txo>,
    txos: Vec<Txo>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest transactions fetched from the source, or a raw transaction
    Ingest(IngestArgs),
    /// Ingest many transactions concurrently
    Backfill(BackfillArgs),
    /// Show an output and its indexed data
    Txo(TxoArgs),
    /// Find outputs by event
    Search(SearchArgs),
    /// List outputs held by a public key hash
    Owner(OwnerArgs),
}

#[derive(Debug, clap::Args)]
struct IngestArgs {
    txids: Vec<Txid>,

    /// Hex encoded transaction to ingest as unconfirmed
    #[arg(long, conflicts_with = "txids")]
    raw: Option<String>,
}

#[derive(Debug, clap::Args)]
struct BackfillArgs {
    txids: Vec<Txid>,

    /// File with one txid per line
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct TxoArgs {
    /// `<txid>_<vout>`
    outpoint: Outpoint,

    /// Only load data of these tags
    #[arg(long, value_delimiter = ',')]
    tags: Option<Vec<String>>,
}

#[derive(Debug, clap::Args)]
struct SearchArgs {
    tag: String,
    label: String,
    value: String,

    #[arg(long)]
    owner: Option<PkHash>,

    /// Restrict to spent (true) or unspent (false) outputs
    #[arg(long)]
    spent: Option<bool>,

    #[arg(long, default_value_t = 0)]
    offset: usize,

    #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
    limit: usize,
}

#[derive(Debug, clap::Args)]
struct OwnerArgs {
    owner: PkHash,

    #[arg(long)]
    spent: Option<bool>,

    #[arg(long, default_value_t = 0)]
    offset: usize,

    #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
    limit: usize,
}

#[derive(Debug, Parser)]
#[clap(name = "casemod-indexer")]
#[clap(bin_name = "casemod-indexer")]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub storage: storage::Config,
    pub source: Option<SourceConfig>,
    pub ingest: ingest::Config,
}

impl Config {
    pub fn new(config_path: &Option<PathBuf>) -> Result<Self, config::ConfigError> {
        let mut s = config::Config::builder();

        s = s.add_source(config::File::with_name("casemod.toml").required(false));

        if let Some(explicit) = config_path.as_ref().and_then(|x| x.to_str()) {
            s = s.add_source(config::File::with_name(explicit).required(true));
        }

        s = s.add_source(config::Environment::with_prefix("CASEMOD").separator("__"));

        s.build()?.try_deserialize()
    }
}
