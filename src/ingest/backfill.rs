//! Bulk ingestion of a list of transactions on a bounded pool of blocking workers.

use std::sync::Arc;

use bitcoin::Txid;
use serde::Serialize;
use tokio::{
    sync::{Semaphore, watch},
    task::JoinSet,
};
use tracing::{error, info, warn};

use super::store::TxoStore;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TxOutcome {
    pub txid: Txid,
    /// `None` when the transaction was ingested
    pub error: Option<String>,
}

impl TxOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Serialize, Debug, Default)]
pub struct BackfillReport {
    /// Outcomes of every transaction that was started, in input order
    pub results: Vec<TxOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    /// Last transaction of the longest run of successes from the start of the input
    pub watermark: Option<Txid>,
    pub cancelled: bool,
}

pub struct Backfill {
    store: Arc<TxoStore>,
    concurrency: usize,
}

impl Backfill {
    pub fn new(store: Arc<TxoStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Ingests `txids` with at most `concurrency` of them in flight.
    ///
    /// Failures are logged and recorded, they do not stop the run. Once `shutdown` flips to
    /// `true` no further transaction is started, while those in flight are allowed to finish.
    pub async fn run(&self, txids: Vec<Txid>, shutdown: watch::Receiver<bool>) -> BackfillReport {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut slots: Vec<Option<TxOutcome>> = vec![None; txids.len()];
        let mut cancelled = false;

        info!(
            total = txids.len(),
            concurrency = self.concurrency,
            "starting backfill"
        );

        for (pos, txid) in txids.iter().copied().enumerate() {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            if *shutdown.borrow() {
                warn!(started = pos, "backfill cancelled");
                cancelled = true;
                break;
            }

            let store = self.store.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let res = store.ingest_txid(&txid).map(|_| ());
                (pos, txid, res)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((pos, txid, res)) => {
                    let error = match res {
                        Ok(()) => None,
                        Err(e) => {
                            error!(%txid, error = %e, "backfill ingest failed");
                            Some(e.to_string())
                        }
                    };
                    slots[pos] = Some(TxOutcome { txid, error });
                }
                Err(e) => error!(error = %e, "backfill worker panicked"),
            }
        }

        let report = BackfillReport::from_slots(slots, cancelled);

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            watermark = ?report.watermark,
            "backfill finished"
        );

        report
    }
}

impl BackfillReport {
    /// Slots left empty were never started or their worker died, and end the watermark run.
    fn from_slots(slots: Vec<Option<TxOutcome>>, cancelled: bool) -> Self {
        let watermark = slots
            .iter()
            .map_while(|slot| slot.as_ref().filter(|o| o.is_ok()))
            .last()
            .map(|o| o.txid);

        let results = slots.into_iter().flatten().collect::<Vec<_>>();
        let succeeded = results.iter().filter(|o| o.is_ok()).count();

        Self {
            failed: results.len() - succeeded,
            succeeded,
            results,
            watermark,
            cancelled,
        }
    }
}
