use std::{
    collections::{BTreeMap, HashMap},
    ops::Range,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use rocksdb::{
    Cache, ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, ReadOptions,
    SliceTransform, WriteBatch, WriteOptions,
};
use sysinfo::System;
use tracing::{info, trace};

use crate::error::Error;

use super::{
    Config,
    encdec::{Decode, Encode},
    table::{TABLE_PREFIX_LEN, Table, TableIterator},
};

static CASEMOD_CF_NAME: &str = "casemod";

pub type RawKey = Vec<u8>;
pub type RawValue = Vec<u8>;

pub enum StorageAction {
    Set(RawValue),
    Delete,
}

/// A set of reads and buffered writes which is committed to storage as a single atomic batch.
pub struct IndexingTask<'a> {
    db: Arc<DB>,
    cf_handle: &'a ColumnFamily,
    // when we write keys, we do not write to storage, we manipulate here until we flush via write batch
    // when we read, we first check for the key here and if we dont find it we use the db
    write_buffer: HashMap<RawKey, StorageAction>,
}

impl IndexingTask<'_> {
    pub fn get<T>(&self, key: &T::Key) -> Result<Option<T::Value>, Error>
    where
        T: Table,
    {
        // Encode the key for the relevant table
        let encoded_key = T::encode_key(key);

        // Check the write buffer first
        if let Some(action) = self.write_buffer.get(&encoded_key) {
            trace!("fetching {} from writebuf", hex::encode(&encoded_key));

            return match action {
                StorageAction::Set(value) => Ok(Some(T::Value::decode_all(value)?)),
                StorageAction::Delete => Ok(None),
            };
        }

        trace!("fetching {} from storage", hex::encode(&encoded_key));

        self.db
            .get_cf(self.cf_handle, &encoded_key)?
            .map(|bytes| T::Value::decode_all(&bytes).map_err(Error::from))
            .transpose()
    }

    /// All key-value pairs of a table within the raw key range, as seen through the write buffer.
    pub fn range<T>(&self, range: Range<RawKey>) -> Result<Vec<(T::Key, T::Value)>, Error>
    where
        T: Table,
    {
        let mut merged: BTreeMap<RawKey, RawValue> = BTreeMap::new();

        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_range(range.clone());

        for kv in self
            .db
            .iterator_cf_opt(self.cf_handle, read_opts, IteratorMode::Start)
        {
            let (key, value) = kv?;
            merged.insert(key.to_vec(), value.to_vec());
        }

        let in_range =
            |key: &RawKey| *key >= range.start && (range.end.is_empty() || *key < range.end);

        for (key, action) in self.write_buffer.iter().filter(|(k, _)| in_range(k)) {
            match action {
                StorageAction::Set(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                StorageAction::Delete => {
                    merged.remove(key);
                }
            }
        }

        merged
            .into_iter()
            .map(|(k, v)| Ok((T::decode_key(&k)?, T::Value::decode_all(&v)?)))
            .collect()
    }

    pub fn set<T>(&mut self, key: T::Key, value: T::Value) -> Result<(), Error>
    where
        T: Table,
    {
        let encoded_key = T::encode_key(&key);

        trace!("setting {}", hex::encode(&encoded_key));

        self.write_buffer
            .insert(encoded_key, StorageAction::Set(value.encode()));

        Ok(())
    }

    pub fn delete<T>(&mut self, key: T::Key) -> Result<(), Error>
    where
        T: Table,
    {
        let encoded_key = T::encode_key(&key);

        trace!("deleting {}", hex::encode(&encoded_key));

        self.write_buffer.insert(encoded_key, StorageAction::Delete);

        Ok(())
    }

    pub fn finalize(self) -> FinalizedTask {
        FinalizedTask {
            write_buffer: self.write_buffer,
        }
    }
}

pub struct FinalizedTask {
    pub write_buffer: HashMap<RawKey, StorageAction>,
}

impl FinalizedTask {
    pub fn len(&self) -> usize {
        self.write_buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.write_buffer.is_empty()
    }
}

#[derive(Clone)]
pub struct StorageHandler {
    pub db: Arc<DB>,
    disable_wal: bool,
    /// Serialises read-modify-write tasks across every clone of this handler
    write_lock: Arc<Mutex<()>>,
}

impl StorageHandler {
    pub fn open(config: &Config) -> Result<Self, Error> {
        Self::open_at(
            &config.path,
            config.rocksdb_memory_budget_bytes(),
            config.disable_wal,
        )
    }

    pub fn open_at(path: &Path, memory_budget: u64, disable_wal: bool) -> Result<Self, Error> {
        info!("opening db at {}...", path.display());
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        info!(
            "using rocksdb memory budget: {:.2} GB ({} bytes)",
            memory_budget as f64 / 1024.0 / 1024.0 / 1024.0,
            memory_budget
        );

        let block_cache_budget = (memory_budget as f64 * 0.75) as usize;
        let memtable_budget = (memory_budget as f64 * 0.25) as usize;

        let cache = Cache::new_lru_cache(block_cache_budget);

        let sys = System::new_all();
        let cpus = sys.cpus().len() as u32;
        let background_jobs = std::cmp::max(2, cpus);
        db_opts.set_max_background_jobs(i32::try_from(background_jobs).unwrap_or(i32::MAX));
        db_opts.set_max_subcompactions(cpus);

        let mut cf_opts = Options::default();

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_block_cache(&cache);
        cf_opts.set_block_based_table_factory(&block_opts);

        let per_memtable_cap = 512 * 1024 * 1024;
        cf_opts.set_write_buffer_size(std::cmp::min(memtable_budget / 2, per_memtable_cap));
        cf_opts.set_max_write_buffer_number(2);

        // every key starts with its table prefix
        cf_opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(TABLE_PREFIX_LEN));

        let cfs = vec![ColumnFamilyDescriptor::new(CASEMOD_CF_NAME, cf_opts)];

        let db = DB::open_cf_descriptors(&db_opts, path, cfs)?;

        Ok(Self {
            db: Arc::new(db),
            disable_wal,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn cf_handle(&self) -> Result<&ColumnFamily, Error> {
        self.db
            .cf_handle(CASEMOD_CF_NAME)
            .ok_or_else(|| Error::Custom(format!("column family {CASEMOD_CF_NAME} missing")))
    }

    pub fn begin_indexing_task(&self) -> Result<IndexingTask<'_>, Error> {
        Ok(IndexingTask {
            db: self.db.clone(),
            cf_handle: self.cf_handle()?,
            write_buffer: HashMap::new(),
        })
    }

    /// Finish the task, by flushing all the pending writes to storage in one write batch
    pub fn apply_indexing_task(&self, task: FinalizedTask) -> Result<(), Error> {
        let mut wb = WriteBatch::default();

        let cf = self.cf_handle()?;

        for (key, action) in task.write_buffer {
            match action {
                StorageAction::Set(value) => wb.put_cf(cf, key, value),
                StorageAction::Delete => wb.delete_cf(cf, key),
            }
        }

        trace!("writing batch of {} actions", wb.len());

        let mut wopts = WriteOptions::default();
        wopts.disable_wal(self.disable_wal);

        self.db.write_opt(wb, &wopts)?;

        Ok(())
    }

    /// Held from the first read of a task that rewrites existing records until it is applied, so
    /// no other writer commits in between.
    pub fn write_guard(&self) -> MutexGuard<'_, ()> {
        // guards no data, a poisoned lock is still usable
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reader(&self) -> Reader<'_> {
        Reader { handler: self }
    }
}

/// Read-only view over committed data.
pub struct Reader<'a> {
    handler: &'a StorageHandler,
}

impl Reader<'_> {
    pub fn get<T>(&self, key: &T::Key) -> Result<Option<T::Value>, Error>
    where
        T: Table,
    {
        let res = self
            .handler
            .db
            .get_cf(self.handler.cf_handle()?, T::encode_key(key))?;

        match res {
            Some(bytes) => Ok(Some(<T>::Value::decode_all(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn iter_kvs<T: Table>(
        &self,
        range: Range<Vec<u8>>,
        reverse: bool,
    ) -> Result<TableIterator<'_, T>, Error> {
        let mut read_opts = ReadOptions::default();
        read_opts.set_iterate_range(range);

        let mode = if reverse {
            IteratorMode::End
        } else {
            IteratorMode::Start
        };

        let iter = self
            .handler
            .db
            .iterator_cf_opt(self.handler.cf_handle()?, read_opts, mode);

        Ok(TableIterator::<T>::new(iter))
    }
}

#[cfg(test)]
mod tests {
    use casemod_indexer_macros::{Decode, Encode};
    use tempfile::TempDir;

    use super::*;
    use crate::define_core_table;

    #[derive(Encode, Decode, Debug, PartialEq, Clone)]
    pub struct Entry {
        name: String,
        amount: u64,
    }

    define_core_table! {
        name: EntryKV,
        key_type: (String, u64),
        value_type: Entry,
        table: 200u8
    }

    fn open_test_db() -> (StorageHandler, TempDir) {
        let tmp = TempDir::new().unwrap();
        let db = StorageHandler::open_at(tmp.path(), 64 * 1024 * 1024, false).unwrap();
        (db, tmp)
    }

    fn entry(name: &str, amount: u64) -> Entry {
        Entry {
            name: name.to_string(),
            amount,
        }
    }

    #[test]
    fn test_task_reads_own_writes() {
        let (db, _tmp) = open_test_db();

        let mut task = db.begin_indexing_task().unwrap();
        task.set::<EntryKV>(("a".into(), 1), entry("a", 1)).unwrap();

        assert_eq!(
            task.get::<EntryKV>(&("a".into(), 1)).unwrap(),
            Some(entry("a", 1))
        );

        task.delete::<EntryKV>(("a".into(), 1)).unwrap();
        assert_eq!(task.get::<EntryKV>(&("a".into(), 1)).unwrap(), None);
    }

    #[test]
    fn test_nothing_visible_until_applied() {
        let (db, _tmp) = open_test_db();

        let mut task = db.begin_indexing_task().unwrap();
        task.set::<EntryKV>(("a".into(), 1), entry("a", 1)).unwrap();
        task.set::<EntryKV>(("b".into(), 2), entry("b", 2)).unwrap();
        let finalized = task.finalize();

        assert_eq!(finalized.len(), 2);
        assert_eq!(db.reader().get::<EntryKV>(&("a".into(), 1)).unwrap(), None);

        db.apply_indexing_task(finalized).unwrap();

        let reader = db.reader();
        assert_eq!(
            reader.get::<EntryKV>(&("a".into(), 1)).unwrap(),
            Some(entry("a", 1))
        );
        assert_eq!(
            reader.get::<EntryKV>(&("b".into(), 2)).unwrap(),
            Some(entry("b", 2))
        );
    }

    #[test]
    fn test_range_scans_in_key_order() {
        let (db, _tmp) = open_test_db();

        let mut task = db.begin_indexing_task().unwrap();
        for amount in [300u64, 2, 70_000, 1] {
            task.set::<EntryKV>(("x".into(), amount), entry("x", amount))
                .unwrap();
        }
        task.set::<EntryKV>(("y".into(), 5), entry("y", 5)).unwrap();
        db.apply_indexing_task(task.finalize()).unwrap();

        let range = EntryKV::encode_prefix_range(&"x".to_string());
        let amounts = db
            .reader()
            .iter_kvs::<EntryKV>(range, false)
            .unwrap()
            .map(|kv| kv.unwrap().0.1)
            .collect::<Vec<_>>();

        assert_eq!(amounts, vec![1, 2, 300, 70_000]);

        let bounded = EntryKV::encode_range(
            Some(&("x".to_string(), 2u64)),
            Some(&("x".to_string(), 300u64)),
        );
        let amounts = db
            .reader()
            .iter_kvs::<EntryKV>(bounded, false)
            .unwrap()
            .map(|kv| kv.unwrap().0.1)
            .collect::<Vec<_>>();

        assert_eq!(amounts, vec![2]);
    }

    #[test]
    fn test_task_range_overlays_write_buffer() {
        let (db, _tmp) = open_test_db();

        let mut task = db.begin_indexing_task().unwrap();
        task.set::<EntryKV>(("x".into(), 1), entry("x", 1)).unwrap();
        task.set::<EntryKV>(("x".into(), 2), entry("x", 2)).unwrap();
        db.apply_indexing_task(task.finalize()).unwrap();

        let mut task = db.begin_indexing_task().unwrap();
        task.delete::<EntryKV>(("x".into(), 1)).unwrap();
        task.set::<EntryKV>(("x".into(), 3), entry("x", 3)).unwrap();

        let keys = task
            .range::<EntryKV>(EntryKV::encode_prefix_range(&"x".to_string()))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k.1)
            .collect::<Vec<_>>();

        assert_eq!(keys, vec![2, 3]);
    }
}
