//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Balances (key: owner || asset)
//! - `account_versions` - Append-only audit log (key: owner || seq)
//! - `distributions` - Distribution headers (key: id)
//! - `shares` - Shares of a distribution (key: id || index)
//! - `claims` - Claimant index (key: id || claimant)
//! - `pending_settlements` - Claimed shares awaiting fund transfer (key: id || index)
//! - `indices` - Secondary indices (serial, sender)
//! - `deposits` - Credited external transactions (key: tx id)
//! - `meta` - Sequences and checkpoints
//!
//! Reads go through a snapshot (`Store::view`). Writes are buffered in a
//! `WriteTxn` and committed as one `WriteBatch` (`Store::update`); writers are
//! serialized, so a read-modify-write inside `update` never races another.

use crate::{
    error::{Error, Result},
    Config,
};
use parking_lot::Mutex;
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction,
    IteratorMode, Options, Snapshot, WriteBatch, DB,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

const SEQUENCE_PREFIX: &[u8] = b"seq/";

/// Keyspace namespaces, one column family each
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// Balances
    Accounts,
    /// Audit log
    AccountVersions,
    /// Distribution headers
    Distributions,
    /// Distribution shares
    Shares,
    /// Claimant index
    Claims,
    /// Claims awaiting fund transfer
    PendingSettlements,
    /// Secondary indices
    Indices,
    /// Credited external transactions
    Deposits,
    /// Sequences and checkpoints
    Meta,
}

impl Table {
    /// Every table, in creation order
    pub const ALL: [Table; 9] = [
        Table::Accounts,
        Table::AccountVersions,
        Table::Distributions,
        Table::Shares,
        Table::Claims,
        Table::PendingSettlements,
        Table::Indices,
        Table::Deposits,
        Table::Meta,
    ];

    /// Column family name
    pub fn name(&self) -> &'static str {
        match self {
            Table::Accounts => "accounts",
            Table::AccountVersions => "account_versions",
            Table::Distributions => "distributions",
            Table::Shares => "shares",
            Table::Claims => "claims",
            Table::PendingSettlements => "pending_settlements",
            Table::Indices => "indices",
            Table::Deposits => "deposits",
            Table::Meta => "meta",
        }
    }

    fn options(&self) -> Options {
        let mut opts = Options::default();
        match self {
            // Append-only history, rarely read back
            Table::AccountVersions | Table::Deposits => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
                opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            Table::Indices | Table::Claims => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }
}

/// Read access shared by snapshot and write transactions
pub trait KeyspaceRead {
    /// Raw value lookup
    fn get_raw(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Typed value lookup
    fn get<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(table, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Key presence
    fn contains(&self, table: Table, key: &[u8]) -> Result<bool> {
        Ok(self.get_raw(table, key)?.is_some())
    }

    /// Current value of a named sequence (0 if never advanced)
    fn sequence(&self, name: &str) -> Result<u64> {
        Ok(self.get::<u64>(Table::Meta, &sequence_key(name))?.unwrap_or(0))
    }
}

fn sequence_key(name: &str) -> Vec<u8> {
    let mut key = SEQUENCE_PREFIX.to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

/// Transactional keyspace on top of RocksDB
pub struct Store {
    db: DB,
    writer: Mutex<()>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("path", &self.db.path()).finish()
    }
}

impl Store {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = Table::ALL
            .iter()
            .map(|table| ColumnFamilyDescriptor::new(table.name(), table.options()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = Table::ALL.len(),
            "Opened RocksDB"
        );

        Ok(Self {
            db,
            writer: Mutex::new(()),
        })
    }

    fn cf_handle(&self, table: Table) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(table.name())
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", table.name())))
    }

    /// Run `f` against a consistent read-only snapshot
    pub fn view<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&ReadTxn<'_>) -> std::result::Result<T, E>,
    {
        let txn = ReadTxn {
            store: self,
            snapshot: self.db.snapshot(),
        };
        f(&txn)
    }

    /// Run `f` as a serialized read-write transaction.
    ///
    /// Writes become visible atomically when `f` returns `Ok`; on `Err` they
    /// are discarded.
    pub fn update<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let _guard = self.writer.lock();
        let mut txn = WriteTxn {
            store: self,
            pending: BTreeMap::new(),
        };
        let value = f(&mut txn)?;
        txn.commit()?;
        Ok(value)
    }

    /// Consistent point-in-time copy into `dest` (must not exist yet)
    pub fn backup(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(dest)?;
        tracing::info!(dest = ?dest, "Backup checkpoint created");
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            accounts: self.approximate_count(Table::Accounts)?,
            versions: self.approximate_count(Table::AccountVersions)?,
            distributions: self.approximate_count(Table::Distributions)?,
            pending_settlements: self.approximate_count(Table::PendingSettlements)?,
        })
    }

    fn approximate_count(&self, table: Table) -> Result<u64> {
        let cf = self.cf_handle(table)?;
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(prop)
    }
}

/// Snapshot read transaction
pub struct ReadTxn<'a> {
    store: &'a Store,
    snapshot: Snapshot<'a>,
}

impl fmt::Debug for ReadTxn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadTxn").finish_non_exhaustive()
    }
}

impl KeyspaceRead for ReadTxn<'_> {
    fn get_raw(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.store.cf_handle(table)?;
        Ok(self.snapshot.get_cf(cf, key)?)
    }
}

impl ReadTxn<'_> {
    /// Visit entries in key order starting at `start` until `f` returns `false`
    pub fn scan<E, F>(&self, table: Table, start: &[u8], mut f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&[u8], &[u8]) -> std::result::Result<bool, E>,
        E: From<Error>,
    {
        let cf = self.store.cf_handle(table)?;
        let iter = self
            .snapshot
            .iterator_cf(cf, IteratorMode::From(start, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(Error::from)?;
            if !f(&key, &value)? {
                break;
            }
        }
        Ok(())
    }

    /// Visit every entry whose key starts with `prefix`
    pub fn scan_prefix<E, F>(&self, table: Table, prefix: &[u8], mut f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&[u8], &[u8]) -> std::result::Result<bool, E>,
        E: From<Error>,
    {
        self.scan(table, prefix, |key, value| {
            if !key.starts_with(prefix) {
                return Ok(false);
            }
            f(key, value)
        })
    }

    /// Decode every value under `prefix`
    pub fn collect_prefix<T: DeserializeOwned>(&self, table: Table, prefix: &[u8]) -> Result<Vec<T>> {
        let mut out = Vec::new();
        self.scan_prefix(table, prefix, |_, value| {
            out.push(bincode::deserialize(value)?);
            Ok::<_, Error>(true)
        })?;
        Ok(out)
    }
}

/// Buffered read-write transaction
pub struct WriteTxn<'a> {
    store: &'a Store,
    pending: BTreeMap<(Table, Vec<u8>), Option<Vec<u8>>>,
}

impl fmt::Debug for WriteTxn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTxn")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl KeyspaceRead for WriteTxn<'_> {
    fn get_raw(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(buffered) = self.pending.get(&(table, key.to_vec())) {
            return Ok(buffered.clone());
        }
        let cf = self.store.cf_handle(table)?;
        Ok(self.store.db.get_cf(cf, key)?)
    }
}

impl WriteTxn<'_> {
    /// Buffer a raw write
    pub fn put_raw(&mut self, table: Table, key: impl Into<Vec<u8>>, value: Vec<u8>) {
        self.pending.insert((table, key.into()), Some(value));
    }

    /// Buffer a typed write
    pub fn put<T: Serialize>(&mut self, table: Table, key: impl Into<Vec<u8>>, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.put_raw(table, key, bytes);
        Ok(())
    }

    /// Buffer a delete
    pub fn delete(&mut self, table: Table, key: impl Into<Vec<u8>>) {
        self.pending.insert((table, key.into()), None);
    }

    /// Advance a named sequence and return the new value
    pub fn next_sequence(&mut self, name: &str) -> Result<u64> {
        let next = self
            .sequence(name)?
            .checked_add(1)
            .ok_or_else(|| Error::InvariantViolation(format!("sequence {} overflow", name)))?;
        self.put(Table::Meta, sequence_key(name), &next)?;
        Ok(next)
    }

    /// Raise a sequence to at least `floor` (no-op if already higher)
    pub fn ensure_sequence_floor(&mut self, name: &str, floor: u64) -> Result<()> {
        if self.sequence(name)? < floor {
            self.put(Table::Meta, sequence_key(name), &floor)?;
        }
        Ok(())
    }

    fn commit(self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let count = self.pending.len();
        let mut batch = WriteBatch::default();
        for ((table, key), value) in self.pending {
            let cf = self.store.cf_handle(table)?;
            match value {
                Some(value) => batch.put_cf(cf, &key, &value),
                None => batch.delete_cf(cf, &key),
            }
        }
        self.store.db.write(batch)?;
        tracing::trace!(writes = count, "Transaction committed");
        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Approximate account rows
    pub accounts: u64,
    /// Approximate version records
    pub versions: u64,
    /// Approximate distributions
    pub distributions: u64,
    /// Approximate unsettled claims
    pub pending_settlements: u64,
}
