// src/storage/mod.rs

//! Persistent package storage
//!
//! One memory-mapped [redb] environment per [`Config`](crate::database::Config)
//! holds the packages of every database in per-database tables
//! (`<db>_packages`, `<db>_provides`, `<db>_requires`, `<db>_libprovides`,
//! `<db>_librequires`). A bounded write-through LRU cache sits in front of
//! the environment so hot packages never touch disk.
//!
//! Concurrency contract: the cache mutex is never held across a transaction;
//! redb serializes writers per environment while readers see a consistent
//! snapshot.

use crate::error::{Error, Result};
use crate::packages::Package;
use redb::{ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Persistent identifier of a stored entry; 0 means "not stored"
pub type StorageId = u64;

/// Default number of entries the LRU cache holds
pub const DEFAULT_CACHE_LIMIT: usize = 1000;

const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");
const NEXT_ID_KEY: &str = "next_id";

/// Something the storage cache can persist
///
/// The per-type key extractor keeps the backing store monomorphic: entries
/// are addressed by name, carry index projections and can merge
/// contents-derived data from a previous instance of themselves.
pub trait StorageEntry:
    Serialize + DeserializeOwned + Clone + PartialEq + Send + 'static
{
    fn entry_name(&self) -> &str;
    /// Retain contents-derived information from a previous instance
    fn merge_contents_from(&mut self, previous: &Self);
    fn index_keys(&self) -> StorageIndexKeys;
}

/// Index projections of an entry, one per sub-table
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StorageIndexKeys {
    pub provides: Vec<String>,
    pub requires: Vec<String>,
    pub libprovides: Vec<String>,
    pub librequires: Vec<String>,
}

impl StorageEntry for Package {
    fn entry_name(&self) -> &str {
        &self.name
    }

    fn merge_contents_from(&mut self, previous: &Self) {
        self.add_deps_and_provides_from_other_package(previous);
    }

    fn index_keys(&self) -> StorageIndexKeys {
        let mut provides = vec![self.name.clone()];
        provides.extend(self.provides.iter().map(|dep| dep.name.clone()));
        StorageIndexKeys {
            provides,
            requires: self.dependencies.iter().map(|dep| dep.name.clone()).collect(),
            libprovides: self.libprovides.clone(),
            librequires: self.libdepends.clone(),
        }
    }
}

/// On-disk record: the entry plus its persistent id
#[derive(Serialize, Deserialize)]
struct StoredRecord<E> {
    id: StorageId,
    entry: E,
}

/// The memory-mapped environment backing all database storages
pub struct StorageEnv {
    db: redb::Database,
}

impl StorageEnv {
    /// Open (or create) the environment at `path`
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Io(format!("Unable to create storage directory: {e}")))?;
        }
        let db = redb::Database::create(path)
            .map_err(|e| Error::Io(format!("Unable to open storage environment: {e}")))?;
        debug!("Opened storage environment at {}", path.display());
        Ok(Arc::new(Self { db }))
    }

    /// The storage handle for one database, identified by its unique name
    /// (typically `<name>@<arch>`)
    pub fn database_storage(self: &Arc<Self>, unique_name: &str) -> DatabaseStorage {
        DatabaseStorage {
            env: Arc::clone(self),
            unique_name: unique_name.to_string(),
            packages_table: format!("{unique_name}_packages"),
            provides_table: format!("{unique_name}_provides"),
            requires_table: format!("{unique_name}_requires"),
            libprovides_table: format!("{unique_name}_libprovides"),
            librequires_table: format!("{unique_name}_librequires"),
        }
    }
}

/// Per-database view into the environment
#[derive(Clone)]
pub struct DatabaseStorage {
    env: Arc<StorageEnv>,
    pub unique_name: String,
    packages_table: String,
    provides_table: String,
    requires_table: String,
    libprovides_table: String,
    librequires_table: String,
}

impl DatabaseStorage {
    fn packages_def(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.packages_table)
    }

    fn index_defs(&self) -> [(TableDefinition<'_, &'static str, &'static [u8]>, usize); 4] {
        [
            (TableDefinition::new(&self.provides_table), 0),
            (TableDefinition::new(&self.requires_table), 1),
            (TableDefinition::new(&self.libprovides_table), 2),
            (TableDefinition::new(&self.librequires_table), 3),
        ]
    }

    /// All persisted entries, e.g. for restoring the in-memory state on
    /// startup
    pub fn all_entries<E: StorageEntry>(&self) -> Result<Vec<(StorageId, E)>> {
        let txn = self
            .env
            .db
            .begin_read()
            .map_err(|e| Error::Io(format!("Unable to begin read transaction: {e}")))?;
        let table = match txn.open_table(self.packages_def()) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(format!("Unable to open packages table: {e}"))),
        };
        let mut entries = Vec::new();
        let iter = table
            .iter()
            .map_err(|e| Error::Io(format!("Unable to iterate packages table: {e}")))?;
        for item in iter {
            let (_key, value) =
                item.map_err(|e| Error::Io(format!("Unable to read stored package: {e}")))?;
            let record: StoredRecord<E> = bincode::deserialize(value.value())
                .map_err(|e| Error::Consistency(format!("Corrupt stored package: {e}")))?;
            entries.push((record.id, record.entry));
        }
        Ok(entries)
    }
}

/// Result of a [`StorageCache::store`] call
#[derive(Debug, Default)]
pub struct StoreResult<E> {
    pub id: StorageId,
    pub old_entry: Option<E>,
    pub updated: bool,
}

#[derive(Clone)]
struct CachedEntry<E> {
    id: StorageId,
    entry: E,
}

type CacheKey = (String, String); // (storage unique name, entry name)

struct CacheEntries<E> {
    limit: usize,
    map: HashMap<CacheKey, CachedEntry<E>>,
    by_id: HashMap<(String, StorageId), CacheKey>,
    recency: VecDeque<CacheKey>,
}

impl<E: Clone> CacheEntries<E> {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            map: HashMap::new(),
            by_id: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    fn touch(&mut self, key: &CacheKey) {
        if let Some(position) = self.recency.iter().position(|entry| entry == key) {
            self.recency.remove(position);
        }
        self.recency.push_front(key.clone());
    }

    fn get(&mut self, key: &CacheKey) -> Option<CachedEntry<E>> {
        let cached = self.map.get(key)?.clone();
        self.touch(key);
        Some(cached)
    }

    fn insert(&mut self, key: CacheKey, cached: CachedEntry<E>) {
        self.by_id.insert((key.0.clone(), cached.id), key.clone());
        if self.map.insert(key.clone(), cached).is_none() && self.map.len() > self.limit {
            if let Some(tail) = self.recency.pop_back() {
                if let Some(evicted) = self.map.remove(&tail) {
                    self.by_id.remove(&(tail.0.clone(), evicted.id));
                }
            }
        }
        self.touch(&key);
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(removed) = self.map.remove(key) {
            self.by_id.remove(&(key.0.clone(), removed.id));
        }
        if let Some(position) = self.recency.iter().position(|entry| entry == key) {
            self.recency.remove(position);
        }
    }

    fn clear_storage(&mut self, storage_name: &str) {
        self.map.retain(|key, _| key.0 != storage_name);
        self.by_id.retain(|key, _| key.0 != storage_name);
        self.recency.retain(|key| key.0 != storage_name);
    }
}

/// Bounded write-through LRU cache over the backing environment
pub struct StorageCache<E: StorageEntry> {
    entries: Mutex<CacheEntries<E>>,
}

/// The concrete cache used for packages
pub type PackageCache = StorageCache<Package>;

impl<E: StorageEntry> Default for StorageCache<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_LIMIT)
    }
}

impl<E: StorageEntry> StorageCache<E> {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Mutex::new(CacheEntries::new(limit)),
        }
    }

    /// Look up an entry by name, checking the cache before the backing store
    ///
    /// Returns `(0, None)` when the entry exists nowhere.
    pub fn retrieve(
        &self,
        storage: &DatabaseStorage,
        entry_name: &str,
    ) -> Result<(StorageId, Option<E>)> {
        let key = (storage.unique_name.clone(), entry_name.to_string());
        {
            let mut cache = self.entries.lock().expect("cache mutex poisoned");
            if let Some(cached) = cache.get(&key) {
                return Ok((cached.id, Some(cached.entry)));
            }
        }

        // miss: consult the backing store without holding the mutex
        let txn = storage
            .env
            .db
            .begin_read()
            .map_err(|e| Error::Io(format!("Unable to begin read transaction: {e}")))?;
        let table = match txn.open_table(storage.packages_def()) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok((0, None)),
            Err(e) => return Err(Error::Io(format!("Unable to open packages table: {e}"))),
        };
        let Some(guard) = table
            .get(entry_name)
            .map_err(|e| Error::Io(format!("Unable to read stored package: {e}")))?
        else {
            return Ok((0, None));
        };
        let record: StoredRecord<E> = bincode::deserialize(guard.value())
            .map_err(|e| Error::Consistency(format!("Corrupt stored package: {e}")))?;

        let mut cache = self.entries.lock().expect("cache mutex poisoned");
        cache.insert(
            key,
            CachedEntry {
                id: record.id,
                entry: record.entry.clone(),
            },
        );
        Ok((record.id, Some(record.entry)))
    }

    /// Write an entry through to the backing store
    ///
    /// When a byte-identical entry is already cached and `force` is unset the
    /// call is a no-op reporting `updated = false`. Otherwise contents-derived
    /// fields of the previous instance are merged into the new entry before
    /// it is persisted.
    pub fn store(
        &self,
        storage: &DatabaseStorage,
        mut entry: E,
        force: bool,
    ) -> Result<StoreResult<E>> {
        let key = (
            storage.unique_name.clone(),
            entry.entry_name().to_string(),
        );
        let mut result = StoreResult {
            id: 0,
            old_entry: None,
            updated: false,
        };

        {
            let mut cache = self.entries.lock().expect("cache mutex poisoned");
            if let Some(cached) = cache.get(&key) {
                result.id = cached.id;
                if cached.entry == entry && !force {
                    result.old_entry = Some(cached.entry);
                    return Ok(result);
                }
                entry.merge_contents_from(&cached.entry);
                result.old_entry = Some(cached.entry);
            }
        }

        let txn = storage
            .env
            .db
            .begin_write()
            .map_err(|e| Error::Io(format!("Unable to begin write transaction: {e}")))?;
        {
            let mut table = txn
                .open_table(storage.packages_def())
                .map_err(|e| Error::Io(format!("Unable to open packages table: {e}")))?;

            if result.old_entry.is_none() {
                if let Some(guard) = table
                    .get(entry.entry_name())
                    .map_err(|e| Error::Io(format!("Unable to read stored package: {e}")))?
                {
                    let record: StoredRecord<E> = bincode::deserialize(guard.value())
                        .map_err(|e| Error::Consistency(format!("Corrupt stored package: {e}")))?;
                    result.id = record.id;
                    entry.merge_contents_from(&record.entry);
                    result.old_entry = Some(record.entry);
                }
            }
            if result.id == 0 {
                result.id = allocate_id(&txn)?;
            }

            let record = StoredRecord {
                id: result.id,
                entry: entry.clone(),
            };
            let bytes = bincode::serialize(&record)
                .map_err(|e| Error::Io(format!("Unable to serialize package: {e}")))?;
            table
                .insert(entry.entry_name(), bytes.as_slice())
                .map_err(|e| Error::Io(format!("Unable to write stored package: {e}")))?;
        }
        update_index_tables(
            storage,
            &txn,
            entry.entry_name(),
            result.old_entry.as_ref().map(|old| old.index_keys()),
            Some(entry.index_keys()),
        )?;
        txn.commit()
            .map_err(|e| Error::Io(format!("Unable to commit package update: {e}")))?;

        let mut cache = self.entries.lock().expect("cache mutex poisoned");
        cache.insert(
            key,
            CachedEntry {
                id: result.id,
                entry,
            },
        );
        result.updated = true;
        Ok(result)
    }

    /// Remove an entry from the cache and the backing store
    pub fn invalidate(&self, storage: &DatabaseStorage, entry_name: &str) -> Result<bool> {
        let key = (storage.unique_name.clone(), entry_name.to_string());
        let cached_keys = {
            let mut cache = self.entries.lock().expect("cache mutex poisoned");
            let keys = cache.map.get(&key).map(|cached| cached.entry.index_keys());
            cache.remove(&key);
            keys
        };

        let txn = storage
            .env
            .db
            .begin_write()
            .map_err(|e| Error::Io(format!("Unable to begin write transaction: {e}")))?;
        let removed_keys;
        {
            let mut table = match txn.open_table(storage.packages_def()) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(false),
                Err(e) => return Err(Error::Io(format!("Unable to open packages table: {e}"))),
            };
            let removed = table
                .remove(entry_name)
                .map_err(|e| Error::Io(format!("Unable to remove stored package: {e}")))?;
            removed_keys = match removed {
                Some(guard) => {
                    let record: StoredRecord<E> = bincode::deserialize(guard.value())
                        .map_err(|e| Error::Consistency(format!("Corrupt stored package: {e}")))?;
                    Some(record.entry.index_keys())
                }
                None => cached_keys,
            };
            if removed_keys.is_none() {
                return Ok(false);
            }
        }
        update_index_tables(storage, &txn, entry_name, removed_keys, None)?;
        txn.commit()
            .map_err(|e| Error::Io(format!("Unable to commit package removal: {e}")))?;
        Ok(true)
    }

    /// Truncate all sub-tables of the given storage
    pub fn clear(&self, storage: &DatabaseStorage) -> Result<()> {
        self.clear_cache_only(storage);
        let txn = storage
            .env
            .db
            .begin_write()
            .map_err(|e| Error::Io(format!("Unable to begin write transaction: {e}")))?;
        let mut tables = vec![storage.packages_table.clone()];
        tables.extend([
            storage.provides_table.clone(),
            storage.requires_table.clone(),
            storage.libprovides_table.clone(),
            storage.librequires_table.clone(),
        ]);
        for table_name in tables {
            let def: TableDefinition<'_, &'static str, &'static [u8]> =
                TableDefinition::new(&table_name);
            match txn.delete_table(def) {
                Ok(_) => {}
                Err(e) => return Err(Error::Io(format!("Unable to clear table: {e}"))),
            }
        }
        txn.commit()
            .map_err(|e| Error::Io(format!("Unable to commit table truncation: {e}")))?;
        Ok(())
    }

    /// Drop the cached entries of the given storage without touching disk
    pub fn clear_cache_only(&self, storage: &DatabaseStorage) {
        let mut cache = self.entries.lock().expect("cache mutex poisoned");
        cache.clear_storage(&storage.unique_name);
    }
}

fn allocate_id(txn: &redb::WriteTransaction) -> Result<StorageId> {
    let mut meta = txn
        .open_table(META_TABLE)
        .map_err(|e| Error::Io(format!("Unable to open meta table: {e}")))?;
    let next = meta
        .get(NEXT_ID_KEY)
        .map_err(|e| Error::Io(format!("Unable to read id counter: {e}")))?
        .map(|guard| guard.value())
        .unwrap_or(1);
    meta.insert(NEXT_ID_KEY, next + 1)
        .map_err(|e| Error::Io(format!("Unable to bump id counter: {e}")))?;
    Ok(next)
}

/// Apply the index-key delta of one entry to the four reverse-index tables
fn update_index_tables(
    storage: &DatabaseStorage,
    txn: &redb::WriteTransaction,
    entry_name: &str,
    old_keys: Option<StorageIndexKeys>,
    new_keys: Option<StorageIndexKeys>,
) -> Result<()> {
    let old_keys = old_keys.unwrap_or_default();
    let new_keys = new_keys.unwrap_or_default();
    let old_sets = [
        &old_keys.provides,
        &old_keys.requires,
        &old_keys.libprovides,
        &old_keys.librequires,
    ];
    let new_sets = [
        &new_keys.provides,
        &new_keys.requires,
        &new_keys.libprovides,
        &new_keys.librequires,
    ];
    for (def, table_index) in storage.index_defs() {
        let mut table = txn
            .open_table(def)
            .map_err(|e| Error::Io(format!("Unable to open index table: {e}")))?;
        for removed in old_sets[table_index]
            .iter()
            .filter(|key| !new_sets[table_index].contains(key))
        {
            let mut names = read_index_entry(&table, removed)?;
            names.retain(|name| name != entry_name);
            write_index_entry(&mut table, removed, names)?;
        }
        for added in new_sets[table_index].iter() {
            let mut names = read_index_entry(&table, added)?;
            if !names.iter().any(|name| name == entry_name) {
                names.push(entry_name.to_string());
            }
            write_index_entry(&mut table, added, names)?;
        }
    }
    Ok(())
}

fn read_index_entry(
    table: &redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
) -> Result<Vec<String>> {
    let Some(guard) = table
        .get(key)
        .map_err(|e| Error::Io(format!("Unable to read index entry: {e}")))?
    else {
        return Ok(Vec::new());
    };
    bincode::deserialize(guard.value())
        .map_err(|e| Error::Consistency(format!("Corrupt index entry: {e}")))
}

fn write_index_entry(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
    names: Vec<String>,
) -> Result<()> {
    if names.is_empty() {
        table
            .remove(key)
            .map_err(|e| Error::Io(format!("Unable to remove index entry: {e}")))?;
        return Ok(());
    }
    let bytes = bincode::serialize(&names)
        .map_err(|e| Error::Io(format!("Unable to serialize index entry: {e}")))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(|e| Error::Io(format!("Unable to write index entry: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::Dependency;

    fn test_env() -> (tempfile::TempDir, Arc<StorageEnv>) {
        let dir = tempfile::tempdir().unwrap();
        let env = StorageEnv::open(&dir.path().join("index.db")).unwrap();
        (dir, env)
    }

    fn sample_package(name: &str) -> Package {
        let mut package = Package::new(name, "1.0-1");
        package.dependencies = vec![Dependency::parse("glibc")];
        package.libprovides = vec![format!("elf-x86_64::lib{name}.so.1")];
        package
    }

    #[test]
    fn test_store_then_retrieve_round_trip() {
        let (_dir, env) = test_env();
        let storage = env.database_storage("core@x86_64");
        let cache = PackageCache::default();

        let package = sample_package("zstd");
        let stored = cache.store(&storage, package.clone(), false).unwrap();
        assert!(stored.updated);
        assert_ne!(stored.id, 0);

        let (id, retrieved) = cache.retrieve(&storage, "zstd").unwrap();
        assert_eq!(id, stored.id);
        assert_eq!(retrieved.unwrap(), package);
    }

    #[test]
    fn test_identical_store_is_no_op() {
        let (_dir, env) = test_env();
        let storage = env.database_storage("core@x86_64");
        let cache = PackageCache::default();

        let package = sample_package("zstd");
        let first = cache.store(&storage, package.clone(), false).unwrap();
        let second = cache.store(&storage, package.clone(), false).unwrap();
        assert!(first.updated);
        assert!(!second.updated);
        assert_eq!(first.id, second.id);

        let forced = cache.store(&storage, package, true).unwrap();
        assert!(forced.updated);
        assert_eq!(forced.id, first.id);
    }

    #[test]
    fn test_store_survives_cold_cache() {
        let (_dir, env) = test_env();
        let storage = env.database_storage("core@x86_64");
        let cache = PackageCache::default();
        let stored = cache.store(&storage, sample_package("zstd"), false).unwrap();

        // a fresh cache has to go through the backing store
        let cold = PackageCache::default();
        let (id, entry) = cold.retrieve(&storage, "zstd").unwrap();
        assert_eq!(id, stored.id);
        assert_eq!(entry.unwrap().name, "zstd");
    }

    #[test]
    fn test_invalidate_removes_everywhere() {
        let (_dir, env) = test_env();
        let storage = env.database_storage("core@x86_64");
        let cache = PackageCache::default();
        cache.store(&storage, sample_package("zstd"), false).unwrap();

        assert!(cache.invalidate(&storage, "zstd").unwrap());
        let (id, entry) = cache.retrieve(&storage, "zstd").unwrap();
        assert_eq!(id, 0);
        assert!(entry.is_none());
        assert!(!cache.invalidate(&storage, "zstd").unwrap());
    }

    #[test]
    fn test_clear_truncates_all_tables() {
        let (_dir, env) = test_env();
        let storage = env.database_storage("core@x86_64");
        let cache = PackageCache::default();
        cache.store(&storage, sample_package("zstd"), false).unwrap();
        cache.store(&storage, sample_package("zlib"), false).unwrap();

        cache.clear(&storage).unwrap();
        assert_eq!(cache.retrieve(&storage, "zstd").unwrap().0, 0);
        assert!(storage.all_entries::<Package>().unwrap().is_empty());
    }

    #[test]
    fn test_merge_preserves_contents_derived_fields() {
        let (_dir, env) = test_env();
        let storage = env.database_storage("core@x86_64");
        let cache = PackageCache::default();

        let mut analyzed = sample_package("zstd");
        analyzed.origin = crate::packages::PackageOrigin::PackageContents;
        analyzed.package_info = Some(Default::default());
        analyzed.libdepends = vec!["elf-x86_64::libc.so.6".to_string()];
        cache.store(&storage, analyzed, false).unwrap();

        // same identity arriving from a database reload keeps the parsed libs
        let mut plain = Package::new("zstd", "1.0-1");
        plain.dependencies = vec![Dependency::parse("glibc")];
        plain.package_info = Some(Default::default());
        let result = cache.store(&storage, plain, false).unwrap();
        assert!(result.updated);

        let (_, merged) = cache.retrieve(&storage, "zstd").unwrap();
        assert_eq!(
            merged.unwrap().libdepends,
            vec!["elf-x86_64::libc.so.6".to_string()]
        );
    }

    #[test]
    fn test_eviction_respects_limit() {
        let (_dir, env) = test_env();
        let storage = env.database_storage("core@x86_64");
        let cache: StorageCache<Package> = StorageCache::new(2);
        for name in ["a", "b", "c"] {
            cache.store(&storage, sample_package(name), false).unwrap();
        }
        {
            let entries = cache.entries.lock().unwrap();
            assert_eq!(entries.map.len(), 2);
        }
        // evicted entries are still retrievable through the backing store
        let (id, entry) = cache.retrieve(&storage, "a").unwrap();
        assert_ne!(id, 0);
        assert!(entry.is_some());
    }

    #[test]
    fn test_ids_are_distinct_per_environment() {
        let (_dir, env) = test_env();
        let core = env.database_storage("core@x86_64");
        let extra = env.database_storage("extra@x86_64");
        let cache = PackageCache::default();
        let first = cache.store(&core, sample_package("a"), false).unwrap();
        let second = cache.store(&extra, sample_package("a"), false).unwrap();
        assert_ne!(first.id, second.id);
    }
}
