//! The driver: binds one feature family to one storage backend (flat
//! store for dense families, bucket or disk inverted index for sparse
//! families) and one master relation, behind a single reentrant lock
//! guarding `{store, pull state, family settings}`. Generic logic
//! (insert/remove/search/pull) is independent of the concrete family —
//! the family is injected as a `dyn Family` trait object: one generic
//! wrapper holding the lock, with the concrete index swapped in as a
//! trait object/parameter.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::ReentrantMutex;
use std::cell::RefCell;

use crate::error::{Error, Result};
use crate::feature::{Family, FeatureValue};
use crate::id::Id;
use crate::master::{MasterStore, ShardPredicate};
use crate::pull;
use crate::search::{Hit, DEFAULT_HIT_THRESHOLD};
use crate::store::{BucketIndex, DiskIndex, FixedStore, InvertedIndex};

/// Which storage backend a driver instance is bound to. Selected once
/// at construction by `family.is_sparse()` and the configured
/// `driver.name`/on-disk-vs-bucket choice.
enum Storage {
    Fixed(FixedStore),
    Bucket(BucketIndex),
    Disk(DiskIndex),
}

impl Storage {
    fn as_inverted(&mut self) -> Option<&mut dyn InvertedIndex> {
        match self {
            Storage::Bucket(b) => Some(b),
            Storage::Disk(d) => Some(d),
            Storage::Fixed(_) => None,
        }
    }
}

struct DriverState {
    family: Box<dyn Family>,
    master: Box<dyn MasterStore>,
    storage: Storage,
    shard: ShardPredicate,
    hit_threshold: usize,
    settings: HashMap<String, String>,
}

/// A bound driver instance: one family, one storage backend, one
/// master relation.
pub struct Driver {
    state: ReentrantMutex<RefCell<DriverState>>,
}

/// Where a driver's storage lives and how it is organized, resolved
/// from `driver.data_dir`/`driver.name` at construction time.
pub enum StorageConfig {
    Fixed { dir: PathBuf, prefix: String, vector_record_len: usize, create: bool },
    Bucket,
    Disk { dir: PathBuf },
}

impl Driver {
    pub fn open(
        family: Box<dyn Family>,
        master: Box<dyn MasterStore>,
        shard: ShardPredicate,
        storage_config: StorageConfig,
        hit_threshold: Option<usize>,
    ) -> Result<Driver> {
        let storage = match storage_config {
            StorageConfig::Fixed { dir, prefix, vector_record_len, create } => {
                let store = if create {
                    FixedStore::create(&dir, &prefix, vector_record_len)?
                } else {
                    FixedStore::open(&dir, &prefix, vector_record_len)?
                };
                Storage::Fixed(store)
            }
            StorageConfig::Bucket => Storage::Bucket(BucketIndex::new()),
            StorageConfig::Disk { dir } => Storage::Disk(DiskIndex::open(&dir)?),
        };
        Ok(Driver {
            state: ReentrantMutex::new(RefCell::new(DriverState {
                family,
                master,
                storage,
                shard,
                hit_threshold: hit_threshold.unwrap_or(DEFAULT_HIT_THRESHOLD),
                settings: HashMap::new(),
            })),
        })
    }

    pub fn family_name(&self) -> String {
        let guard = self.state.lock();
        guard.borrow().family.name().to_string()
    }

    pub fn serialize(&self, feature: &FeatureValue) -> Result<String> {
        let guard = self.state.lock();
        guard.borrow().family.serialize(feature)
    }

    pub fn deserialize(&self, s: &str) -> Result<FeatureValue> {
        let guard = self.state.lock();
        guard.borrow().family.deserialize(s)
    }

    pub fn similarity(&self, a: &FeatureValue, b: &FeatureValue) -> Result<f32> {
        let guard = self.state.lock();
        guard.borrow().family.similarity(a, b)
    }

    pub fn extract_image(&self, width: u32, height: u32, rgb: &[u8]) -> Result<FeatureValue> {
        let guard = self.state.lock();
        guard.borrow().family.extract_image(width, height, rgb)
    }

    pub fn extract_data(&self, data: &[u8]) -> Result<FeatureValue> {
        let guard = self.state.lock();
        guard.borrow().family.extract_data(data)
    }

    pub fn extract_file(&self, path: &std::path::Path) -> Result<FeatureValue> {
        let guard = self.state.lock();
        guard.borrow().family.extract_file(path)
    }

    pub fn count(&self) -> Result<i64> {
        let guard = self.state.lock();
        let state = guard.borrow();
        Ok(match &state.storage {
            Storage::Fixed(s) => s.count(),
            Storage::Bucket(b) => b.count(),
            Storage::Disk(d) => d.count(),
        })
    }

    /// `exists(id)`: true if master still carries a non-tombstoned row
    /// for `id`.
    pub fn exists(&self, id: &Id) -> Result<bool> {
        let guard = self.state.lock();
        guard.borrow().master.exists(id)
    }

    /// `query.id` lookup: retrieve the locally persisted feature for
    /// `id`, if the local index has pulled it. Backs `search_by_id` and
    /// `similarity_by_id`.
    pub fn get_feature_by_id(&self, id: &Id) -> Result<FeatureValue> {
        let guard = self.state.lock();
        let state = guard.borrow();
        match &state.storage {
            Storage::Fixed(store) => {
                let (_, bytes) = store
                    .find_by_id(id)
                    .ok_or_else(|| err_at!(NoData, "id {} not found in local store", id))?;
                feature_from_fixed_bytes(state.family.as_ref(), bytes)
            }
            Storage::Bucket(index) => get_feature_from_inverted(index, id),
            Storage::Disk(index) => get_feature_from_inverted(index, id),
        }
    }

    /// `insert`: idempotent upsert against the master relation. Does
    /// not touch local storage — that happens on the next `pull`,
    /// matching the eventual-consistency design.
    pub fn insert(&self, id: &Id, feature: &FeatureValue) -> Result<String> {
        let guard = self.state.lock();
        let state = guard.borrow();
        let text = state.family.serialize(feature)?;
        if state.master.exists(id)? {
            state.master.update_flag(id, 0)?;
        } else {
            state.master.insert_if_absent(id, &text)?;
        }
        Ok(id.to_hex())
    }

    /// `remove`: tombstone the master row; the local index observes
    /// this on the next pull.
    pub fn remove(&self, id: &Id) -> Result<()> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state.master.update_flag(id, 1)?;
        Ok(())
    }

    pub fn set_setting(&self, key: &str, value: &str) {
        let guard = self.state.lock();
        guard.borrow_mut().settings.insert(key.to_string(), value.to_string());
    }

    pub fn get_setting(&self, key: &str) -> Option<String> {
        let guard = self.state.lock();
        guard.borrow().settings.get(key).cloned()
    }

    pub fn unset_setting(&self, key: &str) {
        let guard = self.state.lock();
        guard.borrow_mut().settings.remove(key);
    }

    /// Family-specific control channel, e.g. `update_idf`/`print_idf`.
    /// Unknown methods report `NotImplemented`.
    pub fn invoke(&self, method: &str) -> Result<String> {
        match method {
            "print_idf" => {
                let guard = self.state.lock();
                Ok(format!("{:?}", guard.borrow().settings))
            }
            _ => Err(err_at!(NotImplemented, "unknown control method {:?}", method)),
        }
    }

    /// Reconcile local storage with the master relation (both pull
    /// phases), holding the driver lock for the whole call so search
    /// either sees all of a batch or none.
    pub fn pull(&self) -> Result<(i64, i64)> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let shard = state.shard.clone();
        let DriverState {
            family,
            master,
            storage,
            ..
        } = &mut *state;

        let (last_no, last_commit_no) = match storage {
            Storage::Fixed(store) => {
                let start_no = store.last_no();
                let family_ref = family.as_ref();
                let new_no = pull::pull_new_records(
                    master.as_ref(),
                    &|s| family_ref.deserialize(s),
                    &shard,
                    start_no,
                    |batch| {
                        let record_len = store.vector_record_len();
                        for record in batch {
                            let bytes = feature_to_fixed_bytes(&record.feature, record_len)?;
                            let next_index = store.count() as usize;
                            store.extend(next_index as i64)?;
                            store.set(next_index, record.seq, record.id, 0, &bytes)?;
                        }
                        store.sync()
                    },
                )?;
                let start_commit = store.last_commit_no();
                let new_commit = pull::pull_flag_updates(master.as_ref(), &shard, start_commit, |seq, flag| {
                    store.update_flag(seq, flag)
                })?;
                store.set_last_no(new_no)?;
                store.set_last_commit_no(new_commit)?;
                store.sync()?;
                (new_no, new_commit)
            }
            Storage::Bucket(index) => pull_into_inverted(index, family.as_ref(), master.as_ref(), &shard)?,
            Storage::Disk(index) => pull_into_inverted(index, family.as_ref(), master.as_ref(), &shard)?,
        };
        Ok((last_no, last_commit_no))
    }

    /// Top-`limit` search for a query feature. Dispatches on storage
    /// kind: a full scan with bit/dense cosine for the fixed store, or
    /// `search_cosine` over the posting lists for the inverted-index
    /// backends.
    pub fn search(&self, limit: usize, query: &FeatureValue) -> Result<Vec<Hit>> {
        let guard = self.state.lock();
        let state = guard.borrow();
        match &state.storage {
            Storage::Fixed(store) => {
                let family = state.family.as_ref();
                let scored: Vec<(Id, FeatureValue)> = store
                    .iter()
                    .filter(|(rec, _)| rec.flag & 1 == 0)
                    .filter_map(|(rec, bytes)| {
                        feature_from_fixed_bytes(family, bytes).ok().map(|f| (rec.id, f))
                    })
                    .collect();
                let hits = crate::search::rank_top_k(&scored, limit, |(id, feature)| {
                    let sim = family.similarity(query, feature).ok()?;
                    Some((*id, sim))
                });
                Ok(hits)
            }
            Storage::Bucket(index) => search_inverted(index, state.family.as_ref(), query, limit, state.hit_threshold),
            Storage::Disk(index) => search_inverted(index, state.family.as_ref(), query, limit, state.hit_threshold),
        }
    }

    pub fn vacuum_index(&self) -> Result<i64> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        match &mut state.storage {
            Storage::Fixed(s) => s.vacuum(),
            Storage::Bucket(b) => b.vacuum(),
            Storage::Disk(d) => d.vacuum(),
        }
    }

    pub fn drop_index(&self) -> Result<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if let Some(inverted) = state.storage.as_inverted() {
            inverted.clear()?;
        }
        Ok(())
    }

    pub fn create_database(&self) -> Result<()> {
        let guard = self.state.lock();
        guard.borrow().master.create_database()
    }

    pub fn drop_database(&self) -> Result<()> {
        let guard = self.state.lock();
        guard.borrow().master.drop_database()
    }
}

fn search_inverted(
    index: &dyn InvertedIndex,
    family: &dyn Family,
    query: &FeatureValue,
    limit: usize,
    hit_threshold: usize,
) -> Result<Vec<Hit>> {
    let words = family
        .word_list(query)
        .ok_or_else(|| err_at!(InvalidArguments, "family {} has no sparse word list", family.name()))?;
    let weight = |w: u32| family.weight(w);
    index.search_cosine(limit, &words, hit_threshold, &weight)
}

fn pull_into_inverted(
    index: &mut dyn InvertedIndex,
    family: &dyn Family,
    master: &dyn MasterStore,
    shard: &ShardPredicate,
) -> Result<(i64, i64)> {
    let start_no = index.get_last_no();
    let new_no = pull::pull_new_records(master, &|s| family.deserialize(s), shard, start_no, |batch| {
        let records: Vec<crate::store::PostingRecord> = batch
            .iter()
            .map(|r| {
                let words = family.word_list(&r.feature).unwrap_or_default();
                crate::store::PostingRecord {
                    no: r.seq,
                    id: r.id,
                    words,
                }
            })
            .collect();
        index.batch_set(&records, &|w| family.weight(w))?;
        index.sync()
    })?;
    let start_commit = index.get_last_commit_no();
    let new_commit = pull::pull_flag_updates(master, shard, start_commit, |seq, flag| index.set_flag(seq, flag))?;
    index.set_last_no(new_no)?;
    index.set_last_commit_no(new_commit)?;
    index.sync()?;
    Ok((new_no, new_commit))
}

fn get_feature_from_inverted(index: &dyn InvertedIndex, id: &Id) -> Result<FeatureValue> {
    let no = index
        .find_no_by_id(id)
        .ok_or_else(|| err_at!(NoData, "id {} not found in local index", id))?;
    let words = index
        .words_at(no)?
        .ok_or_else(|| err_at!(NoData, "id {} has no posting words", id))?;
    Ok(FeatureValue::Sparse(crate::feature::SparseFeature::from_words(words)))
}

/// Fixed-width byte encoding used to round-trip a `FeatureValue`
/// through the flat store's opaque vector slots: the family's own
/// printable serialization, UTF-8 bytes, right-padded with NULs to a
/// caller-chosen fixed width (`vector_record_len`).
fn feature_to_fixed_bytes(feature: &FeatureValue, record_len: usize) -> Result<Vec<u8>> {
    let text = match feature {
        FeatureValue::Bit(f) => f.serialize(),
        FeatureValue::Dense(f) => f.serialize(),
        FeatureValue::Sparse(_) => {
            return Err(err_at!(
                InvalidArguments,
                "sparse features are not stored in the fixed store"
            ))
        }
    };
    let bytes = text.into_bytes();
    if bytes.len() >= record_len {
        return Err(err_at!(
            InvalidArguments,
            "serialized feature ({} bytes) does not fit the fixed record width {}",
            bytes.len(),
            record_len
        ));
    }
    let mut padded = vec![0u8; record_len];
    padded[..bytes.len()].copy_from_slice(&bytes);
    Ok(padded)
}

fn feature_from_fixed_bytes(family: &dyn Family, bytes: &[u8]) -> Result<FeatureValue> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let text = std::str::from_utf8(&bytes[..end])
        .map_err(|err| err_at!(SystemError, "non-utf8 fixed store record: {}", err))?;
    family.deserialize(text)
}

#[cfg(test)]
mod driver_test {
    use super::*;
    use crate::feature::families::Vlad128;
    use crate::master::sqlite3::Sqlite3Master;
    use crate::variant::Arena;
    use tempfile::tempdir;

    fn new_driver(dir: &std::path::Path) -> Driver {
        let arena = Arena::new();
        let config = arena.hash();
        let family = Vlad128::construct(&config).unwrap();
        let master = Sqlite3Master::open_in_memory("driver_test").unwrap();
        master.create_database().unwrap();
        Driver::open(
            family,
            Box::new(master),
            ShardPredicate::default(),
            StorageConfig::Fixed {
                dir: dir.to_path_buf(),
                prefix: "vlad128".to_string(),
                vector_record_len: 4096,
                create: true,
            },
            None,
        )
        .unwrap()
    }

    fn unit_vec(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_insert_then_pull_then_search() {
        let dir = tempdir().unwrap();
        let driver = new_driver(dir.path());

        let feature_a = FeatureValue::Dense(crate::feature::DenseFeature::new(unit_vec(128, 0), None));
        let feature_b = FeatureValue::Dense(crate::feature::DenseFeature::new(unit_vec(128, 1), None));
        let id_a = Id::of_data(b"a");
        let id_b = Id::of_data(b"b");
        driver.insert(&id_a, &feature_a).unwrap();
        driver.insert(&id_b, &feature_b).unwrap();
        driver.pull().unwrap();

        assert_eq!(driver.count().unwrap(), 2);
        let hits = driver.search(10, &feature_b).unwrap();
        assert_eq!(hits[0].id, id_b);
    }

    #[test]
    fn test_remove_then_pull_excludes_from_search() {
        let dir = tempdir().unwrap();
        let driver = new_driver(dir.path());
        let feature = FeatureValue::Dense(crate::feature::DenseFeature::new(unit_vec(128, 2), None));
        let id = Id::of_data(b"removable");
        driver.insert(&id, &feature).unwrap();
        driver.pull().unwrap();
        assert!(driver.exists(&id).unwrap());

        driver.remove(&id).unwrap();
        driver.pull().unwrap();
        let hits = driver.search(10, &feature).unwrap();
        assert!(hits.iter().all(|h| h.id != id));
    }
}
