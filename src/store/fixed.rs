//! Flat memory-mapped store: three files per store holding a fixed-size
//! metadata header, an append-only index ordered by `seq`, and a
//! parallel array of fixed-size feature vectors. Grounded on
//! `otama_fixed_strage.hpp`; byte layout follows `robt`'s file-format
//! style of raw `to_le_bytes`/`from_le_bytes` slicing rather than a
//! padding-sensitive derive crate.

use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::id::{Id, ID_LEN};

const METADATA_RECORD_LEN: usize = 8 * 4; // count_max, last_no, last_commit_no, count
const INDEX_RECORD_LEN: usize = 8 + 8 + ID_LEN + 1; // index, seq, id, flag
const EXTEND_CHUNK: i64 = 10_000;

fn metadata_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{}_metadata", prefix))
}

fn index_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{}_index", prefix))
}

fn vector_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{}_vector", prefix))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Header {
    count_max: i64,
    last_no: i64,
    last_commit_no: i64,
    count: i64,
}

impl Header {
    fn to_bytes(self) -> [u8; METADATA_RECORD_LEN] {
        let mut buf = [0u8; METADATA_RECORD_LEN];
        buf[0..8].copy_from_slice(&self.count_max.to_le_bytes());
        buf[8..16].copy_from_slice(&self.last_no.to_le_bytes());
        buf[16..24].copy_from_slice(&self.last_commit_no.to_le_bytes());
        buf[24..32].copy_from_slice(&self.count.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Header {
        Header {
            count_max: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            last_no: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            last_commit_no: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
            count: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
        }
    }
}

/// One fixed-length index record: `{ index, seq, id, flag }`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexRecord {
    pub index: i64,
    pub seq: i64,
    pub id: Id,
    pub flag: u8,
}

impl IndexRecord {
    fn to_bytes(self) -> [u8; INDEX_RECORD_LEN] {
        let mut buf = [0u8; INDEX_RECORD_LEN];
        buf[0..8].copy_from_slice(&self.index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.seq.to_le_bytes());
        buf[16..16 + ID_LEN].copy_from_slice(self.id.as_bytes());
        buf[16 + ID_LEN] = self.flag;
        buf
    }

    fn from_bytes(buf: &[u8]) -> IndexRecord {
        let mut id_bytes = [0u8; ID_LEN];
        id_bytes.copy_from_slice(&buf[16..16 + ID_LEN]);
        IndexRecord {
            index: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            seq: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            id: Id::from_bytes(id_bytes),
            flag: buf[16 + ID_LEN],
        }
    }

    /// Sentinel empty record occupying an as-yet-unwritten slot.
    fn empty() -> IndexRecord {
        IndexRecord {
            index: -1,
            seq: -1,
            id: Id::from_bytes([0u8; ID_LEN]),
            flag: 0,
        }
    }
}

/// A fixed memory-mapped store for one family's vectors, of
/// caller-chosen fixed record width `vector_record_len`. Feature byte
/// encoding is owned by the family; this store only moves opaque
/// fixed-width byte blocks.
pub struct FixedStore {
    dir: PathBuf,
    prefix: String,
    vector_record_len: usize,
    metadata_file: File,
    index_file: File,
    vector_file: File,
    metadata_map: MmapMut,
    index_map: MmapMut,
    vector_map: MmapMut,
    header: Header,
}

impl FixedStore {
    /// Initialize the three files with `count_max = 10_000`,
    /// `last_no = last_commit_no = -1`, `count = 0`.
    pub fn create(dir: &Path, prefix: &str, vector_record_len: usize) -> Result<FixedStore> {
        std::fs::create_dir_all(dir)?;
        let header = Header {
            count_max: EXTEND_CHUNK,
            last_no: -1,
            last_commit_no: -1,
            count: 0,
        };
        write_new_file(&metadata_path(dir, prefix), &header.to_bytes())?;
        let empty_index = IndexRecord::empty().to_bytes();
        let mut index_bytes = Vec::with_capacity(INDEX_RECORD_LEN * header.count_max as usize);
        for _ in 0..header.count_max {
            index_bytes.extend_from_slice(&empty_index);
        }
        write_new_file(&index_path(dir, prefix), &index_bytes)?;
        write_new_file(
            &vector_path(dir, prefix),
            &vec![0u8; vector_record_len * header.count_max as usize],
        )?;
        FixedStore::open(dir, prefix, vector_record_len)
    }

    /// Maps the three files at their current `count_max`.
    pub fn open(dir: &Path, prefix: &str, vector_record_len: usize) -> Result<FixedStore> {
        let metadata_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(metadata_path(dir, prefix))?;
        let mut metadata_map = unsafe { MmapOptions::new().map_mut(&metadata_file)? };
        let header = Header::from_bytes(&metadata_map[..METADATA_RECORD_LEN]);

        let index_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(index_path(dir, prefix))?;
        let index_map = unsafe { MmapOptions::new().map_mut(&index_file)? };

        let vector_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(vector_path(dir, prefix))?;
        let vector_map = unsafe { MmapOptions::new().map_mut(&vector_file)? };

        metadata_map.flush()?;
        Ok(FixedStore {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            vector_record_len,
            metadata_file,
            index_file,
            vector_file,
            metadata_map,
            index_map,
            vector_map,
            header,
        })
    }

    pub fn count_max(&self) -> i64 {
        self.header.count_max
    }

    pub fn vector_record_len(&self) -> usize {
        self.vector_record_len
    }

    pub fn count(&self) -> i64 {
        self.header.count
    }

    pub fn last_no(&self) -> i64 {
        self.header.last_no
    }

    pub fn last_commit_no(&self) -> i64 {
        self.header.last_commit_no
    }

    /// Doubles `count_max` in chunks of 10,000 until `n < count_max`,
    /// truncating and remapping both the index and vector files.
    pub fn extend(&mut self, n: i64) -> Result<()> {
        let mut new_max = self.header.count_max;
        while n >= new_max {
            new_max += EXTEND_CHUNK;
        }
        if new_max == self.header.count_max {
            return Ok(());
        }
        let new_index_len = INDEX_RECORD_LEN * new_max as usize;
        let new_vector_len = self.vector_record_len * new_max as usize;
        self.index_file.set_len(new_index_len as u64)?;
        self.vector_file.set_len(new_vector_len as u64)?;

        let empty_index = IndexRecord::empty().to_bytes();
        let old_max = self.header.count_max;
        self.index_map = unsafe { MmapOptions::new().map_mut(&self.index_file)? };
        for i in old_max..new_max {
            let off = i as usize * INDEX_RECORD_LEN;
            self.index_map[off..off + INDEX_RECORD_LEN].copy_from_slice(&empty_index);
        }
        self.vector_map = unsafe { MmapOptions::new().map_mut(&self.vector_file)? };

        self.header.count_max = new_max;
        self.write_header()?;
        Ok(())
    }

    /// Writes the i-th index record and vector. Caller guarantees
    /// `i < count_max`.
    pub fn set(&mut self, i: usize, seq: i64, id: Id, flag: u8, vec_bytes: &[u8]) -> Result<()> {
        if (i as i64) >= self.header.count_max {
            return Err(err_at!(
                InvalidArguments,
                "set index {} out of bounds for count_max {}",
                i,
                self.header.count_max
            ));
        }
        if vec_bytes.len() != self.vector_record_len {
            return Err(err_at!(
                InvalidArguments,
                "vector length {} != record length {}",
                vec_bytes.len(),
                self.vector_record_len
            ));
        }
        let record = IndexRecord {
            index: i as i64,
            seq,
            id,
            flag,
        };
        let off = i * INDEX_RECORD_LEN;
        self.index_map[off..off + INDEX_RECORD_LEN].copy_from_slice(&record.to_bytes());

        let voff = i * self.vector_record_len;
        self.vector_map[voff..voff + self.vector_record_len].copy_from_slice(vec_bytes);

        if seq > self.header.last_no {
            self.header.last_no = seq;
        }
        if (i as i64) >= self.header.count {
            self.header.count = i as i64 + 1;
        }
        self.write_header()
    }

    /// Binary-searches the index by `seq`, returning the matching
    /// record and its vector bytes.
    pub fn try_load(&self, seq: i64) -> Option<(IndexRecord, &[u8])> {
        let i = self.binary_search_by_seq(seq)?;
        let record = self.record_at(i);
        let voff = i * self.vector_record_len;
        Some((record, &self.vector_map[voff..voff + self.vector_record_len]))
    }

    /// Binary-search by `seq` then in-place byte write of the flag.
    pub fn update_flag(&mut self, seq: i64, flag: u8) -> Result<()> {
        match self.binary_search_by_seq(seq) {
            Some(i) => {
                let off = i * INDEX_RECORD_LEN + 16 + ID_LEN;
                self.index_map[off] = flag;
                Ok(())
            }
            None => Err(err_at!(NoData, "no record with seq {}", seq)),
        }
    }

    pub fn set_last_no(&mut self, seq: i64) -> Result<()> {
        self.header.last_no = seq;
        self.write_header()
    }

    pub fn set_last_commit_no(&mut self, commit_no: i64) -> Result<()> {
        self.header.last_commit_no = commit_no;
        self.write_header()
    }

    /// Syncs each mapping and reloads `count` from the persistent
    /// header, absorbing concurrent extensions performed by another
    /// process sharing these files.
    pub fn sync(&mut self) -> Result<()> {
        self.index_map.flush()?;
        self.vector_map.flush()?;
        self.metadata_map.flush()?;
        let on_disk = Header::from_bytes(&self.metadata_map[..METADATA_RECORD_LEN]);
        if on_disk.count_max != self.header.count_max {
            self.index_map = unsafe { MmapOptions::new().map_mut(&self.index_file)? };
            self.vector_map = unsafe { MmapOptions::new().map_mut(&self.vector_file)? };
        }
        self.header = on_disk;
        Ok(())
    }

    /// No-op for this backend: physical compaction has no meaning for
    /// an append-only array store.
    pub fn vacuum(&mut self) -> Result<i64> {
        Ok(0)
    }

    /// Linear scan by `id`, for the facade's `query.id` lookup path.
    /// The index is ordered by `seq`, not `id`, so this cannot binary
    /// search.
    pub fn find_by_id(&self, id: &Id) -> Option<(IndexRecord, &[u8])> {
        self.iter().find(|(rec, _)| &rec.id == id)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Iterate over every occupied record (index < count), in index
    /// order, for full-scan similarity search against the flat store.
    pub fn iter(&self) -> impl Iterator<Item = (IndexRecord, &[u8])> {
        let count = self.header.count as usize;
        (0..count).map(move |i| {
            let record = self.record_at(i);
            let voff = i * self.vector_record_len;
            (record, &self.vector_map[voff..voff + self.vector_record_len])
        })
    }

    fn record_at(&self, i: usize) -> IndexRecord {
        let off = i * INDEX_RECORD_LEN;
        IndexRecord::from_bytes(&self.index_map[off..off + INDEX_RECORD_LEN])
    }

    fn binary_search_by_seq(&self, seq: i64) -> Option<usize> {
        let count = self.header.count as usize;
        if count == 0 {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let r = self.record_at(mid);
            match r.seq.cmp(&seq) {
                std::cmp::Ordering::Equal => return Some(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        None
    }

    fn write_header(&mut self) -> Result<()> {
        self.metadata_map[..METADATA_RECORD_LEN].copy_from_slice(&self.header.to_bytes());
        Ok(())
    }
}

fn write_new_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    f.write_all(bytes)?;
    f.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod fixed_test {
    use super::*;
    use tempfile::tempdir;

    fn sample_id(tag: u8) -> Id {
        Id::from_bytes([tag; ID_LEN])
    }

    #[test]
    fn test_create_then_open_has_empty_header() {
        let dir = tempdir().unwrap();
        let store = FixedStore::create(dir.path(), "feat", 16).unwrap();
        assert_eq!(store.count(), 0);
        assert_eq!(store.last_no(), -1);
        assert_eq!(store.count_max(), EXTEND_CHUNK);
    }

    #[test]
    fn test_set_and_try_load_round_trip() {
        let dir = tempdir().unwrap();
        let mut store = FixedStore::create(dir.path(), "feat", 8).unwrap();
        store.set(0, 5, sample_id(1), 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        store.set(1, 10, sample_id(2), 0, &[9, 9, 9, 9, 9, 9, 9, 9]).unwrap();

        let (rec, bytes) = store.try_load(10).unwrap();
        assert_eq!(rec.seq, 10);
        assert_eq!(rec.id, sample_id(2));
        assert_eq!(bytes, &[9, 9, 9, 9, 9, 9, 9, 9]);

        assert!(store.try_load(999).is_none());
    }

    #[test]
    fn test_update_flag() {
        let dir = tempdir().unwrap();
        let mut store = FixedStore::create(dir.path(), "feat", 4).unwrap();
        store.set(0, 1, sample_id(1), 0, &[0, 0, 0, 0]).unwrap();
        store.update_flag(1, 1).unwrap();
        let (rec, _) = store.try_load(1).unwrap();
        assert_eq!(rec.flag, 1);
    }

    #[test]
    fn test_extend_doubles_in_chunks_and_preserves_data() {
        let dir = tempdir().unwrap();
        let mut store = FixedStore::create(dir.path(), "feat", 4).unwrap();
        store.set(0, 1, sample_id(1), 0, &[1, 1, 1, 1]).unwrap();
        store.extend(EXTEND_CHUNK + 5).unwrap();
        assert_eq!(store.count_max(), EXTEND_CHUNK * 2);
        let (rec, bytes) = store.try_load(1).unwrap();
        assert_eq!(rec.id, sample_id(1));
        assert_eq!(bytes, &[1, 1, 1, 1]);
    }

    #[test]
    fn test_reopen_sees_persisted_state() {
        let dir = tempdir().unwrap();
        {
            let mut store = FixedStore::create(dir.path(), "feat", 4).unwrap();
            store.set(0, 1, sample_id(7), 0, &[7, 7, 7, 7]).unwrap();
            store.sync().unwrap();
        }
        let store = FixedStore::open(dir.path(), "feat", 4).unwrap();
        let (rec, bytes) = store.try_load(1).unwrap();
        assert_eq!(rec.id, sample_id(7));
        assert_eq!(bytes, &[7, 7, 7, 7]);
    }

    #[test]
    fn test_vacuum_is_noop() {
        let dir = tempdir().unwrap();
        let mut store = FixedStore::create(dir.path(), "feat", 4).unwrap();
        assert_eq!(store.vacuum().unwrap(), 0);
    }
}
