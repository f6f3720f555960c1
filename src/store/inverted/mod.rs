//! Sparse inverted index: one abstract interface, two backends. The
//! in-memory bucket ([`bucket::BucketIndex`]) and the on-disk
//! ordered-KV index ([`disk::DiskIndex`]) share the posting codec in
//! [`crate::varbyte`] and the ranking helpers in [`crate::search`].

pub mod bucket;
pub mod disk;

use crate::error::Result;
use crate::id::Id;
use crate::search::Hit;

/// One record of a `batch_set` call: a local sequence number, the
/// image id, and its sparse word list.
pub struct PostingRecord {
    pub no: i64,
    pub id: Id,
    pub words: Vec<u32>,
}

/// Shared interface over the in-memory bucket and on-disk KV inverted
/// index backends.
pub trait InvertedIndex: Send + Sync {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn clear(&mut self) -> Result<()>;
    fn vacuum(&mut self) -> Result<i64>;

    /// Reentrant-lock acquire for the bucket backend; a no-op success
    /// for the lock-free on-disk backend.
    fn begin_writer(&self);
    fn begin_reader(&self);
    fn end(&self);

    /// `weight` is the same per-word weight function injected before
    /// searches (spec.md §4.4): a backend that persists a per-record
    /// norm (the on-disk variant) must compute it under this weighting
    /// so a later `search_cosine` under the same weighting stays
    /// symmetric (spec.md §8 property 4); a backend that recomputes the
    /// norm fresh at search time (the in-memory bucket) is free to
    /// ignore it.
    fn set(&mut self, no: i64, id: Id, words: &[u32], weight: &dyn Fn(u32) -> f32) -> Result<()>;
    fn batch_set(&mut self, records: &[PostingRecord], weight: &dyn Fn(u32) -> f32) -> Result<()>;
    fn set_flag(&mut self, no: i64, flag: u8) -> Result<()>;

    /// Rank the top `limit` postings against `query`, applying `weight`
    /// to every word and filtering runs whose hit count does not exceed
    /// `hit_threshold`.
    fn search_cosine(
        &self,
        limit: usize,
        query: &[u32],
        hit_threshold: usize,
        weight: &dyn Fn(u32) -> f32,
    ) -> Result<Vec<Hit>>;

    fn get_last_no(&self) -> i64;
    fn set_last_no(&mut self, no: i64) -> Result<()>;
    fn get_last_commit_no(&self) -> i64;
    fn set_last_commit_no(&mut self, commit_no: i64) -> Result<()>;

    /// Linear scan by `id`, for the facade's `query.id` lookup path.
    fn find_no_by_id(&self, id: &Id) -> Option<i64>;

    /// Retrieve the sparse word list persisted for `no`, if present.
    fn words_at(&self, no: i64) -> Result<Option<Vec<u32>>>;

    fn count(&self) -> i64;
    fn hash_count(&self, word: u32) -> i64;
    fn sync(&mut self) -> Result<()>;
    fn update_count(&mut self) -> Result<()>;
}
