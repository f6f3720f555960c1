//! The pull protocol: reconciles a local index against the master
//! relation in two phases, each atomic against the local writer lock.
//! Grounded directly on the two-phase loop described for `driver.pull`.

use log::{info, warn};

use crate::error::{Error, Result};
use crate::feature::FeatureValue;
use crate::master::{MasterStore, ShardPredicate, PULL_LIMIT};

/// One feature extracted from a pulled master row, ready to be appended
/// to a storage backend.
pub struct PulledRecord {
    pub seq: i64,
    pub id: crate::id::Id,
    pub feature: FeatureValue,
}

/// Phase 1: fetch and deserialize every row newer than `last_no`, in
/// `PULL_LIMIT`-sized batches, handing each batch to `apply_batch`
/// before advancing the watermark. Returns the final `last_no`.
///
/// `apply_batch` is expected to append every record to the storage
/// backend and persist `store.sync()`; a parse failure aborts the pull
/// and leaves the watermark at the last successful checkpoint, so a
/// retry resumes cleanly.
pub fn pull_new_records<M, F>(
    master: &M,
    deserialize: &F,
    shard: &ShardPredicate,
    last_no: i64,
    mut apply_batch: impl FnMut(&[PulledRecord]) -> Result<()>,
) -> Result<i64>
where
    M: MasterStore + ?Sized,
    F: Fn(&str) -> Result<FeatureValue>,
{
    let (max_id, _max_commit) = master.max_id_and_commit(shard)?;
    let mut cursor = last_no;
    loop {
        let rows = master.fetch_new_rows(cursor, max_id, shard, PULL_LIMIT)?;
        if rows.is_empty() {
            break;
        }
        let mut batch = Vec::with_capacity(rows.len());
        let mut batch_max = cursor;
        for row in &rows {
            let feature = deserialize(&row.vector).map_err(|err| {
                err_at!(
                    AssertionFailure,
                    "pull: master row {} vector failed to deserialize: {}",
                    row.id,
                    err
                )
            })?;
            batch_max = batch_max.max(row.id);
            batch.push(PulledRecord {
                seq: row.id,
                id: row.otama_id,
                feature,
            });
        }
        apply_batch(&batch)?;
        cursor = batch_max;
        info!(target: "otama::pull", "pulled {} new records up to seq {}", batch.len(), cursor);
        if (rows.len() as i64) < PULL_LIMIT {
            break;
        }
    }
    Ok(cursor)
}

/// Phase 2: fetch every flag change newer than `last_commit_no` and
/// apply it via `apply_flag`. Returns the final `last_commit_no`.
pub fn pull_flag_updates<M>(
    master: &M,
    shard: &ShardPredicate,
    last_commit_no: i64,
    mut apply_flag: impl FnMut(i64, u8) -> Result<()>,
) -> Result<i64>
where
    M: MasterStore + ?Sized,
{
    let (_max_id, max_commit) = master.max_id_and_commit(shard)?;
    let updates = master.fetch_flag_updates(last_commit_no, max_commit, shard)?;
    let mut cursor = last_commit_no;
    for update in &updates {
        apply_flag(update.id, update.flag)?;
        cursor = cursor.max(update.commit_id);
    }
    if !updates.is_empty() {
        info!(target: "otama::pull", "applied {} flag updates up to commit {}", updates.len(), cursor);
    } else {
        warn!(target: "otama::pull", "no flag updates since commit {}", last_commit_no);
    }
    Ok(cursor)
}

#[cfg(test)]
mod pull_test {
    use super::*;
    use crate::feature::SparseFeature;
    use crate::id::Id;
    use crate::master::sqlite3::Sqlite3Master;

    fn fixture_master() -> Sqlite3Master {
        let master = Sqlite3Master::open_in_memory("pull_test").unwrap();
        master.create_database().unwrap();
        master
    }

    fn deserialize_sparse(s: &str) -> Result<FeatureValue> {
        Ok(FeatureValue::Sparse(SparseFeature::deserialize(s)?))
    }

    #[test]
    fn test_pull_new_records_advances_watermark_and_applies() {
        let master = fixture_master();
        let id1 = Id::of_data(b"a");
        let id2 = Id::of_data(b"b");
        master.insert_if_absent(&id1, "1 2 3").unwrap();
        master.insert_if_absent(&id2, "4 5").unwrap();

        let shard = ShardPredicate::default();
        let mut applied = Vec::new();
        let last_no = pull_new_records(&master, &deserialize_sparse, &shard, -1, |batch| {
            for r in batch {
                applied.push((r.seq, r.id));
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(applied.len(), 2);
        assert!(last_no >= 2);
    }

    #[test]
    fn test_pull_aborts_on_bad_vector_text() {
        let master = fixture_master();
        let id = Id::of_data(b"bad");
        master.insert_if_absent(&id, "not-hex-words zz").unwrap();

        let shard = ShardPredicate::default();
        let err = pull_new_records(&master, &deserialize_sparse, &shard, -1, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::AssertionFailure(_)));
    }

    #[test]
    fn test_pull_flag_updates_applies_each_change() {
        let master = fixture_master();
        let id = Id::of_data(b"flaggy");
        master.insert_if_absent(&id, "1").unwrap();
        master.update_flag(&id, 1).unwrap();

        let shard = ShardPredicate::default();
        let mut seen = Vec::new();
        let last_commit = pull_flag_updates(&master, &shard, -1, |seq, flag| {
            seen.push((seq, flag));
            Ok(())
        })
        .unwrap();

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, 1);
        assert!(last_commit >= 1);
    }
}
