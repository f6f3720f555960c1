//! The master relation: one `MasterStore` trait covering the SQL shapes
//! the pull protocol and insert/remove operations need, with three
//! concrete dialect adapters. Grounded on `otama_dbi.cpp` and its three
//! per-dialect siblings (`otama_dbi_{mysql,pgsql,sqlite3}.c`), which
//! differ only in placeholder syntax, the insert-if-absent idiom, and
//! commit-id sequence allocation.

pub mod mysql;
pub mod pgsql;
pub mod sqlite3;

use crate::error::Result;
use crate::id::Id;

/// One row fetched by the new-records phase of a pull.
pub struct MasterRow {
    pub id: i64,
    pub otama_id: Id,
    pub vector: String,
}

/// One row fetched by the flag-update phase of a pull.
pub struct FlagUpdate {
    pub id: i64,
    pub flag: u8,
    pub commit_id: i64,
}

/// A `WHERE otama_id LIKE ...` shard restriction, AND-joined prefix
/// ranges. An empty predicate selects every row.
#[derive(Clone, Debug, Default)]
pub struct ShardPredicate {
    prefixes: Vec<String>,
}

impl ShardPredicate {
    /// Parse `driver.shard` entries: single hex chars (`"a"`) or
    /// dash-ranges (`"a-f"`, `"0-7"`) expand to every hex digit in
    /// range, each becoming one `LIKE 'X%'` alternative.
    pub fn parse(entries: &[String]) -> Result<ShardPredicate> {
        let mut prefixes = Vec::new();
        for entry in entries {
            match entry.split_once('-') {
                Some((lo, hi)) if lo.len() == 1 && hi.len() == 1 => {
                    let lo = hex_value(lo.as_bytes()[0])?;
                    let hi = hex_value(hi.as_bytes()[0])?;
                    if lo > hi {
                        return Err(err_at!(InvalidArguments, "bad shard range {:?}", entry));
                    }
                    for v in lo..=hi {
                        prefixes.push(hex_digit(v).to_string());
                    }
                }
                _ => {
                    hex_value(entry.as_bytes().first().copied().ok_or_else(|| {
                        err_at!(InvalidArguments, "empty shard prefix")
                    })?)?;
                    prefixes.push(entry.clone());
                }
            }
        }
        Ok(ShardPredicate { prefixes })
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn matches(&self, id: &Id) -> bool {
        if self.prefixes.is_empty() {
            return true;
        }
        let hex = id.to_hex();
        self.prefixes.iter().any(|p| hex.starts_with(p.as_str()))
    }

    /// `otama_id LIKE 'a%' OR otama_id LIKE 'b%' ...`, AND-joinable into
    /// a larger WHERE clause by the caller (wrapped in parens).
    pub fn to_sql_fragment(&self) -> String {
        if self.prefixes.is_empty() {
            return "1=1".to_string();
        }
        self.prefixes
            .iter()
            .map(|p| format!("otama_id LIKE '{}%'", p))
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}

fn hex_value(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(err_at!(InvalidArguments, "non-hex shard digit {:?}", c as char)),
    }
}

fn hex_digit(v: u8) -> char {
    (b"0123456789abcdef"[v as usize]) as char
}

/// Backpressure bound on rows fetched per pull iteration.
pub const PULL_LIMIT: i64 = 100_000;

/// Abstract master relation access. One table per driver instance,
/// named `<namespace>_<family>` by convention of the caller (this trait
/// only needs the table name already resolved).
pub trait MasterStore: Send + Sync {
    fn create_database(&self) -> Result<()>;
    fn drop_database(&self) -> Result<()>;

    fn count(&self, shard: &ShardPredicate) -> Result<i64>;
    fn max_id_and_commit(&self, shard: &ShardPredicate) -> Result<(i64, i64)>;

    fn fetch_new_rows(
        &self,
        last_no: i64,
        max_id: i64,
        shard: &ShardPredicate,
        limit: i64,
    ) -> Result<Vec<MasterRow>>;

    fn fetch_flag_updates(
        &self,
        last_commit_no: i64,
        max_commit: i64,
        shard: &ShardPredicate,
    ) -> Result<Vec<FlagUpdate>>;

    fn exists(&self, otama_id: &Id) -> Result<bool>;

    /// `INSERT ... WHERE NOT EXISTS`-equivalent idempotent insert.
    /// Returns the allocated master `id`.
    fn insert_if_absent(&self, otama_id: &Id, vector: &str) -> Result<i64>;

    /// Update `flag` and allocate a fresh `commit_id`. Returns the new
    /// `commit_id`.
    fn update_flag(&self, otama_id: &Id, flag: u8) -> Result<i64>;
}

#[cfg(test)]
mod shard_test {
    use super::*;

    fn id_with_prefix(hexch: char) -> Id {
        let hex = format!("{}{}", hexch, "0".repeat(39));
        Id::from_hex(&hex).unwrap()
    }

    #[test]
    fn test_empty_shard_matches_everything() {
        let shard = ShardPredicate::parse(&[]).unwrap();
        assert!(shard.is_empty());
        assert!(shard.matches(&id_with_prefix('9')));
    }

    #[test]
    fn test_single_char_shard() {
        let shard = ShardPredicate::parse(&["a".to_string()]).unwrap();
        assert!(shard.matches(&id_with_prefix('a')));
        assert!(!shard.matches(&id_with_prefix('b')));
    }

    #[test]
    fn test_range_shard_expands() {
        let shard = ShardPredicate::parse(&["0-7".to_string()]).unwrap();
        assert!(shard.matches(&id_with_prefix('0')));
        assert!(shard.matches(&id_with_prefix('7')));
        assert!(!shard.matches(&id_with_prefix('8')));
        assert!(!shard.matches(&id_with_prefix('f')));
    }

    #[test]
    fn test_complementary_shards_partition() {
        let lo = ShardPredicate::parse(&["0-7".to_string()]).unwrap();
        let hi = ShardPredicate::parse(&["8-f".to_string()]).unwrap();
        for ch in "0123456789abcdef".chars() {
            let id = id_with_prefix(ch);
            assert_ne!(lo.matches(&id), hi.matches(&id));
        }
    }

    #[test]
    fn test_bad_range_rejected() {
        assert!(ShardPredicate::parse(&["f-a".to_string()]).is_err());
    }
}
