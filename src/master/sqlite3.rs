//! sqlite3 master adapter, via `rusqlite`. Used directly by the
//! integration tests since it needs no external server. Lacking a
//! native sequence type, `commit_id` allocation uses a single-row
//! counter table incremented inside the same transaction as the
//! update, matching `otama_dbi_sqlite3.c`'s approach.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::id::Id;

use super::{FlagUpdate, MasterRow, MasterStore, ShardPredicate};

pub struct Sqlite3Master {
    conn: Mutex<Connection>,
    table: String,
}

impl Sqlite3Master {
    pub fn open_in_memory(table: &str) -> Result<Sqlite3Master> {
        let conn = Connection::open_in_memory()?;
        Ok(Sqlite3Master {
            conn: Mutex::new(conn),
            table: table.to_string(),
        })
    }

    pub fn open_file(path: &std::path::Path, table: &str) -> Result<Sqlite3Master> {
        let conn = Connection::open(path)?;
        Ok(Sqlite3Master {
            conn: Mutex::new(conn),
            table: table.to_string(),
        })
    }
}

impl MasterStore for Sqlite3Master {
    fn create_database(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                otama_id CHAR(40) UNIQUE NOT NULL,
                vector TEXT NOT NULL,
                flag INTEGER NOT NULL DEFAULT 0,
                commit_id INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS {t}_otama_id ON {t}(otama_id);
            CREATE INDEX IF NOT EXISTS {t}_otama_id_flag ON {t}(otama_id, flag);
            CREATE INDEX IF NOT EXISTS {t}_commit_id ON {t}(commit_id);
            CREATE TABLE IF NOT EXISTS {t}_sequence_ (value INTEGER NOT NULL);
            INSERT INTO {t}_sequence_ (value)
                SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM {t}_sequence_);",
            t = self.table
        ))?;
        Ok(())
    }

    fn drop_database(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {t}; DROP TABLE IF EXISTS {t}_sequence_;",
            t = self.table
        ))?;
        Ok(())
    }

    fn count(&self, shard: &ShardPredicate) -> Result<i64> {
        let conn = self.conn.lock();
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", self.table, shard.to_sql_fragment());
        Ok(conn.query_row(&sql, [], |row| row.get(0))?)
    }

    fn max_id_and_commit(&self, shard: &ShardPredicate) -> Result<(i64, i64)> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT COALESCE(MAX(id), 0), COALESCE(MAX(commit_id), 0) FROM {} WHERE {}",
            self.table,
            shard.to_sql_fragment()
        );
        Ok(conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?)
    }

    fn fetch_new_rows(
        &self,
        last_no: i64,
        max_id: i64,
        shard: &ShardPredicate,
        limit: i64,
    ) -> Result<Vec<MasterRow>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, otama_id, vector FROM {} WHERE id > ?1 AND id <= ?2 AND ({}) ORDER BY id LIMIT ?3",
            self.table,
            shard.to_sql_fragment()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![last_no, max_id, limit], |row| {
                let id: i64 = row.get(0)?;
                let otama_id: String = row.get(1)?;
                let vector: String = row.get(2)?;
                Ok((id, otama_id, vector))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(rows.len());
        for (id, otama_id, vector) in rows {
            let otama_id = Id::from_hex(&otama_id)?;
            out.push(MasterRow { id, otama_id, vector });
        }
        Ok(out)
    }

    fn fetch_flag_updates(
        &self,
        last_commit_no: i64,
        max_commit: i64,
        shard: &ShardPredicate,
    ) -> Result<Vec<FlagUpdate>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, flag, commit_id FROM {} WHERE commit_id > ?1 AND commit_id <= ?2 AND ({}) ORDER BY commit_id",
            self.table,
            shard.to_sql_fragment()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![last_commit_no, max_commit], |row| {
                Ok(FlagUpdate {
                    id: row.get(0)?,
                    flag: row.get::<_, i64>(1)? as u8,
                    commit_id: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn exists(&self, otama_id: &Id) -> Result<bool> {
        let conn = self.conn.lock();
        let sql = format!("SELECT 1 FROM {} WHERE otama_id = ?1", self.table);
        let found: Option<i64> = conn
            .query_row(&sql, params![otama_id.to_hex()], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn insert_if_absent(&self, otama_id: &Id, vector: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO {} (otama_id, vector, flag, commit_id)
                 SELECT ?1, ?2, 0, 0
                 WHERE NOT EXISTS (SELECT 1 FROM {} WHERE otama_id = ?1)",
                self.table, self.table
            ),
            params![otama_id.to_hex(), vector],
        )?;
        let id: i64 = tx.query_row(
            &format!("SELECT id FROM {} WHERE otama_id = ?1", self.table),
            params![otama_id.to_hex()],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(id)
    }

    fn update_flag(&self, otama_id: &Id, flag: u8) -> Result<i64> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            &format!("UPDATE {}_sequence_ SET value = value + 1", self.table),
            [],
        )?;
        let commit_id: i64 = tx.query_row(
            &format!("SELECT value FROM {}_sequence_", self.table),
            [],
            |row| row.get(0),
        )?;
        let changed = tx.execute(
            &format!(
                "UPDATE {} SET flag = ?1, commit_id = ?2 WHERE otama_id = ?3",
                self.table
            ),
            params![flag as i64, commit_id, otama_id.to_hex()],
        )?;
        if changed == 0 {
            return Err(err_at!(NoData, "otama_id {} not found in master", otama_id));
        }
        tx.commit()?;
        Ok(commit_id)
    }
}

#[cfg(test)]
mod sqlite3_test {
    use super::*;

    #[test]
    fn test_create_insert_exists_and_fetch() {
        let master = Sqlite3Master::open_in_memory("img").unwrap();
        master.create_database().unwrap();
        let id = Id::of_data(b"one");
        master.insert_if_absent(&id, "feature-text").unwrap();
        assert!(master.exists(&id).unwrap());

        let shard = ShardPredicate::default();
        let (max_id, _max_commit) = master.max_id_and_commit(&shard).unwrap();
        let rows = master.fetch_new_rows(0, max_id, &shard, 100).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].otama_id, id);
        assert_eq!(rows[0].vector, "feature-text");
    }

    #[test]
    fn test_insert_if_absent_is_idempotent() {
        let master = Sqlite3Master::open_in_memory("img").unwrap();
        master.create_database().unwrap();
        let id = Id::of_data(b"dup");
        let a = master.insert_if_absent(&id, "v1").unwrap();
        let b = master.insert_if_absent(&id, "v2").unwrap();
        assert_eq!(a, b);
        assert_eq!(master.count(&ShardPredicate::default()).unwrap(), 1);
    }

    #[test]
    fn test_update_flag_allocates_commit_id() {
        let master = Sqlite3Master::open_in_memory("img").unwrap();
        master.create_database().unwrap();
        let id = Id::of_data(b"removable");
        master.insert_if_absent(&id, "v").unwrap();
        let c1 = master.update_flag(&id, 1).unwrap();
        let c2 = master.update_flag(&id, 0).unwrap();
        assert!(c2 > c1);
    }

    #[test]
    fn test_shard_restricts_fetch() {
        let master = Sqlite3Master::open_in_memory("img").unwrap();
        master.create_database().unwrap();
        let lo_hex = format!("0{}", "0".repeat(39));
        let hi_hex = format!("f{}", "0".repeat(39));
        let lo_id = Id::from_hex(&lo_hex).unwrap();
        let hi_id = Id::from_hex(&hi_hex).unwrap();
        master.insert_if_absent(&lo_id, "lo").unwrap();
        master.insert_if_absent(&hi_id, "hi").unwrap();

        let shard = ShardPredicate::parse(&["0-7".to_string()]).unwrap();
        assert_eq!(master.count(&shard).unwrap(), 1);
    }
}
