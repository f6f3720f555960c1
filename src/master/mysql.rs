//! MySQL master adapter, via the `mysql` crate. Lacking PostgreSQL-style
//! sequences, `commit_id` allocation goes through an `AUTO_INCREMENT`
//! counter table and `LAST_INSERT_ID()`, matching
//! `otama_dbi_mysql.c`'s approach; row insertion uses `INSERT IGNORE`
//! instead of the `WHERE NOT EXISTS` idiom the other two dialects use.

use mysql::prelude::*;
use mysql::{Opts, Pool, PooledConn};
use parking_lot::Mutex;

use crate::error::Result;
use crate::id::Id;

use super::{FlagUpdate, MasterRow, MasterStore, ShardPredicate};

pub struct MysqlMaster {
    conn: Mutex<PooledConn>,
    table: String,
}

impl MysqlMaster {
    pub fn connect(url: &str, table: &str) -> Result<MysqlMaster> {
        let opts = Opts::from_url(url).map_err(|err| {
            err_at!(InvalidArguments, "bad mysql url {:?}: {}", url, err)
        })?;
        let pool = Pool::new(opts)?;
        let conn = pool.get_conn()?;
        Ok(MysqlMaster {
            conn: Mutex::new(conn),
            table: table.to_string(),
        })
    }
}

impl MasterStore for MysqlMaster {
    fn create_database(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.query_drop(format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                otama_id CHAR(40) UNIQUE NOT NULL,
                vector TEXT NOT NULL,
                flag INT NOT NULL DEFAULT 0,
                commit_id BIGINT NOT NULL DEFAULT 0,
                INDEX {t}_otama_id_idx (otama_id),
                INDEX {t}_otama_id_flag_idx (otama_id, flag),
                INDEX {t}_commit_id_idx (commit_id)
            )",
            t = self.table
        ))?;
        conn.query_drop(format!(
            "CREATE TABLE IF NOT EXISTS {t}_sequence_ (seq BIGINT AUTO_INCREMENT PRIMARY KEY)",
            t = self.table
        ))?;
        Ok(())
    }

    fn drop_database(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.query_drop(format!("DROP TABLE IF EXISTS {}", self.table))?;
        conn.query_drop(format!("DROP TABLE IF EXISTS {}_sequence_", self.table))?;
        Ok(())
    }

    fn count(&self, shard: &ShardPredicate) -> Result<i64> {
        let mut conn = self.conn.lock();
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", self.table, shard.to_sql_fragment());
        Ok(conn.query_first(sql)?.unwrap_or(0))
    }

    fn max_id_and_commit(&self, shard: &ShardPredicate) -> Result<(i64, i64)> {
        let mut conn = self.conn.lock();
        let sql = format!(
            "SELECT COALESCE(MAX(id), 0), COALESCE(MAX(commit_id), 0) FROM {} WHERE {}",
            self.table,
            shard.to_sql_fragment()
        );
        Ok(conn.query_first(sql)?.unwrap_or((0, 0)))
    }

    fn fetch_new_rows(
        &self,
        last_no: i64,
        max_id: i64,
        shard: &ShardPredicate,
        limit: i64,
    ) -> Result<Vec<MasterRow>> {
        let mut conn = self.conn.lock();
        let sql = format!(
            "SELECT id, otama_id, vector FROM {} WHERE id > :last_no AND id <= :max_id AND ({}) ORDER BY id LIMIT :limit",
            self.table,
            shard.to_sql_fragment()
        );
        let rows: Vec<(i64, String, String)> = conn.exec(
            sql,
            mysql::params! { "last_no" => last_no, "max_id" => max_id, "limit" => limit },
        )?;
        let mut out = Vec::with_capacity(rows.len());
        for (id, otama_id, vector) in rows {
            out.push(MasterRow {
                id,
                otama_id: Id::from_hex(&otama_id)?,
                vector,
            });
        }
        Ok(out)
    }

    fn fetch_flag_updates(
        &self,
        last_commit_no: i64,
        max_commit: i64,
        shard: &ShardPredicate,
    ) -> Result<Vec<FlagUpdate>> {
        let mut conn = self.conn.lock();
        let sql = format!(
            "SELECT id, flag, commit_id FROM {} WHERE commit_id > :last_commit_no AND commit_id <= :max_commit AND ({}) ORDER BY commit_id",
            self.table,
            shard.to_sql_fragment()
        );
        let rows: Vec<(i64, i64, i64)> = conn.exec(
            sql,
            mysql::params! { "last_commit_no" => last_commit_no, "max_commit" => max_commit },
        )?;
        Ok(rows
            .into_iter()
            .map(|(id, flag, commit_id)| FlagUpdate {
                id,
                flag: flag as u8,
                commit_id,
            })
            .collect())
    }

    fn exists(&self, otama_id: &Id) -> Result<bool> {
        let mut conn = self.conn.lock();
        let sql = format!("SELECT 1 FROM {} WHERE otama_id = :otama_id", self.table);
        let found: Option<i64> =
            conn.exec_first(sql, mysql::params! { "otama_id" => otama_id.to_hex() })?;
        Ok(found.is_some())
    }

    fn insert_if_absent(&self, otama_id: &Id, vector: &str) -> Result<i64> {
        let mut conn = self.conn.lock();
        conn.exec_drop(
            format!(
                "INSERT IGNORE INTO {} (otama_id, vector, flag, commit_id) VALUES (:otama_id, :vector, 0, 0)",
                self.table
            ),
            mysql::params! { "otama_id" => otama_id.to_hex(), "vector" => vector },
        )?;
        let id: i64 = conn
            .exec_first(
                format!("SELECT id FROM {} WHERE otama_id = :otama_id", self.table),
                mysql::params! { "otama_id" => otama_id.to_hex() },
            )?
            .ok_or_else(|| err_at!(AssertionFailure, "row missing immediately after insert"))?;
        Ok(id)
    }

    fn update_flag(&self, otama_id: &Id, flag: u8) -> Result<i64> {
        let mut conn = self.conn.lock();
        conn.query_drop(format!("INSERT INTO {}_sequence_ () VALUES ()", self.table))?;
        let commit_id: i64 = conn
            .query_first("SELECT LAST_INSERT_ID()")?
            .ok_or_else(|| err_at!(SystemError, "LAST_INSERT_ID() returned no row"))?;
        let changed = conn.exec_iter(
            format!(
                "UPDATE {} SET flag = :flag, commit_id = :commit_id WHERE otama_id = :otama_id",
                self.table
            ),
            mysql::params! { "flag" => flag as i64, "commit_id" => commit_id, "otama_id" => otama_id.to_hex() },
        )?
        .affected_rows();
        if changed == 0 {
            return Err(err_at!(NoData, "otama_id {} not found in master", otama_id));
        }
        Ok(commit_id)
    }
}
