//! PostgreSQL master adapter, via the synchronous `postgres` crate.
//! Uses a real `SEQUENCE` for `commit_id` allocation (`nextval`),
//! matching `otama_dbi_pgsql.c`.

use parking_lot::Mutex;
use postgres::{Client, NoTls};

use crate::error::Result;
use crate::id::Id;

use super::{FlagUpdate, MasterRow, MasterStore, ShardPredicate};

pub struct PgMaster {
    client: Mutex<Client>,
    table: String,
}

impl PgMaster {
    pub fn connect(conninfo: &str, table: &str) -> Result<PgMaster> {
        let client = Client::connect(conninfo, NoTls)?;
        Ok(PgMaster {
            client: Mutex::new(client),
            table: table.to_string(),
        })
    }
}

impl MasterStore for PgMaster {
    fn create_database(&self) -> Result<()> {
        let mut client = self.client.lock();
        client.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                id BIGSERIAL PRIMARY KEY,
                otama_id CHAR(40) UNIQUE NOT NULL,
                vector TEXT NOT NULL,
                flag INTEGER NOT NULL DEFAULT 0,
                commit_id BIGINT NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS {t}_otama_id ON {t}(otama_id);
            CREATE INDEX IF NOT EXISTS {t}_otama_id_flag ON {t}(otama_id, flag);
            CREATE INDEX IF NOT EXISTS {t}_commit_id ON {t}(commit_id);
            CREATE SEQUENCE IF NOT EXISTS {t}_sequence_;",
            t = self.table
        ))?;
        Ok(())
    }

    fn drop_database(&self) -> Result<()> {
        let mut client = self.client.lock();
        client.batch_execute(&format!(
            "DROP TABLE IF EXISTS {t}; DROP SEQUENCE IF EXISTS {t}_sequence_;",
            t = self.table
        ))?;
        Ok(())
    }

    fn count(&self, shard: &ShardPredicate) -> Result<i64> {
        let mut client = self.client.lock();
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", self.table, shard.to_sql_fragment());
        let row = client.query_one(sql.as_str(), &[])?;
        Ok(row.get(0))
    }

    fn max_id_and_commit(&self, shard: &ShardPredicate) -> Result<(i64, i64)> {
        let mut client = self.client.lock();
        let sql = format!(
            "SELECT COALESCE(MAX(id), 0), COALESCE(MAX(commit_id), 0) FROM {} WHERE {}",
            self.table,
            shard.to_sql_fragment()
        );
        let row = client.query_one(sql.as_str(), &[])?;
        Ok((row.get(0), row.get(1)))
    }

    fn fetch_new_rows(
        &self,
        last_no: i64,
        max_id: i64,
        shard: &ShardPredicate,
        limit: i64,
    ) -> Result<Vec<MasterRow>> {
        let mut client = self.client.lock();
        let sql = format!(
            "SELECT id, otama_id, vector FROM {} WHERE id > $1 AND id <= $2 AND ({}) ORDER BY id LIMIT $3",
            self.table,
            shard.to_sql_fragment()
        );
        let mut out = Vec::new();
        for row in client.query(sql.as_str(), &[&last_no, &max_id, &limit])? {
            let id: i64 = row.get(0);
            let otama_id: String = row.get(1);
            let vector: String = row.get(2);
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
        let mut client = self.client.lock();
        let sql = format!(
            "SELECT id, flag, commit_id FROM {} WHERE commit_id > $1 AND commit_id <= $2 AND ({}) ORDER BY commit_id",
            self.table,
            shard.to_sql_fragment()
        );
        let mut out = Vec::new();
        for row in client.query(sql.as_str(), &[&last_commit_no, &max_commit])? {
            let flag: i32 = row.get(1);
            out.push(FlagUpdate {
                id: row.get(0),
                flag: flag as u8,
                commit_id: row.get(2),
            });
        }
        Ok(out)
    }

    fn exists(&self, otama_id: &Id) -> Result<bool> {
        let mut client = self.client.lock();
        let sql = format!("SELECT 1 FROM {} WHERE otama_id = $1", self.table);
        let rows = client.query(sql.as_str(), &[&otama_id.to_hex()])?;
        Ok(!rows.is_empty())
    }

    fn insert_if_absent(&self, otama_id: &Id, vector: &str) -> Result<i64> {
        let mut client = self.client.lock();
        let mut tx = client.transaction()?;
        tx.execute(
            format!(
                "INSERT INTO {} (otama_id, vector, flag, commit_id)
                 SELECT $1, $2, 0, 0
                 WHERE NOT EXISTS (SELECT 1 FROM {} WHERE otama_id = $1)",
                self.table, self.table
            )
            .as_str(),
            &[&otama_id.to_hex(), &vector],
        )?;
        let row = tx.query_one(
            format!("SELECT id FROM {} WHERE otama_id = $1", self.table).as_str(),
            &[&otama_id.to_hex()],
        )?;
        let id: i64 = row.get(0);
        tx.commit()?;
        Ok(id)
    }

    fn update_flag(&self, otama_id: &Id, flag: u8) -> Result<i64> {
        let mut client = self.client.lock();
        let mut tx = client.transaction()?;
        let row = tx.query_one(format!("SELECT nextval('{}_sequence_')", self.table).as_str(), &[])?;
        let commit_id: i64 = row.get(0);
        let changed = tx.execute(
            format!("UPDATE {} SET flag = $1, commit_id = $2 WHERE otama_id = $3", self.table).as_str(),
            &[&(flag as i32), &commit_id, &otama_id.to_hex()],
        )?;
        if changed == 0 {
            return Err(err_at!(NoData, "otama_id {} not found in master", otama_id));
        }
        tx.commit()?;
        Ok(commit_id)
    }
}
