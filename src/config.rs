//! YAML-backed configuration, loaded both into a typed [`Config`] tree
//! (via `serde`/`serde_yaml`, used the same way `robt::Config`/
//! `wral::Config` load their builder structs) and, for family-specific
//! pass-through settings,
//! into the [`crate::variant::Variant`] tree consumed by
//! `Family::construct`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::master::ShardPredicate;
use crate::variant::{Arena, Variant};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    pub data_dir: Option<PathBuf>,
    pub shard: Option<OneOrMany>,
    #[serde(default)]
    pub load_fv: bool,
    #[serde(default)]
    pub sync_before_search: bool,
    pub color_weight: Option<f32>,
    pub color_method: Option<String>,
    pub color_threshold: Option<f32>,
    pub rerank_method: Option<String>,
    #[serde(default)]
    pub strip: bool,
    pub metric: Option<OneOrMany>,
    pub vq: Option<PathBuf>,
    pub hit_threshold: Option<usize>,
    #[serde(default)]
    pub preheat_cache: bool,
    #[serde(default)]
    pub keep_alive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseDialect {
    Pgsql,
    Mysql,
    Sqlite3,
}

impl DatabaseDialect {
    fn parse(s: &str) -> Result<DatabaseDialect> {
        match s {
            "pgsql" => Ok(DatabaseDialect::Pgsql),
            "mysql" => Ok(DatabaseDialect::Mysql),
            "sqlite3" => Ok(DatabaseDialect::Sqlite3),
            other => Err(err_at!(InvalidArguments, "unknown database.driver {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub driver: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl DatabaseConfig {
    pub fn dialect(&self) -> Result<DatabaseDialect> {
        DatabaseDialect::parse(&self.driver)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub namespace: String,
    pub driver: DriverConfig,
    pub database: Option<DatabaseConfig>,
    pub log: Option<PathBuf>,
}

impl Config {
    pub fn from_yaml_str(s: &str) -> Result<Config> {
        serde_yaml::from_str(s).map_err(Error::from)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|err| err_at!(SystemError, "reading config {:?}: {}", path.as_ref(), err))?;
        Config::from_yaml_str(&text)
    }

    /// Table name = `namespace_family`, or just the family name if
    /// `namespace` is empty.
    pub fn table_name(&self) -> String {
        if self.namespace.is_empty() {
            self.driver.name.clone()
        } else {
            format!("{}_{}", self.namespace, self.driver.name)
        }
    }

    pub fn shard_predicate(&self) -> Result<ShardPredicate> {
        let entries = self
            .driver
            .shard
            .clone()
            .map(OneOrMany::into_vec)
            .unwrap_or_default();
        ShardPredicate::parse(&entries)
    }

    /// Materialize the family-relevant knobs into a [`Variant`] hash so
    /// `Family::construct` sees the same pass-through shape the
    /// original `otama_variant`-backed config tree offered.
    pub fn driver_variant(&self, arena: &Arena) -> Variant {
        let hash = arena.hash();
        if let Some(cw) = self.driver.color_weight {
            hash.hash_set("color_weight", arena.float(cw));
        }
        if let Some(ct) = self.driver.color_threshold {
            hash.hash_set("color_threshold", arena.float(ct));
        }
        if let Some(method) = &self.driver.color_method {
            hash.hash_set("color_method", arena.string(method.clone()));
        }
        if let Some(rerank) = &self.driver.rerank_method {
            hash.hash_set("rerank_method", arena.string(rerank.clone()));
        }
        if let Some(ht) = self.driver.hit_threshold {
            hash.hash_set("hit_threshold", arena.int(ht as i64));
        }
        hash.hash_set("strip", arena.int(self.driver.strip as i64));
        hash
    }
}

#[cfg(test)]
mod config_test {
    use super::*;

    #[test]
    fn test_parse_minimal_yaml() {
        let yaml = "driver:\n  name: vlad128\n  data_dir: /tmp/otama\n";
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.driver.name, "vlad128");
        assert_eq!(config.namespace, "");
        assert_eq!(config.table_name(), "vlad128");
    }

    #[test]
    fn test_namespace_prefixes_table_name() {
        let yaml = "namespace: prod\ndriver:\n  name: bovw8k\n";
        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.table_name(), "prod_bovw8k");
    }

    #[test]
    fn test_shard_accepts_single_string_or_array() {
        let yaml1 = "driver:\n  name: bovw8k\n  shard: \"a-f\"\n";
        let c1 = Config::from_yaml_str(yaml1).unwrap();
        assert_eq!(c1.shard_predicate().unwrap().to_sql_fragment().contains("a%"), true);

        let yaml2 = "driver:\n  name: bovw8k\n  shard: [\"0\", \"1\"]\n";
        let c2 = Config::from_yaml_str(yaml2).unwrap();
        let frag = c2.shard_predicate().unwrap().to_sql_fragment();
        assert!(frag.contains("0%") && frag.contains("1%"));
    }

    #[test]
    fn test_database_dialect_parses() {
        let yaml = "driver:\n  name: bovw8k\ndatabase:\n  driver: sqlite3\n  name: /tmp/x.db\n";
        let config = Config::from_yaml_str(yaml).unwrap();
        let db = config.database.unwrap();
        assert_eq!(db.dialect().unwrap(), DatabaseDialect::Sqlite3);
    }

    #[test]
    fn test_unknown_dialect_rejected() {
        let yaml = "driver:\n  name: bovw8k\ndatabase:\n  driver: oracle\n  name: x\n";
        let config = Config::from_yaml_str(yaml).unwrap();
        assert!(config.database.unwrap().dialect().is_err());
    }
}
