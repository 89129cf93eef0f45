//! Keyed record store: the contract plus in-memory and JSON-file backends.
//!
//! Items are stored as JSON values under a partition key and an optional
//! sort key. Typed access lives in [`crate::records`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use autoeval_types::{AutoevalError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Documents,
    Runs,
    Suites,
    Results,
}

impl Table {
    pub const ALL: [Table; 4] = [Table::Documents, Table::Runs, Table::Suites, Table::Results];

    pub fn name(self) -> &'static str {
        match self {
            Table::Documents => "documents",
            Table::Runs => "runs",
            Table::Suites => "suites",
            Table::Results => "results",
        }
    }
}

/// Partition key plus sort key. An empty `sk` means the table has no sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey {
    pub pk: String,
    #[serde(default)]
    pub sk: String,
}

impl StoreKey {
    pub fn new(pk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: String::new(),
        }
    }

    pub fn with_sort(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordStore trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, table: Table, key: &StoreKey) -> Result<Option<serde_json::Value>>;

    /// Items in partition `pk`, optionally restricted to sort keys starting
    /// with `sk_prefix`, ordered by sort key.
    async fn query(
        &self,
        table: Table,
        pk: &str,
        sk_prefix: Option<&str>,
    ) -> Result<Vec<serde_json::Value>>;

    async fn put(&self, table: Table, key: StoreKey, item: serde_json::Value) -> Result<()>;

    async fn scan(&self, table: Table) -> Result<Vec<serde_json::Value>>;
}

type Rows = BTreeMap<StoreKey, serde_json::Value>;
type Tables = BTreeMap<Table, Rows>;

fn query_rows(rows: Option<&Rows>, pk: &str, sk_prefix: Option<&str>) -> Vec<serde_json::Value> {
    let Some(rows) = rows else {
        return Vec::new();
    };
    rows.iter()
        .filter(|(key, _)| key.pk == pk && sk_prefix.map_or(true, |p| key.sk.starts_with(p)))
        .map(|(_, item)| item.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Ordered in-process store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, table: Table, key: &StoreKey) -> Result<Option<serde_json::Value>> {
        let tables = self.tables.read().await;
        Ok(tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn query(
        &self,
        table: Table,
        pk: &str,
        sk_prefix: Option<&str>,
    ) -> Result<Vec<serde_json::Value>> {
        let tables = self.tables.read().await;
        Ok(query_rows(tables.get(&table), pk, sk_prefix))
    }

    async fn put(&self, table: Table, key: StoreKey, item: serde_json::Value) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.entry(table).or_default().insert(key, item);
        Ok(())
    }

    async fn scan(&self, table: Table) -> Result<Vec<serde_json::Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// JsonFileStore
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct StoredRow {
    #[serde(flatten)]
    key: StoreKey,
    item: serde_json::Value,
}

/// Durable store keeping one `<table>.json` file per table under a directory.
///
/// All tables are read at open; every put rewrites the affected table file.
pub struct JsonFileStore {
    dir: PathBuf,
    tables: Mutex<Tables>,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        let mut tables = Tables::new();
        for table in Table::ALL {
            let path = table_path(&dir, table);
            if !tokio::fs::try_exists(&path).await? {
                continue;
            }
            let json = tokio::fs::read_to_string(&path).await?;
            let rows: Vec<StoredRow> = serde_json::from_str(&json).map_err(|e| {
                AutoevalError::store("open", format!("{}: {}", path.display(), e))
            })?;
            tables.insert(table, rows.into_iter().map(|r| (r.key, r.item)).collect());
        }
        tracing::debug!(dir = %dir.display(), "Record store opened");
        Ok(Self {
            dir,
            tables: Mutex::new(tables),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn flush(&self, table: Table, rows: &Rows) -> Result<()> {
        let stored: Vec<StoredRow> = rows
            .iter()
            .map(|(key, item)| StoredRow {
                key: key.clone(),
                item: item.clone(),
            })
            .collect();
        let json = serde_json::to_string_pretty(&stored)?;
        let path = table_path(&self.dir, table);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| AutoevalError::store("put", format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AutoevalError::store("put", format!("{}: {}", path.display(), e)))?;
        Ok(())
    }
}

fn table_path(dir: &Path, table: Table) -> PathBuf {
    dir.join(format!("{}.json", table.name()))
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn get(&self, table: Table, key: &StoreKey) -> Result<Option<serde_json::Value>> {
        let tables = self.tables.lock().await;
        Ok(tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    async fn query(
        &self,
        table: Table,
        pk: &str,
        sk_prefix: Option<&str>,
    ) -> Result<Vec<serde_json::Value>> {
        let tables = self.tables.lock().await;
        Ok(query_rows(tables.get(&table), pk, sk_prefix))
    }

    async fn put(&self, table: Table, key: StoreKey, item: serde_json::Value) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(table).or_default();
        let previous = rows.insert(key.clone(), item);
        if let Err(e) = self.flush(table, rows).await {
            // keep memory in step with what is on disk
            match previous {
                Some(old) => rows.insert(key, old),
                None => rows.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn scan(&self, table: Table) -> Result<Vec<serde_json::Value>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }
}
