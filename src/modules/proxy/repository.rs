//! Persistence backends for proxy health and group assignment.

use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use super::Proxy;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("proxy store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("proxy store is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("proxy database error: {0}")]
    Storage(#[from] redb::Error),
}

fn storage<E: Into<redb::Error>>(err: E) -> RepositoryError {
    RepositoryError::Storage(err.into())
}

/// Loads and stores the full proxy list.
pub trait ProxyRepository: Send + Sync + fmt::Debug {
    fn load(&self) -> Result<Vec<Proxy>, RepositoryError>;
    fn save(&self, proxies: &[Proxy]) -> Result<(), RepositoryError>;
}

/// On-disk JSON layout: `{"proxies": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyDocument {
    #[serde(default)]
    pub proxies: Vec<Proxy>,
}

/// JSON file store. A missing file reads as an empty pool; writes go through a
/// temporary file and a rename.
#[derive(Debug, Clone)]
pub struct JsonFileProxyRepository {
    path: PathBuf,
}

impl JsonFileProxyRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProxyRepository for JsonFileProxyRepository {
    fn load(&self) -> Result<Vec<Proxy>, RepositoryError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("proxy file {} not found, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };
        let document: ProxyDocument = serde_json::from_str(&raw)?;
        Ok(document.proxies)
    }

    fn save(&self, proxies: &[Proxy]) -> Result<(), RepositoryError> {
        let document = ProxyDocument {
            proxies: proxies.to_vec(),
        };
        let body = serde_json::to_string_pretty(&document)?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

const PROXY_TABLE: TableDefinition<&str, &str> = TableDefinition::new("proxies");

/// Embedded redb store keyed by proxy id, values are JSON records.
pub struct RedbProxyRepository {
    db: Database,
    path: PathBuf,
}

impl fmt::Debug for RedbProxyRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbProxyRepository")
            .field("path", &self.path)
            .finish()
    }
}

impl RedbProxyRepository {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let path = path.into();
        let db = Database::create(&path).map_err(storage)?;
        Ok(Self { db, path })
    }
}

impl ProxyRepository for RedbProxyRepository {
    fn load(&self) -> Result<Vec<Proxy>, RepositoryError> {
        let txn = self.db.begin_read().map_err(storage)?;
        let table = match txn.open_table(PROXY_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(storage(err)),
        };

        let mut proxies = Vec::new();
        for entry in table.iter().map_err(storage)? {
            let (_, value) = entry.map_err(storage)?;
            proxies.push(serde_json::from_str(value.value())?);
        }
        Ok(proxies)
    }

    fn save(&self, proxies: &[Proxy]) -> Result<(), RepositoryError> {
        let txn = self.db.begin_write().map_err(storage)?;
        txn.delete_table(PROXY_TABLE).map_err(storage)?;
        {
            let mut table = txn.open_table(PROXY_TABLE).map_err(storage)?;
            for proxy in proxies {
                let record = serde_json::to_string(proxy)?;
                table
                    .insert(proxy.id().as_str(), record.as_str())
                    .map_err(storage)?;
            }
        }
        txn.commit().map_err(storage)?;
        Ok(())
    }
}

/// Volatile store, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryProxyRepository {
    proxies: Mutex<Vec<Proxy>>,
}

impl MemoryProxyRepository {
    pub fn new(proxies: Vec<Proxy>) -> Self {
        Self {
            proxies: Mutex::new(proxies),
        }
    }

    pub fn stored(&self) -> Vec<Proxy> {
        self.proxies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ProxyRepository for MemoryProxyRepository {
    fn load(&self) -> Result<Vec<Proxy>, RepositoryError> {
        Ok(self.stored())
    }

    fn save(&self, proxies: &[Proxy]) -> Result<(), RepositoryError> {
        *self
            .proxies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = proxies.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::clock::ManualClock;
    use crate::modules::proxy::{FailureKind, PoolAllocation, ProxyPool, ProxyPoolConfig};
    use std::sync::Arc;

    fn sample() -> Vec<Proxy> {
        vec![
            Proxy::new("10.0.0.1", 8080).with_pool("search"),
            Proxy::new("10.0.0.2", 8080).with_credentials("u", "p"),
        ]
    }

    #[test]
    fn json_file_missing_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileProxyRepository::new(dir.path().join("absent.json"));
        assert!(repo.load().unwrap().is_empty());
    }

    #[test]
    fn json_file_persists_proxies() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileProxyRepository::new(dir.path().join("state/proxies.json"));
        repo.save(&sample()).unwrap();

        let loaded = repo.load().unwrap();
        assert_eq!(loaded, sample());
        let raw = fs::read_to_string(repo.path()).unwrap();
        assert!(raw.contains("\"proxies\""));
    }

    #[test]
    fn redb_persists_proxies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.redb");
        {
            let repo = RedbProxyRepository::open(&path).unwrap();
            assert!(repo.load().unwrap().is_empty());
            repo.save(&sample()).unwrap();
            repo.save(&sample()[..1]).unwrap();
        }
        let repo = RedbProxyRepository::open(&path).unwrap();
        let loaded = repo.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].assigned_pool.as_deref(), Some("search"));
    }

    #[test]
    fn pool_assignment_survives_reload() {
        let repo = Arc::new(MemoryProxyRepository::new(vec![
            Proxy::new("10.0.0.1", 8080),
            Proxy::new("10.0.0.2", 8080),
        ]));
        let config = ProxyPoolConfig {
            groups: vec![
                PoolAllocation {
                    name: "search".into(),
                    size: 1,
                },
                PoolAllocation {
                    name: "directories".into(),
                    size: 1,
                },
            ],
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new());

        let first = ProxyPool::with_repository(config.clone(), clock.clone(), repo.clone()).unwrap();
        first.report_failure("10.0.0.2:8080", FailureKind::Timeout);
        let assigned: Vec<_> = first.proxies().into_iter().map(|p| p.assigned_pool).collect();

        let second = ProxyPool::with_repository(config, clock, repo.clone()).unwrap();
        let reloaded: Vec<_> = second.proxies().into_iter().map(|p| p.assigned_pool).collect();
        assert_eq!(assigned, reloaded);
        assert_eq!(repo.stored()[1].failure_count, 1);
    }
}
