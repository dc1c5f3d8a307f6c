use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::Result;
use crate::store::{InMemoryJobStore, JobStore, SqliteJobStore};

/// Settings for the SQLite backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    /// Database file. `None` opens a private in-memory database that lives
    /// as long as the store.
    pub path: Option<PathBuf>,
    /// Pool size for file databases. In-memory databases always use a single
    /// connection.
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 5,
            busy_timeout_ms: 5_000,
        }
    }
}

impl SqliteConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_busy_timeout_ms(mut self, busy_timeout_ms: u64) -> Self {
        self.busy_timeout_ms = busy_timeout_ms;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StoreBackend {
    #[default]
    InMemory,
    Sqlite(SqliteConfig),
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::InMemory => write!(f, "memory"),
            StoreBackend::Sqlite(cfg) => match &cfg.path {
                Some(path) => write!(f, "sqlite:{}", path.display()),
                None => write!(f, "sqlite::memory:"),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            backend: StoreBackend::InMemory,
        }
    }

    pub fn sqlite(config: SqliteConfig) -> Self {
        Self {
            backend: StoreBackend::Sqlite(config),
        }
    }
}

/// Settings for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }
}

/// Builds the backend named by `config`.
pub async fn open_store(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn JobStore>> {
    tracing::info!(backend = %config.backend, "Opening job store");
    match &config.backend {
        StoreBackend::InMemory => Ok(Arc::new(InMemoryJobStore::with_clock(clock))),
        StoreBackend::Sqlite(sqlite) => Ok(Arc::new(SqliteJobStore::connect(sqlite, clock).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::models::{Job, JobSpec};

    #[test]
    fn sqlite_config_default() {
        let cfg = SqliteConfig::default();
        assert!(cfg.path.is_none());
        assert_eq!(cfg.max_connections, 5);
        assert_eq!(cfg.busy_timeout_ms, 5_000);
    }

    #[test]
    fn sqlite_config_builders() {
        let cfg = SqliteConfig::file("/tmp/jobs.db")
            .with_max_connections(2)
            .with_busy_timeout_ms(100);
        assert_eq!(cfg.path, Some(PathBuf::from("/tmp/jobs.db")));
        assert_eq!(cfg.max_connections, 2);
        assert_eq!(cfg.busy_timeout_ms, 100);
    }

    #[test]
    fn store_config_defaults_to_memory() {
        assert_eq!(StoreConfig::default().backend, StoreBackend::InMemory);
        assert_eq!(StoreBackend::InMemory.to_string(), "memory");
        assert_eq!(
            StoreBackend::Sqlite(SqliteConfig::in_memory()).to_string(),
            "sqlite::memory:"
        );
    }

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(cfg.store, StoreConfig::default());
    }

    #[tokio::test]
    async fn open_store_builds_each_backend() {
        for config in [
            StoreConfig::in_memory(),
            StoreConfig::sqlite(SqliteConfig::in_memory()),
        ] {
            let store = open_store(&config, Arc::new(SystemClock)).await.unwrap();
            let job = store
                .create_job(Job::with_id("job-1", "client", JobSpec::default()))
                .await
                .unwrap();
            assert_eq!(store.get_job("job-1").await.unwrap(), job);
            store.close().await.unwrap();
        }
    }
}
