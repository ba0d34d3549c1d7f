// Durable credential record storage

use anyhow::{Context, Result};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::auth::CredentialRecord;

/// Persists one credential record per integration identity
pub trait CredentialStore: Send + Sync {
    fn load(&self, integration: &str) -> Result<Option<CredentialRecord>>;
    fn save(&self, integration: &str, record: &CredentialRecord) -> Result<()>;
}

/// Storage backend selected in configuration
#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackend {
    Sqlite,
    Json,
    Memory,
}

/// Open the configured store
pub fn open_store(backend: &StorageBackend, path: &Path) -> Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match backend {
        StorageBackend::Sqlite => Arc::new(SqliteCredentialStore::open(path)?),
        StorageBackend::Json => Arc::new(JsonFileStore::new(path)?),
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory credential storage; tokens will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

fn storage_key(integration: &str) -> String {
    format!("{}:oauth:token", integration)
}

/// SQLite key/value store (`auth_kv` table, JSON values)
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("SQLite connection lock poisoned"))
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn load(&self, integration: &str) -> Result<Option<CredentialRecord>> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [storage_key(integration)],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to load credentials for {}", integration))?;

        value
            .map(|json| {
                serde_json::from_str(&json)
                    .with_context(|| format!("Failed to parse stored credentials for {}", integration))
            })
            .transpose()
    }

    fn save(&self, integration: &str, record: &CredentialRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize credentials")?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![storage_key(integration), json],
        )
        .with_context(|| format!("Failed to save credentials for {}", integration))?;
        Ok(())
    }
}

/// One pretty-printed JSON file per integration (`<dir>/<integration>_tokens.json`)
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create token directory: {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, integration: &str) -> Result<PathBuf> {
        if integration.is_empty()
            || !integration
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!("Invalid integration identifier for file storage: {:?}", integration);
        }
        Ok(self.dir.join(format!("{}_tokens.json", integration)))
    }
}

impl CredentialStore for JsonFileStore {
    fn load(&self, integration: &str) -> Result<Option<CredentialRecord>> {
        let path = self.path_for(integration)?;
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let record = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(record))
    }

    fn save(&self, integration: &str, record: &CredentialRecord) -> Result<()> {
        let path = self.path_for(integration)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record).context("Failed to serialize credentials")?;

        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        tracing::debug!(integration = integration, path = %path.display(), "Credentials saved");
        Ok(())
    }
}

/// Process-local storage
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, CredentialRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self, integration: &str) -> Result<Option<CredentialRecord>> {
        Ok(self.records.get(integration).map(|r| r.value().clone()))
    }

    fn save(&self, integration: &str, record: &CredentialRecord) -> Result<()> {
        self.records.insert(integration.to_string(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn record(access: &str, refresh: Option<&str>) -> CredentialRecord {
        let now = Utc::now();
        CredentialRecord {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_at: now + Duration::seconds(3600),
            acquired_at: now,
        }
    }

    #[test]
    fn test_sqlite_store_overwrites_in_place() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        assert!(store.load("conta_azul").unwrap().is_none());

        store.save("conta_azul", &record("a1", Some("r1"))).unwrap();
        let updated = record("a2", None);
        store.save("conta_azul", &updated).unwrap();

        assert_eq!(store.load("conta_azul").unwrap(), Some(updated));
    }

    #[test]
    fn test_sqlite_store_keeps_identities_apart() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        store.save("conta_azul", &record("ca", Some("r"))).unwrap();
        store.save("digisac", &record("dg", Some("r"))).unwrap();

        assert_eq!(store.load("conta_azul").unwrap().unwrap().access_token, "ca");
        assert_eq!(store.load("digisac").unwrap().unwrap().access_token, "dg");
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("credentials.sqlite3");
        let saved = record("a", Some("r"));

        SqliteCredentialStore::open(&path)
            .unwrap()
            .save("digisac", &saved)
            .unwrap();

        let reopened = SqliteCredentialStore::open(&path).unwrap();
        assert_eq!(reopened.load("digisac").unwrap(), Some(saved));
    }

    #[test]
    fn test_json_store_writes_one_file_per_integration() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        let saved = record("a", None);

        store.save("conta_azul", &saved).unwrap();

        assert!(dir.path().join("conta_azul_tokens.json").exists());
        assert!(!dir.path().join("conta_azul_tokens.json.tmp").exists());
        assert_eq!(store.load("conta_azul").unwrap(), Some(saved));
        assert!(store.load("digisac").unwrap().is_none());
    }

    #[test]
    fn test_json_store_rejects_path_like_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        assert!(store.save("../escape", &record("a", None)).is_err());
    }

    #[test]
    fn test_json_store_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("digisac_tokens.json"), "{not json").unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        assert!(store.load("digisac").is_err());
    }
}
