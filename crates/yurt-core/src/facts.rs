//! Durable key/value facts about the environment.
//!
//! The store is a flat JSON document. Every access reads the whole document;
//! every write reads it, changes one key and writes the whole document back.
//! Nothing is cached between calls, so each operation sees the latest facts
//! on disk.
//!
//! Access through one store is serialized. A write runs to completion even
//! if its caller stops waiting, and later calls wait for it, so a cancelled
//! `set` cannot land after a following `clear`. A missing document reads as
//! empty and is only created by the first write.

use crate::error::{CoreError, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Keys of the persisted facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactKey {
    VmName,
    Interface,
    InterfaceIpAddress,
    InterfaceNetmask,
    SshPort,
    RuntimePort,
    IsRuntimeInitialized,
}

impl FactKey {
    pub const ALL: [FactKey; 7] = [
        FactKey::VmName,
        FactKey::Interface,
        FactKey::InterfaceIpAddress,
        FactKey::InterfaceNetmask,
        FactKey::SshPort,
        FactKey::RuntimePort,
        FactKey::IsRuntimeInitialized,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactKey::VmName => "vm_name",
            FactKey::Interface => "interface",
            FactKey::InterfaceIpAddress => "interface_ip_address",
            FactKey::InterfaceNetmask => "interface_netmask",
            FactKey::SshPort => "ssh_port",
            FactKey::RuntimePort => "runtime_port",
            FactKey::IsRuntimeInitialized => "is_runtime_initialized",
        }
    }
}

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON-document backed fact store.
#[derive(Debug, Clone)]
pub struct FactStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

enum Update {
    Set(FactKey, String),
    Clear,
}

impl FactStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a fact as a string. Numbers and booleans are rendered as text.
    pub async fn get(&self, key: FactKey) -> Result<Option<String>> {
        let document = self.read_locked().await?;
        Ok(document.get(key.as_str()).and_then(value_to_string))
    }

    /// Read a fact and parse it, treating an unparseable value as a read error.
    pub async fn get_parsed<T: FromStr>(&self, key: FactKey) -> Result<Option<T>> {
        match self.get(key).await? {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| CoreError::ConfigRead {
                path: self.path.clone(),
                reason: format!("fact {key} has unexpected value '{raw}'"),
            }),
        }
    }

    /// Set one fact. If the write fails, the previous document is restored
    /// before the error is reported.
    pub async fn set(&self, key: FactKey, value: impl ToString) -> Result<()> {
        self.commit(Update::Set(key, value.to_string())).await
    }

    /// Remove every fact.
    pub async fn clear(&self) -> Result<()> {
        tracing::debug!(path = %self.path.display(), "Clearing facts");
        self.commit(Update::Clear).await
    }

    /// Apply `update` on a detached task that holds the store lock until
    /// the document is written.
    async fn commit(&self, update: Update) -> Result<()> {
        let guard = self.lock.clone().lock_owned().await;
        let store = self.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            store.apply(update).await
        });
        task.await.map_err(|e| CoreError::ConfigWrite {
            path: self.path.clone(),
            source: std::io::Error::other(e),
        })?
    }

    async fn apply(&self, update: Update) -> Result<()> {
        let (key, value) = match update {
            Update::Clear => return self.write(&Map::new()).await,
            Update::Set(key, value) => (key, value),
        };

        let old = self.read().await?;
        let mut new = old.clone();
        new.insert(key.as_str().to_string(), Value::String(value));

        if let Err(e) = self.write(&new).await {
            tracing::error!(key = %key, error = %e, "Failed to write fact, restoring previous document");
            if let Err(restore) = self.write(&old).await {
                tracing::error!(error = %restore, "Failed to restore previous fact document");
            }
            return Err(e);
        }
        tracing::debug!(key = %key, "Fact recorded");
        Ok(())
    }

    /// All facts currently recorded, for diagnostics.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, String>> {
        let document = self.read_locked().await?;
        Ok(document
            .iter()
            .filter_map(|(k, v)| value_to_string(v).map(|v| (k.clone(), v)))
            .collect())
    }

    /// Read every known fact in a single pass.
    pub async fn environment(&self) -> Result<EnvironmentFacts> {
        let document = self.read_locked().await?;
        let text = |key: FactKey| document.get(key.as_str()).and_then(value_to_string);
        let port = |key: FactKey| -> Result<Option<u16>> {
            text(key)
                .map(|raw| {
                    raw.parse().map_err(|_| CoreError::ConfigRead {
                        path: self.path.clone(),
                        reason: format!("fact {key} has unexpected value '{raw}'"),
                    })
                })
                .transpose()
        };

        Ok(EnvironmentFacts {
            vm_name: text(FactKey::VmName),
            interface: text(FactKey::Interface),
            interface_ip_address: text(FactKey::InterfaceIpAddress),
            interface_netmask: text(FactKey::InterfaceNetmask),
            ssh_port: port(FactKey::SshPort)?,
            runtime_port: port(FactKey::RuntimePort)?,
            runtime_initialized: text(FactKey::IsRuntimeInitialized).as_deref() == Some("true"),
        })
    }

    async fn read_locked(&self) -> Result<Map<String, Value>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn read(&self) -> Result<Map<String, Value>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => {
                return Err(CoreError::ConfigRead {
                    path: self.path.clone(),
                    reason: e.to_string(),
                })
            }
        };

        if raw.trim().is_empty() {
            return Ok(Map::new());
        }

        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(CoreError::ConfigRead {
                path: self.path.clone(),
                reason: "fact document is not a JSON object".into(),
            }),
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Malformed fact document");
                Err(CoreError::ConfigRead {
                    path: self.path.clone(),
                    reason: format!("malformed fact document: {e}"),
                })
            }
        }
    }

    async fn write(&self, document: &Map<String, Value>) -> Result<()> {
        let write_err = |source| CoreError::ConfigWrite {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        let body = serde_json::to_string_pretty(document)
            .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        // Readers outside this store never see a half-written document
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, body).await.map_err(write_err)?;
        tokio::fs::rename(&staging, &self.path).await.map_err(write_err)
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Every fact in one read, as typed values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentFacts {
    pub vm_name: Option<String>,
    pub interface: Option<String>,
    pub interface_ip_address: Option<String>,
    pub interface_netmask: Option<String>,
    pub ssh_port: Option<u16>,
    pub runtime_port: Option<u16>,
    pub runtime_initialized: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FactStore {
        FactStore::new(dir.path().join("nested").join("config.json"))
    }

    #[tokio::test]
    async fn test_reading_missing_document_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let facts = store(&dir);

        assert_eq!(facts.get(FactKey::VmName).await.unwrap(), None);
        assert_eq!(facts.environment().await.unwrap(), EnvironmentFacts::default());
        assert!(facts.snapshot().await.unwrap().is_empty());
        assert!(!facts.path().exists());
        assert!(!facts.path().parent().unwrap().exists());

        facts.clear().await.unwrap();
        let raw = std::fs::read_to_string(facts.path()).unwrap();
        assert_eq!(raw.trim(), "{}");
    }

    #[tokio::test]
    async fn test_abandoned_set_cannot_outlive_clear() {
        let dir = TempDir::new().unwrap();
        let facts = store(&dir);

        for _ in 0..20 {
            let abandoned = facts.set(FactKey::VmName, "yurt-abandoned");
            let _ = tokio::time::timeout(Duration::ZERO, abandoned).await;
            facts.clear().await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(facts.get(FactKey::VmName).await.unwrap(), None);
        }
        assert!(!facts.path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let dir = TempDir::new().unwrap();
        let facts = store(&dir);

        facts.set(FactKey::VmName, "yurt-1234").await.unwrap();
        facts.set(FactKey::SshPort, 55022).await.unwrap();

        assert_eq!(
            facts.get(FactKey::VmName).await.unwrap().as_deref(),
            Some("yurt-1234")
        );
        assert_eq!(facts.get_parsed::<u16>(FactKey::SshPort).await.unwrap(), Some(55022));
    }

    #[tokio::test]
    async fn test_numbers_written_by_other_tools_are_readable() {
        let dir = TempDir::new().unwrap();
        let facts = store(&dir);
        std::fs::create_dir_all(facts.path().parent().unwrap()).unwrap();
        std::fs::write(facts.path(), r#"{"ssh_port": 4022, "is_runtime_initialized": true}"#).unwrap();

        let env = facts.environment().await.unwrap();
        assert_eq!(env.ssh_port, Some(4022));
        assert!(env.runtime_initialized);
    }

    #[tokio::test]
    async fn test_malformed_document_is_read_error() {
        let dir = TempDir::new().unwrap();
        let facts = store(&dir);
        std::fs::create_dir_all(facts.path().parent().unwrap()).unwrap();
        std::fs::write(facts.path(), "{not json").unwrap();

        let err = facts.get(FactKey::VmName).await.unwrap_err();
        assert!(matches!(err, CoreError::ConfigRead { .. }));
        let err = facts.set(FactKey::VmName, "x").await.unwrap_err();
        assert!(matches!(err, CoreError::ConfigRead { .. }));
    }

    #[tokio::test]
    async fn test_unparseable_port_is_read_error() {
        let dir = TempDir::new().unwrap();
        let facts = store(&dir);
        facts.set(FactKey::SshPort, "twenty-two").await.unwrap();

        assert!(facts.get_parsed::<u16>(FactKey::SshPort).await.is_err());
        assert!(facts.environment().await.is_err());
    }

    #[tokio::test]
    async fn test_clear_removes_every_key() {
        let dir = TempDir::new().unwrap();
        let facts = store(&dir);
        for key in FactKey::ALL {
            facts.set(key, "value").await.unwrap();
        }
        assert_eq!(facts.snapshot().await.unwrap().len(), FactKey::ALL.len());

        facts.clear().await.unwrap();
        assert!(facts.snapshot().await.unwrap().is_empty());
        assert_eq!(facts.environment().await.unwrap(), EnvironmentFacts::default());
    }
}
