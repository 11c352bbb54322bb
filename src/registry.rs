//! Client registry - durable storage for dynamically registered clients.
//!
//! The [`ClientRegistry`] trait is the only contract the bridge depends on.
//! Two implementations ship with the crate:
//!
//! - [`InMemoryClientRegistry`]: `DashMap`-backed, lost on restart.
//! - [`FileClientRegistry`]: JSON array on disk, single-process only. Clients
//!   must survive restarts because downstream apps keep their `client_id`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::oauth::ClientRegistration;
use crate::{Error, Result};

/// Trait abstracting the client registry backend.
///
/// Readers overlapping a write must see either the old or the new record,
/// never a partial one.
#[async_trait]
pub trait ClientRegistry: Send + Sync + 'static {
    /// Look up a client by id
    async fn get(&self, client_id: &str) -> Result<Option<ClientRegistration>>;

    /// Insert or replace a client record
    async fn save(&self, client: ClientRegistration) -> Result<()>;

    /// All registered clients
    async fn list(&self) -> Result<Vec<ClientRegistration>>;
}

/// Registry that lives only in process memory
pub struct InMemoryClientRegistry {
    clients: DashMap<String, ClientRegistration>,
}

impl InMemoryClientRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }
}

impl Default for InMemoryClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientRegistry for InMemoryClientRegistry {
    async fn get(&self, client_id: &str) -> Result<Option<ClientRegistration>> {
        Ok(self.clients.get(client_id).map(|c| c.clone()))
    }

    async fn save(&self, client: ClientRegistration) -> Result<()> {
        self.clients.insert(client.client_id.clone(), client);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ClientRegistration>> {
        Ok(self.clients.iter().map(|e| e.value().clone()).collect())
    }
}

/// Registry persisted as a JSON array file.
///
/// The full set is held in memory behind a `RwLock`; every save rewrites the
/// file through a temp file and a rename so the on-disk copy is never torn.
/// Assumes a single server process owns the file.
pub struct FileClientRegistry {
    path: PathBuf,
    clients: RwLock<HashMap<String, ClientRegistration>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileClientRegistry {
    /// Open (or create on first save) the registry file at `path`.
    ///
    /// A missing file yields an empty registry; an unreadable or malformed
    /// file is an error so registrations are never silently dropped.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let clients = Self::load_file(&path)?;
        info!(path = %path.display(), count = clients.len(), "Loaded client registry");

        Ok(Self {
            path,
            clients: RwLock::new(clients),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Open the registry in the default location (`~/.oauth-bridge/clients.json`)
    pub fn default_location() -> Result<Self> {
        Self::open(default_path()?)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_file(path: &Path) -> Result<HashMap<String, ClientRegistration>> {
        if !path.exists() {
            debug!(path = %path.display(), "No client registry file yet");
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| Error::Registry(format!("Failed to read {}: {e}", path.display())))?;
        let records: Vec<ClientRegistration> = serde_json::from_str(&content)
            .map_err(|e| Error::Registry(format!("Failed to parse {}: {e}", path.display())))?;

        let mut clients = HashMap::with_capacity(records.len());
        for record in records {
            if let Err(e) = record.validate() {
                warn!(client_id = %record.client_id, error = %e, "Skipping invalid stored client");
                continue;
            }
            clients.insert(record.client_id.clone(), record);
        }
        Ok(clients)
    }

    async fn persist(&self, records: Vec<ClientRegistration>) -> Result<()> {
        let content = serde_json::to_string_pretty(&records)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, &content))
            .await
            .map_err(|e| Error::Registry(format!("Registry writer panicked: {e}")))?
    }
}

#[async_trait]
impl ClientRegistry for FileClientRegistry {
    async fn get(&self, client_id: &str) -> Result<Option<ClientRegistration>> {
        Ok(self.clients.read().get(client_id).cloned())
    }

    async fn save(&self, client: ClientRegistration) -> Result<()> {
        // Serialize writers so file contents follow the order of saves
        let _guard = self.write_lock.lock().await;

        // Readers only see the client once it is on disk
        let snapshot = {
            let clients = self.clients.read();
            let mut records: Vec<_> = clients
                .values()
                .filter(|c| c.client_id != client.client_id)
                .cloned()
                .chain(std::iter::once(client.clone()))
                .collect();
            records.sort_by(|a, b| a.client_id.cmp(&b.client_id));
            records
        };

        self.persist(snapshot).await?;
        self.clients.write().insert(client.client_id.clone(), client);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ClientRegistration>> {
        let mut records: Vec<_> = self.clients.read().values().cloned().collect();
        records.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(records)
    }
}

/// `~/.oauth-bridge/clients.json`
pub fn default_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Registry("Cannot determine home directory".to_string()))?;
    Ok(home.join(".oauth-bridge").join("clients.json"))
}

fn write_atomically(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            Error::Registry(format!("Failed to create {}: {e}", parent.display()))
        })?;
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)
        .map_err(|e| Error::Registry(format!("Failed to write {}: {e}", tmp.display())))?;

    // Set restrictive permissions (owner read/write only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
    }

    fs::rename(&tmp, path)
        .map_err(|e| Error::Registry(format!("Failed to replace {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::ClientRegistrationRequest;
    use pretty_assertions::assert_eq;

    fn client(uri: &str) -> ClientRegistration {
        ClientRegistration::from_request(ClientRegistrationRequest {
            redirect_uris: vec![uri.to_string()],
            scope: Some("identify".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn in_memory_save_and_get() {
        let registry = InMemoryClientRegistry::new();
        let c = client("https://app/cb");

        registry.save(c.clone()).await.unwrap();

        assert_eq!(registry.get(&c.client_id).await.unwrap(), Some(c));
        assert!(registry.get("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_memory_save_is_idempotent() {
        let registry = InMemoryClientRegistry::new();
        let c = client("https://app/cb");

        registry.save(c.clone()).await.unwrap();
        registry.save(c.clone()).await.unwrap();

        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_registry_survives_reopen() {
        // GIVEN: a registry file with two clients
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients.json");
        let a = client("https://a/cb");
        let b = client("https://b/cb");
        {
            let registry = FileClientRegistry::open(&path).unwrap();
            registry.save(a.clone()).await.unwrap();
            registry.save(b.clone()).await.unwrap();
        }

        // WHEN: the file is reopened
        let registry = FileClientRegistry::open(&path).unwrap();

        // THEN: both clients are back
        assert_eq!(registry.get(&a.client_id).await.unwrap(), Some(a));
        assert_eq!(registry.get(&b.client_id).await.unwrap(), Some(b));
        assert_eq!(registry.list().await.unwrap().len(), 2);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn file_registry_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("clients.json");
        let registry = FileClientRegistry::open(&path).unwrap();

        registry.save(client("https://app/cb")).await.unwrap();

        assert!(path.exists());
    }

    #[tokio::test]
    async fn failed_persist_leaves_client_unregistered() {
        // GIVEN: a registry whose parent path is a regular file
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let registry = FileClientRegistry::open(blocker.join("clients.json")).unwrap();
        let c = client("https://app/cb");

        // WHEN: saving a client
        let result = registry.save(c.clone()).await;

        // THEN: the save fails and the client was never visible
        assert!(result.is_err());
        assert!(registry.get(&c.client_id).await.unwrap().is_none());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_registry_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients.json");
        let registry = FileClientRegistry::open(&path).unwrap();
        registry.save(client("https://app/cb")).await.unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(FileClientRegistry::open(&path), Err(Error::Registry(_))));
    }

    #[test]
    fn invalid_stored_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients.json");
        fs::write(
            &path,
            r#"[{"client_id":"ok","redirect_uris":["https://app/cb"]},
                {"client_id":"bad","redirect_uris":[]}]"#,
        )
        .unwrap();

        let registry = FileClientRegistry::open(&path).unwrap();

        assert_eq!(registry.clients.read().len(), 1);
        assert!(registry.clients.read().contains_key("ok"));
    }

    #[tokio::test]
    async fn concurrent_saves_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients.json");
        let registry = std::sync::Arc::new(FileClientRegistry::open(&path).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let r = std::sync::Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                r.save(client(&format!("https://app{i}/cb"))).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let reopened = FileClientRegistry::open(&path).unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 8);
    }
}
