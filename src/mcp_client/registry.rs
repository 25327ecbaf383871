//! Registry Store — the persisted `server name → launch record` mapping.
//!
//! The registry file is shared by every client invocation on the machine and
//! there is no lock. Writes are read-merge-write:
//! - the on-disk file is re-read immediately before writing,
//! - per key, the record with the newer `startTimeUtc` wins,
//! - entries this store removed are dropped unless the disk copy is newer,
//! - entries another writer removed since our last read stay removed,
//! - the result goes to a temp file that is renamed over the target.
//!
//! Two clients launching the same name at once can still both spawn; the
//! later record wins and the earlier process is orphaned. That race is
//! accepted rather than papered over with a lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::types::{ServerConfig, TransportKind};

// ─── LaunchRecord ────────────────────────────────────────────────────────────

/// Persisted fact about one launched server process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRecord {
    /// Registry key; not stored inside the entry.
    #[serde(skip)]
    pub server_name: String,
    pub pid: u32,
    pub start_time_utc: DateTime<Utc>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    pub config_hash: String,
    /// Launched with an explicit persist request; skip stop-on-session-end.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub persist: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_kind: Option<TransportKind>,
    /// Program that was executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// The full mapping, ordered by name so serialization is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Registry {
    entries: BTreeMap<String, LaunchRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&LaunchRecord> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Insert or replace the record for `name`.
    pub fn insert(&mut self, name: &str, mut record: LaunchRecord) {
        record.server_name = name.to_string();
        self.entries.insert(name.to_string(), record);
    }

    pub fn remove(&mut self, name: &str) -> Option<LaunchRecord> {
        self.entries.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LaunchRecord)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse registry JSON, skipping entries that fail to deserialize.
    fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(content)?;
        let mut registry = Self::new();
        for (name, value) in raw {
            match serde_json::from_value::<LaunchRecord>(value) {
                Ok(record) => registry.insert(&name, record),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "dropping malformed registry entry");
                }
            }
        }
        Ok(registry)
    }
}

/// Three-way merge of the on-disk registry with the registry being saved.
///
/// `baseline` is what this store last read from disk; `removed` maps names
/// this store deleted to the start time of the record it deleted.
fn merge(
    disk: Registry,
    ours: &Registry,
    baseline: &Registry,
    removed: &BTreeMap<String, DateTime<Utc>>,
) -> Registry {
    let mut merged = disk;

    for (name, removed_start) in removed {
        if merged
            .get(name)
            .is_some_and(|r| r.start_time_utc <= *removed_start)
        {
            merged.remove(name);
        }
    }

    for (name, record) in ours.iter() {
        // Unchanged since our last read and gone from disk: another writer
        // removed it, so do not resurrect it.
        if !merged.contains(name) && baseline.get(name) == Some(record) {
            continue;
        }
        let keep_disk = merged
            .get(name)
            .is_some_and(|existing| existing.start_time_utc > record.start_time_utc);
        if !keep_disk {
            merged.insert(name, record.clone());
        }
    }

    merged
}

// ─── Config Hash ─────────────────────────────────────────────────────────────

/// Digest of the launch-relevant parts of a config.
///
/// Covers transport kind, command, args, env (sorted) and url. Each field is
/// length-prefixed so `["a b"]` and `["a", "b"]` hash differently. Stable
/// across process restarts.
pub fn compute_config_hash(config: &ServerConfig) -> String {
    fn feed(hasher: &mut Sha256, bytes: &[u8]) {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }

    let mut hasher = Sha256::new();
    feed(&mut hasher, config.transport_kind.as_str().as_bytes());
    feed(&mut hasher, config.command.as_deref().unwrap_or("").as_bytes());
    hasher.update((config.args.len() as u64).to_le_bytes());
    for arg in &config.args {
        feed(&mut hasher, arg.as_bytes());
    }
    hasher.update((config.env.len() as u64).to_le_bytes());
    for (key, value) in &config.env {
        feed(&mut hasher, key.as_bytes());
        feed(&mut hasher, value.as_bytes());
    }
    feed(&mut hasher, config.url.as_deref().unwrap_or("").as_bytes());

    let hash = hasher.finalize();
    format!("{hash:x}")
}

// ─── RegistryStore ───────────────────────────────────────────────────────────

/// Repository object owning all access to the registry file.
pub struct RegistryStore {
    path: PathBuf,
    /// In-memory view; `None` until first access.
    cache: Option<Registry>,
    /// Registry as last read from disk.
    baseline: Registry,
    /// Names removed by this store since the last successful save.
    removed: BTreeMap<String, DateTime<Utc>>,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: None,
            baseline: Registry::new(),
            removed: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registry contents, reading the file on first access.
    pub async fn load(&mut self) -> &Registry {
        if self.cache.is_none() {
            let disk = read_registry(&self.path).await;
            self.baseline = disk.clone();
            self.cache = Some(disk);
        }
        self.cache.get_or_insert_with(Registry::new)
    }

    /// Re-read the file, picking up writes from other invocations.
    ///
    /// Every mutation is flushed immediately, so nothing local is lost.
    pub async fn refresh(&mut self) -> &Registry {
        self.cache = None;
        self.load().await
    }

    /// Current record for `name`, if any.
    pub async fn get(&mut self, name: &str) -> Option<LaunchRecord> {
        self.load().await.get(name).cloned()
    }

    /// Merge `registry` into the on-disk file and write it atomically.
    pub async fn save(&mut self, registry: &Registry) -> std::io::Result<()> {
        let disk = read_registry(&self.path).await;
        let merged = merge(disk, registry, &self.baseline, &self.removed);

        write_atomic(&self.path, &merged).await?;

        tracing::debug!(
            path = %self.path.display(),
            entries = merged.len(),
            "saved server registry"
        );

        self.removed.clear();
        self.baseline = merged.clone();
        self.cache = Some(merged);
        Ok(())
    }

    /// Insert or replace the record for `name` and flush.
    pub async fn upsert(&mut self, name: &str, record: LaunchRecord) -> std::io::Result<()> {
        let mut registry = self.load().await.clone();
        registry.insert(name, record);
        self.removed.remove(name);
        self.save(&registry).await
    }

    /// Remove the record for `name` and flush. Returns the removed record.
    pub async fn remove(&mut self, name: &str) -> std::io::Result<Option<LaunchRecord>> {
        let mut registry = self.load().await.clone();
        let removed = registry.remove(name);
        match &removed {
            Some(record) => {
                self.removed.insert(name.to_string(), record.start_time_utc);
                self.save(&registry).await?;
            }
            None => {
                tracing::debug!(server = name, "no registry entry to remove");
            }
        }
        Ok(removed)
    }

    /// Remove `name`'s record only if it still describes the same launch as
    /// `record` (same pid and start time). Returns whether it was removed.
    pub async fn remove_matching(
        &mut self,
        name: &str,
        record: &LaunchRecord,
    ) -> std::io::Result<bool> {
        let matches = self.refresh().await.get(name).is_some_and(|current| {
            current.pid == record.pid && current.start_time_utc == record.start_time_utc
        });
        if !matches {
            tracing::debug!(
                server = name,
                pid = record.pid,
                "launch record was replaced, leaving it in place"
            );
            return Ok(false);
        }
        Ok(self.remove(name).await?.is_some())
    }
}

/// Read the registry file. Missing, unreadable or corrupt files read as empty.
async fn read_registry(path: &Path) -> Registry {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Registry::new(),
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %path.display(),
                "failed to read server registry, treating as empty"
            );
            return Registry::new();
        }
    };

    if content.trim().is_empty() {
        return Registry::new();
    }

    match Registry::from_json(&content) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %path.display(),
                "failed to parse server registry, treating as empty"
            );
            Registry::new()
        }
    }
}

/// Write to a per-process temp file, then rename over the target.
async fn write_atomic(path: &Path, registry: &Registry) -> std::io::Result<()> {
    let mut content = serde_json::to_string_pretty(registry).map_err(std::io::Error::other)?;
    content.push('\n');

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "servers.json".to_string());
    let tmp_path = path.with_file_name(format!("{file_name}.{}.tmp", std::process::id()));

    tokio::fs::write(&tmp_path, content.as_bytes()).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
