//! Lifecycle Controller — the consumer-facing API.
//!
//! Orchestrates config resolution, launching, the registry, liveness checks
//! and transport selection for a set of named servers. One instance serves
//! one client invocation; other invocations coordinate with it only through
//! the registry file.
//!
//! Per-server states: `Unknown → Launching → Running → Stopping → Stopped`,
//! with `Running → Running` on reconnect and `Launching → Stopped` on a
//! failed launch. Nothing here retries: launch and connect failures go
//! straight back to the caller.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::Child;

use super::config;
use super::errors::LifecycleError;
use super::lifecycle::{self, LaunchMode, ProcessLauncher, StopPolicy};
use super::liveness::{Liveness, LivenessClassifier};
use super::registry::{compute_config_hash, LaunchRecord, RegistryStore};
use super::settings::ClientSettings;
use super::transport::{self, Channel, ConnectionHandle, ConnectionStrategy, LineLink, ShutdownClass};
use super::types::{RawServerConfig, ServerConfig, ServersConfig, TransportKind};

// ─── Server State ────────────────────────────────────────────────────────────

/// Lifecycle state of one server name within this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unknown,
    Launching,
    Running,
    Stopping,
    Stopped,
}

impl ServerState {
    /// Whether the state machine permits moving to `next`.
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Unknown | Stopped, Launching | Running)
                | (Launching, Running)
                | (Running, Running)
                | (Unknown | Launching | Running, Stopping)
                | (Stopping, Running)
                | (_, Stopped)
        )
    }
}

/// Result of a liveness check in [`MultiServerClient::list_servers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running { pid: u32 },
    NotRunning,
    /// Remote endpoint; no local process to check.
    NotApplicable,
}

/// One row of [`MultiServerClient::list_servers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub name: String,
    pub transport_kind: Option<TransportKind>,
    pub url: Option<String>,
    pub status: RunStatus,
    pub persist: bool,
}

/// A process spawned by this client instance.
struct OwnedProcess {
    record: LaunchRecord,
    child: Child,
    link: Option<Arc<LineLink>>,
}

/// Leaves a server `Stopped` if its launch future is dropped mid-await.
///
/// The launcher kills the spawned process in that case, so `Launching`
/// would otherwise stick.
struct PendingLaunch<'a> {
    states: &'a mut HashMap<String, ServerState>,
    name: &'a str,
    armed: bool,
}

impl PendingLaunch<'_> {
    fn finish(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingLaunch<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(server = self.name, "launch cancelled");
            self.states.insert(self.name.to_string(), ServerState::Stopped);
        }
    }
}

// ─── MultiServerClient ───────────────────────────────────────────────────────

/// Manages the lifecycle of many named servers.
pub struct MultiServerClient {
    /// Raw server entries; resolved on every operation.
    configs: HashMap<String, RawServerConfig>,
    settings: ClientSettings,
    store: RegistryStore,
    classifier: LivenessClassifier,
    launcher: ProcessLauncher,
    states: HashMap<String, ServerState>,
    owned: HashMap<String, OwnedProcess>,
    session_id: uuid::Uuid,
}

impl MultiServerClient {
    /// Create a client for a named-server mapping.
    pub fn new(config: ServersConfig, settings: ClientSettings) -> Self {
        let session_id = uuid::Uuid::new_v4();
        tracing::info!(
            session = %session_id,
            servers = config.servers.len(),
            state_dir = %settings.state_dir.display(),
            "client session started"
        );

        Self {
            configs: config.servers,
            store: RegistryStore::new(settings.registry_path()),
            classifier: LivenessClassifier::default(),
            launcher: ProcessLauncher::new(&settings),
            settings,
            states: HashMap::new(),
            owned: HashMap::new(),
            session_id,
        }
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Add or replace a server entry.
    ///
    /// A live process launched from the previous entry is left alone; the
    /// next launch reports the drift.
    pub fn add_server(&mut self, name: &str, raw: RawServerConfig) {
        self.configs.insert(name.to_string(), raw);
    }

    /// Configured server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve the named entry.
    pub fn server_config(&self, name: &str) -> Result<ServerConfig, LifecycleError> {
        let raw = self.configs.get(name).ok_or_else(|| LifecycleError::NotFound {
            name: name.to_string(),
        })?;
        config::resolve(name, raw)
    }

    /// Current lifecycle state of `name`.
    pub fn state(&self, name: &str) -> ServerState {
        self.states.get(name).copied().unwrap_or(ServerState::Unknown)
    }

    fn set_state(&mut self, name: &str, next: ServerState) {
        let current = self.state(name);
        if !current.can_transition_to(next) {
            tracing::warn!(
                server = name,
                from = ?current,
                to = ?next,
                "unexpected server state transition"
            );
        }
        if current != next {
            tracing::debug!(server = name, from = ?current, to = ?next, "server state changed");
        }
        self.states.insert(name.to_string(), next);
    }

    // ─── Connect / Launch ────────────────────────────────────────────────

    /// Open a connection, launching the server first when its class needs a
    /// local process and none is live.
    ///
    /// Reentrant: connecting to a running server returns a fresh handle on
    /// the same process or endpoint.
    pub async fn connect(&mut self, name: &str) -> Result<ConnectionHandle, LifecycleError> {
        let config = self.server_config(name)?;
        let strategy = transport::select(name, config.transport_kind, config.url.as_deref())?;
        let connect_timeout = config
            .options
            .connect_timeout
            .unwrap_or_else(|| self.settings.connect_timeout());
        let headers: Vec<(String, String)> = config
            .options
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let channel = match &strategy {
            ConnectionStrategy::SpawnAttach => {
                let (record, link) = self.ensure_process(&config, false, true).await?;
                let link = link.ok_or_else(|| LifecycleError::Connect {
                    name: name.to_string(),
                    reason: format!("no pipe to process {} in this session", record.pid),
                })?;
                Channel::Pipe(link)
            }
            ConnectionStrategy::LaunchThenDial(endpoint) => {
                self.ensure_process(&config, false, false).await?;
                transport::dial(name, endpoint, headers, connect_timeout).await?
            }
            ConnectionStrategy::Dial(endpoint) => {
                let channel = transport::dial(name, endpoint, headers, connect_timeout).await?;
                self.set_state(name, ServerState::Running);
                channel
            }
        };

        let handle = ConnectionHandle::new(
            name,
            config.transport_kind,
            channel,
            config.options.request_timeout,
        );
        tracing::info!(
            server = name,
            handle = %handle.id(),
            transport = %config.transport_kind,
            "connected"
        );
        Ok(handle)
    }

    /// Launch a local server and mark it persistent, so session-end cleanup
    /// leaves it running.
    ///
    /// A live process from the same configuration is reused and its record
    /// marked persistent.
    pub async fn launch_explicit(&mut self, name: &str) -> Result<LaunchRecord, LifecycleError> {
        let config = self.server_config(name)?;
        if !config.transport_kind.is_local() {
            return Err(LifecycleError::Config {
                name: name.to_string(),
                reason: format!(
                    "{} servers are externally managed; there is no process to launch",
                    config.transport_kind
                ),
            });
        }
        let (record, _) = self.ensure_process(&config, true, false).await?;
        Ok(record)
    }

    /// Make sure a process for `config` is live, launching one if needed.
    ///
    /// `attach` requires a pipe link, which only exists for processes this
    /// client spawned.
    async fn ensure_process(
        &mut self,
        config: &ServerConfig,
        persist: bool,
        attach: bool,
    ) -> Result<(LaunchRecord, Option<Arc<LineLink>>), LifecycleError> {
        let name = config.name.as_str();
        let requested_hash = compute_config_hash(config);

        self.reap_exited(name).await;

        if let Some(owned) = self.owned.get(name) {
            let record = owned.record.clone();
            let link = owned.link.clone();
            check_drift(&record, &requested_hash)?;
            let record = if persist && !record.persist {
                self.mark_persist(record).await
            } else {
                record
            };
            self.set_state(name, ServerState::Running);
            return Ok((record, link));
        }

        let existing = self.store.refresh().await.get(name).cloned();
        if let Some(record) = existing {
            match self.classifier.classify(&record) {
                Liveness::Alive => {
                    check_drift(&record, &requested_hash)?;
                    if attach {
                        return Err(LifecycleError::Connect {
                            name: name.to_string(),
                            reason: format!(
                                "running as pid {} under another client; local-pipe servers \
                                 can only be reached by the process that launched them",
                                record.pid
                            ),
                        });
                    }
                    let record = if persist && !record.persist {
                        self.mark_persist(record).await
                    } else {
                        record
                    };
                    self.set_state(name, ServerState::Running);
                    return Ok((record, None));
                }
                liveness => self.evict(&record, liveness).await,
            }
        }

        if !persist && !self.settings.auto_launch {
            return Err(LifecycleError::NotRunning {
                name: name.to_string(),
            });
        }

        let mode = match config.transport_kind {
            TransportKind::LocalPipe => LaunchMode::Attached,
            TransportKind::LocalSocket => LaunchMode::Detached,
            TransportKind::RemoteHttp | TransportKind::RemoteSocket => {
                return Err(LifecycleError::Config {
                    name: name.to_string(),
                    reason: format!("{} servers are not launched locally", config.transport_kind),
                });
            }
        };

        self.set_state(name, ServerState::Launching);
        let pending = PendingLaunch {
            states: &mut self.states,
            name,
            armed: true,
        };
        let result = self.launcher.launch(config, mode).await;
        pending.finish();

        let launched = match result {
            Ok(launched) => launched,
            Err(e) => {
                tracing::error!(server = name, error = %e, "launch failed");
                self.set_state(name, ServerState::Stopped);
                return Err(e);
            }
        };

        let record = LaunchRecord {
            server_name: name.to_string(),
            pid: launched.pid,
            start_time_utc: launched.started_at,
            stdout_log: launched.stdout_log,
            stderr_log: launched.stderr_log,
            config_hash: requested_hash,
            persist,
            transport_kind: Some(config.transport_kind),
            command: config.command.clone(),
        };

        // Tracked before the registry write so a cancelled write can't
        // orphan the process.
        let link = launched.link.clone();
        self.owned.insert(
            name.to_string(),
            OwnedProcess {
                record: record.clone(),
                child: launched.child,
                link: launched.link,
            },
        );
        self.set_state(name, ServerState::Running);

        if let Err(e) = self.store.upsert(name, record.clone()).await {
            tracing::error!(
                server = name,
                error = %e,
                path = %self.store.path().display(),
                "failed to persist launch record"
            );
        }
        Ok((record, link))
    }

    async fn mark_persist(&mut self, mut record: LaunchRecord) -> LaunchRecord {
        record.persist = true;
        if let Some(owned) = self.owned.get_mut(&record.server_name) {
            owned.record.persist = true;
        }
        if let Err(e) = self.store.upsert(&record.server_name, record.clone()).await {
            tracing::error!(server = %record.server_name, error = %e, "failed to persist launch record");
        }
        record
    }

    // ─── Liveness ────────────────────────────────────────────────────────

    /// Whether `name` has a live process, and its pid.
    ///
    /// Stale registry records (dead or reused pid) are evicted.
    pub async fn is_running(&mut self, name: &str) -> (bool, Option<u32>) {
        self.reap_exited(name).await;

        if let Some(owned) = self.owned.get(name) {
            return (true, Some(owned.record.pid));
        }

        let Some(record) = self.store.refresh().await.get(name).cloned() else {
            return (false, None);
        };

        match self.classifier.classify(&record) {
            Liveness::Alive => {
                if self.state(name) != ServerState::Running {
                    self.set_state(name, ServerState::Running);
                }
                (true, Some(record.pid))
            }
            liveness => {
                self.evict(&record, liveness).await;
                (false, None)
            }
        }
    }

    /// Status of every configured or recorded server.
    pub async fn list_servers(&mut self) -> Vec<ServerStatus> {
        let mut names: BTreeSet<String> = self.configs.keys().cloned().collect();
        names.extend(self.store.refresh().await.names());
        names.extend(self.owned.keys().cloned());

        let mut rows = Vec::with_capacity(names.len());
        for name in names {
            let (transport_kind, url) = match self.server_config(&name) {
                Ok(config) => (Some(config.transport_kind), config.url),
                Err(_) => (
                    self.store.get(&name).await.and_then(|r| r.transport_kind),
                    None,
                ),
            };

            let status = match transport_kind {
                Some(kind) if !kind.is_local() => RunStatus::NotApplicable,
                _ => match self.is_running(&name).await {
                    (true, Some(pid)) => RunStatus::Running { pid },
                    _ => RunStatus::NotRunning,
                },
            };
            let persist = self.store.get(&name).await.is_some_and(|r| r.persist);

            rows.push(ServerStatus {
                name,
                transport_kind,
                url,
                status,
                persist,
            });
        }
        rows
    }

    /// Forget an owned process that has exited, evicting its record.
    async fn reap_exited(&mut self, name: &str) {
        let exited = match self.owned.get_mut(name) {
            Some(owned) => !matches!(owned.child.try_wait(), Ok(None)),
            None => return,
        };
        if !exited {
            return;
        }

        if let Some(owned) = self.owned.remove(name) {
            tracing::info!(server = name, pid = owned.record.pid, "server process has exited");
            self.remove_record(name, &owned.record).await;
            self.set_state(name, ServerState::Stopped);
        }
    }

    async fn evict(&mut self, record: &LaunchRecord, liveness: Liveness) {
        let name = record.server_name.as_str();
        tracing::info!(
            server = name,
            pid = record.pid,
            liveness = ?liveness,
            "evicting stale launch record"
        );
        self.remove_record(name, record).await;
        self.set_state(name, ServerState::Stopped);
    }

    /// Drop `name`'s registry record if it still belongs to `record`'s
    /// launch. A newer launch by another invocation is left alone.
    async fn remove_record(&mut self, name: &str, record: &LaunchRecord) {
        if let Err(e) = self.store.remove_matching(name, record).await {
            tracing::warn!(server = name, error = %e, "failed to remove launch record");
        }
    }

    // ─── Stop ────────────────────────────────────────────────────────────

    /// Stop `name`: terminate gracefully, then forcefully, then evict its
    /// record. Stopping a server that isn't running succeeds.
    pub async fn stop(&mut self, name: &str) -> Result<(), LifecycleError> {
        self.reap_exited(name).await;

        let record = match self.owned.get(name) {
            Some(owned) => Some(owned.record.clone()),
            None => self.store.refresh().await.get(name).cloned(),
        };
        let Some(record) = record else {
            tracing::debug!(server = name, "server already stopped");
            if self.states.contains_key(name) {
                self.set_state(name, ServerState::Stopped);
            }
            return Ok(());
        };

        if !self.owned.contains_key(name) {
            let liveness = self.classifier.classify(&record);
            if !liveness.is_alive() {
                // Never signal a pid that isn't ours anymore.
                self.evict(&record, liveness).await;
                return Ok(());
            }
        }

        self.set_state(name, ServerState::Stopping);
        tracing::info!(server = name, pid = record.pid, "stopping server");

        let policy = StopPolicy {
            grace: self.settings.stop_grace(),
            kill_wait: self.settings.kill_wait(),
            group: self.launcher.signals_group(),
        };
        let classifier = &self.classifier;
        let pid_exists = |pid: u32| classifier.pid_exists(pid);

        let result = match self.owned.get_mut(name) {
            Some(owned) => {
                if let Some(link) = &owned.link {
                    link.close().await;
                }
                lifecycle::terminate(record.pid, Some(&mut owned.child), &pid_exists, policy).await
            }
            None => lifecycle::terminate(record.pid, None, &pid_exists, policy).await,
        };

        match result {
            Ok(outcome) => {
                tracing::info!(server = name, pid = record.pid, outcome = ?outcome, "server stopped");
                self.owned.remove(name);
                self.remove_record(name, &record).await;
                self.set_state(name, ServerState::Stopped);
                Ok(())
            }
            Err(reason) => {
                tracing::error!(server = name, pid = record.pid, reason = %reason, "failed to stop server");
                self.set_state(name, ServerState::Running);
                Err(LifecycleError::Stop {
                    name: name.to_string(),
                    pid: record.pid,
                    reason,
                })
            }
        }
    }

    /// Stop every recorded server. One failure never prevents the others.
    pub async fn stop_all(&mut self) -> BTreeMap<String, Result<(), LifecycleError>> {
        let mut names: BTreeSet<String> = self.store.refresh().await.names().into_iter().collect();
        names.extend(self.owned.keys().cloned());

        let mut results = BTreeMap::new();
        for name in names {
            let result = self.stop(&name).await;
            results.insert(name, result);
        }
        results
    }

    // ─── Sessions ────────────────────────────────────────────────────────

    /// Release `handles`; with `stop_servers`, also stop the local-pipe
    /// servers they were connected to. Socket and remote servers are never
    /// stopped here.
    pub async fn close_session(
        &mut self,
        handles: Vec<ConnectionHandle>,
        stop_servers: bool,
    ) -> BTreeMap<String, Result<(), LifecycleError>> {
        let mut pipe_servers = BTreeSet::new();
        for handle in handles {
            if handle.shutdown_class() == ShutdownClass::LocalPipe {
                pipe_servers.insert(handle.server_name().to_string());
            }
            handle.close().await;
        }

        let mut results = BTreeMap::new();
        if stop_servers {
            for name in pipe_servers {
                let result = self.stop(&name).await;
                results.insert(name, result);
            }
        }
        results
    }

    /// Default end-of-session policy: release `handles`, then stop the
    /// local-pipe servers this client spawned, except those launched with
    /// persist.
    pub async fn end_session(
        &mut self,
        handles: Vec<ConnectionHandle>,
    ) -> BTreeMap<String, Result<(), LifecycleError>> {
        for handle in handles {
            handle.close().await;
        }

        let targets: Vec<String> = self
            .owned
            .iter()
            .filter(|(_, owned)| {
                !owned.record.persist
                    && owned.record.transport_kind == Some(TransportKind::LocalPipe)
            })
            .map(|(name, _)| name.clone())
            .collect();

        let mut results = BTreeMap::new();
        for name in targets {
            let result = self.stop(&name).await;
            results.insert(name, result);
        }
        tracing::info!(session = %self.session_id, stopped = results.len(), "client session ended");
        results
    }

    // ─── Logs ────────────────────────────────────────────────────────────

    /// Log file paths `(stdout, stderr)` of the current launch of `name`.
    pub async fn get_logs(&mut self, name: &str) -> Result<(PathBuf, PathBuf), LifecycleError> {
        let record = match self.owned.get(name) {
            Some(owned) => Some(owned.record.clone()),
            None => self.store.refresh().await.get(name).cloned(),
        };
        record
            .map(|r| (r.stdout_log, r.stderr_log))
            .ok_or_else(|| LifecycleError::NotFound {
                name: name.to_string(),
            })
    }

    /// Last `lines` lines of each log of `name`, as `(stdout, stderr)`.
    pub async fn tail_logs(
        &mut self,
        name: &str,
        lines: usize,
    ) -> Result<(Vec<String>, Vec<String>), LifecycleError> {
        let (stdout_log, stderr_log) = self.get_logs(name).await?;
        Ok((
            lifecycle::tail_file(&stdout_log, lines).await,
            lifecycle::tail_file(&stderr_log, lines).await,
        ))
    }
}

fn check_drift(record: &LaunchRecord, requested_hash: &str) -> Result<(), LifecycleError> {
    if record.config_hash == requested_hash {
        return Ok(());
    }
    Err(LifecycleError::ConfigDrift {
        name: record.server_name.clone(),
        pid: record.pid,
        stored_hash: record.config_hash.clone(),
        requested_hash: requested_hash.to_string(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
