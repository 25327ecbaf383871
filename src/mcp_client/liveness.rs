//! Liveness Classifier — is the process behind a launch record still ours?
//!
//! A record is live only when its pid exists *and* the process at that pid
//! is the one we launched. PIDs are reused, so existence alone is not
//! enough: a process that started well after the recorded launch time is
//! foreign and the record is stale. Command lines are not compared, since
//! launchers like `sh -c`, `npx` and `uvx` exec into other programs.
//!
//! Stale records are evicted by the caller. An inconclusive check (no
//! process metadata available) counts as live, since evicting a running
//! server's record would orphan it.

use chrono::{DateTime, Utc};

use super::registry::LaunchRecord;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Allowed gap between the recorded launch time and the OS start time.
///
/// Spawn-to-record latency plus the 1s granularity of OS start times.
const START_TIME_TOLERANCE_SECS: i64 = 10;

// ─── Process Inspection ──────────────────────────────────────────────────────

/// What the OS reports about a pid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub start_time: Option<DateTime<Utc>>,
    pub zombie: bool,
}

/// OS process queries, behind a trait so classification is testable.
pub trait ProcessInspector: Send + Sync {
    /// Whether a process with this pid exists, in any state.
    fn exists(&self, pid: u32) -> bool;

    /// Metadata for the pid, if the OS provides it.
    fn snapshot(&self, pid: u32) -> Option<ProcessSnapshot>;
}

/// Inspector backed by the running OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInspector;

impl ProcessInspector for SystemInspector {
    #[cfg(unix)]
    fn exists(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        // Signal 0 checks the pid without delivering anything. EPERM means the pid
        // exists but belongs to another user.
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn exists(&self, pid: u32) -> bool {
        self.snapshot(pid).is_some()
    }

    fn snapshot(&self, pid: u32) -> Option<ProcessSnapshot> {
        use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

        let pid = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = sys.process(pid)?;

        let start_time = i64::try_from(process.start_time())
            .ok()
            .filter(|secs| *secs > 0)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

        Some(ProcessSnapshot {
            start_time,
            zombie: matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        })
    }
}

// ─── Classification ──────────────────────────────────────────────────────────

/// Outcome of checking one launch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The recorded process is running.
    Alive,
    /// No process at the pid, or it has exited and awaits reaping.
    Dead,
    /// A different process now owns the pid.
    Foreign,
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive)
    }
}

/// Classifies launch records against the OS process table.
pub struct LivenessClassifier {
    inspector: Box<dyn ProcessInspector>,
}

impl Default for LivenessClassifier {
    fn default() -> Self {
        Self::new(Box::new(SystemInspector))
    }
}

impl LivenessClassifier {
    pub fn new(inspector: Box<dyn ProcessInspector>) -> Self {
        Self { inspector }
    }

    /// Whether a process with this pid exists at all.
    pub fn pid_exists(&self, pid: u32) -> bool {
        self.inspector.exists(pid) && !self.is_zombie(pid)
    }

    fn is_zombie(&self, pid: u32) -> bool {
        self.inspector
            .snapshot(pid)
            .is_some_and(|snapshot| snapshot.zombie)
    }

    /// Classify one record.
    pub fn classify(&self, record: &LaunchRecord) -> Liveness {
        if !self.inspector.exists(record.pid) {
            return Liveness::Dead;
        }

        let Some(snapshot) = self.inspector.snapshot(record.pid) else {
            // Exists but no metadata: can't prove it's foreign.
            return Liveness::Alive;
        };

        if snapshot.zombie {
            return Liveness::Dead;
        }

        if let Some(started) = snapshot.start_time {
            // A reused pid belongs to a process started after ours.
            let gap = (started - record.start_time_utc).num_seconds();
            if gap > START_TIME_TOLERANCE_SECS {
                tracing::debug!(
                    server = %record.server_name,
                    pid = record.pid,
                    gap_secs = gap,
                    "pid started after the launch record, treating as reused"
                );
                return Liveness::Foreign;
            }
        }

        Liveness::Alive
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    use chrono::Duration;

    #[derive(Default)]
    struct FakeInspector {
        processes: HashMap<u32, Option<ProcessSnapshot>>,
    }

    impl FakeInspector {
        fn with(mut self, pid: u32, snapshot: Option<ProcessSnapshot>) -> Self {
            self.processes.insert(pid, snapshot);
            self
        }
    }

    impl ProcessInspector for FakeInspector {
        fn exists(&self, pid: u32) -> bool {
            self.processes.contains_key(&pid)
        }

        fn snapshot(&self, pid: u32) -> Option<ProcessSnapshot> {
            self.processes.get(&pid).cloned().flatten()
        }
    }

    fn record(pid: u32, started: DateTime<Utc>) -> LaunchRecord {
        LaunchRecord {
            server_name: "echo".into(),
            pid,
            start_time_utc: started,
            stdout_log: PathBuf::from("/tmp/o.log"),
            stderr_log: PathBuf::from("/tmp/e.log"),
            config_hash: "h".into(),
            persist: false,
            transport_kind: None,
            command: Some("python".into()),
        }
    }

    fn snapshot(started: DateTime<Utc>) -> ProcessSnapshot {
        ProcessSnapshot {
            start_time: Some(started),
            zombie: false,
        }
    }

    #[test]
    fn test_missing_pid_is_dead() {
        let classifier = LivenessClassifier::new(Box::new(FakeInspector::default()));
        assert_eq!(classifier.classify(&record(100, Utc::now())), Liveness::Dead);
    }

    #[test]
    fn test_matching_process_is_alive() {
        let now = Utc::now();
        let inspector = FakeInspector::default().with(100, Some(snapshot(now + Duration::seconds(1))));
        let classifier = LivenessClassifier::new(Box::new(inspector));
        assert!(classifier.classify(&record(100, now)).is_alive());
    }

    #[test]
    fn test_reused_pid_with_later_start_is_foreign() {
        let launched = Utc::now() - Duration::hours(3);
        let inspector = FakeInspector::default().with(100, Some(snapshot(Utc::now())));
        let classifier = LivenessClassifier::new(Box::new(inspector));
        assert_eq!(classifier.classify(&record(100, launched)), Liveness::Foreign);
    }

    #[test]
    fn test_os_start_time_slightly_early_is_alive() {
        let now = Utc::now();
        let inspector = FakeInspector::default().with(100, Some(snapshot(now - Duration::seconds(30))));
        let classifier = LivenessClassifier::new(Box::new(inspector));
        assert!(classifier.classify(&record(100, now)).is_alive());
    }

    #[test]
    fn test_zombie_is_dead() {
        let now = Utc::now();
        let mut snap = snapshot(now);
        snap.zombie = true;
        let inspector = FakeInspector::default().with(100, Some(snap));
        let classifier = LivenessClassifier::new(Box::new(inspector));
        assert_eq!(classifier.classify(&record(100, now)), Liveness::Dead);
        assert!(!classifier.pid_exists(100));
    }

    #[test]
    fn test_no_metadata_is_inconclusive_alive() {
        let inspector = FakeInspector::default().with(100, None);
        let classifier = LivenessClassifier::new(Box::new(inspector));
        assert!(classifier.classify(&record(100, Utc::now())).is_alive());
    }

    #[cfg(unix)]
    #[test]
    fn test_system_inspector_sees_own_process() {
        let inspector = SystemInspector;
        let pid = std::process::id();
        assert!(inspector.exists(pid));
        let snap = inspector.snapshot(pid).unwrap();
        assert!(!snap.zombie);
        assert!(snap.start_time.is_some());
    }
}
