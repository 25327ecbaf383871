use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

pub mod mcp_client;

pub use mcp_client::{
    ClientSettings, ConnectionHandle, LifecycleError, MultiServerClient, ServersConfig,
};

/// Return the platform-standard data directory for mcp-multi-server.
///
/// - macOS: `~/Library/Application Support/mcp-multi-server/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-multi-server\`
/// - Linux: `$XDG_DATA_HOME/mcp-multi-server/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-multi-server/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-multi-server");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-multi-server")
}

/// Rotated generations of `client.log` kept next to the live file.
const LOG_GENERATIONS: u32 = 3;

/// Initialize the tracing subscriber, writing to `client.log` in `log_dir`.
///
/// The previous session's log becomes `client.log.1`, older ones shift up,
/// and anything past `client.log.3` is dropped. `RUST_LOG` overrides the
/// default filter. Fails if the log file can't be opened or a global
/// subscriber is already installed.
///
/// Returns the path of the fresh log file.
pub fn init_tracing(log_dir: &Path) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join("client.log");
    shift_generations(&log_path, LOG_GENERATIONS);

    let file = OpenOptions::new().create(true).append(true).open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_multi_server=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(SessionLog::new(file))
        .with_ansi(false)
        .with_target(true)
        .try_init()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        log_file = %log_path.display(),
        "client log opened"
    );

    Ok(log_path)
}

/// `base` with a generation suffix, e.g. `client.log.2`.
fn generation_path(base: &Path, generation: u32) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}

/// Move `base` to generation 1, shifting older generations up by one.
///
/// The file in the last generation is discarded. Gaps are fine.
fn shift_generations(base: &Path, generations: u32) {
    if generations == 0 {
        let _ = std::fs::remove_file(base);
        return;
    }
    let _ = std::fs::remove_file(generation_path(base, generations));

    for generation in (1..=generations).rev() {
        let from = match generation {
            1 => base.to_path_buf(),
            n => generation_path(base, n - 1),
        };
        if from.exists() {
            let _ = std::fs::rename(&from, generation_path(base, generation));
        }
    }
}

/// The open `client.log`, shared by every event the subscriber writes.
///
/// Each write reaches the file before returning, so a client killed during
/// a stop still leaves its last lines behind.
#[derive(Clone)]
struct SessionLog {
    file: Arc<Mutex<File>>,
}

impl SessionLog {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn with_file<T>(&self, op: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("client log lock poisoned"))?;
        op(&mut file)
    }
}

impl Write for SessionLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| {
            file.write_all(buf)?;
            file.flush()?;
            Ok(buf.len())
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}

impl<'a> MakeWriter<'a> for SessionLog {
    type Writer = SessionLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shift_generations_drops_oldest() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("client.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(tmp.path().join("client.log.1"), "one").unwrap();
        std::fs::write(tmp.path().join("client.log.2"), "two").unwrap();
        std::fs::write(tmp.path().join("client.log.3"), "three").unwrap();

        shift_generations(&base, 3);

        assert!(!base.exists());
        let read = |n: u32| std::fs::read_to_string(tmp.path().join(format!("client.log.{n}"))).unwrap();
        assert_eq!(read(1), "current");
        assert_eq!(read(2), "one");
        assert_eq!(read(3), "two");
    }

    #[test]
    fn test_shift_generations_with_gaps() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("client.log");
        std::fs::write(&base, "current").unwrap();

        shift_generations(&base, 3);

        assert_eq!(
            std::fs::read_to_string(tmp.path().join("client.log.1")).unwrap(),
            "current"
        );
        assert!(!tmp.path().join("client.log.2").exists());
    }

    #[test]
    fn test_session_log_writes_through() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.log");
        let file = File::create(&path).unwrap();
        let mut writer = SessionLog::new(file);

        writer.write_all(b"line one\n").unwrap();
        let mut clone = writer.clone();
        clone.write_all(b"line two\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\nline two\n");
    }

    #[test]
    fn test_init_tracing_creates_log_and_refuses_second_init() {
        let tmp = TempDir::new().unwrap();
        let log_dir = tmp.path().join("logs");

        let path = init_tracing(&log_dir).unwrap();
        assert_eq!(path, log_dir.join("client.log"));
        assert!(path.exists());

        // A global subscriber is already installed.
        assert!(init_tracing(&log_dir).is_err());
    }

    #[test]
    fn test_data_dir_is_named_for_the_crate() {
        let dir = data_dir();
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("mcp-multi-server"));
    }
}
