//! Platform-specific process detachment.
//!
//! A launched server must survive the client that started it, so it is put
//! in its own session (unix) or process group (Windows) before it starts.
//! The launcher only sees the [`Detacher`] trait.

use tokio::process::Command;

/// Applies detachment to a command before it is spawned.
pub trait Detacher: Send + Sync {
    fn detach(&self, command: &mut Command);

    /// Whether detached children lead their own process group, so the whole
    /// group can be signalled by the leader's pid.
    fn leads_process_group(&self) -> bool;
}

/// The detachment strategy for the compilation target.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformDetacher;

#[cfg(unix)]
impl Detacher for PlatformDetacher {
    fn detach(&self, command: &mut Command) {
        // SAFETY: the closure only calls setsid(2), which is async-signal-safe
        // and runs in the forked child before exec.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(std::io::Error::from)
            });
        }
    }

    fn leads_process_group(&self) -> bool {
        true
    }
}

#[cfg(windows)]
impl Detacher for PlatformDetacher {
    fn detach(&self, command: &mut Command) {
        // No sessions on Windows: a new process group separates the child from
        // the parent's console signals, and no console window is created.
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    }

    fn leads_process_group(&self) -> bool {
        false
    }
}

#[cfg(not(any(unix, windows)))]
impl Detacher for PlatformDetacher {
    fn detach(&self, _command: &mut Command) {}

    fn leads_process_group(&self) -> bool {
        false
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detached_child_gets_its_own_session() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("sleep 5");
        cmd.stdin(std::process::Stdio::null());
        PlatformDetacher.detach(&mut cmd);

        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap() as i32;

        let child_pid = nix::unistd::Pid::from_raw(pid);
        let sid = nix::unistd::getsid(Some(child_pid)).unwrap();
        let our_sid = nix::unistd::getsid(None).unwrap();
        assert_eq!(sid, child_pid);
        assert_ne!(sid, our_sid);

        child.kill().await.unwrap();
    }
}
