use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{VmError, VmResult};
use crate::vm::command::escape_opt_value;

/// How long to wait for the exit to be observed after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Exit of a supervised hypervisor process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    /// Exit code, `None` if killed by a signal or not our child.
    pub code: Option<i32>,
}

/// A freshly spawned process and its completion future.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: u32,
    /// Resolves once when the process exits, whatever the cause.
    pub exited: oneshot::Receiver<ProcessExit>,
}

/// Spawns, tracks and terminates hypervisor processes keyed by VM id.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Launch the hypervisor with `args`. Fails with [`VmError::SpawnFailure`]
    /// if the binary cannot be executed.
    async fn spawn(&self, vm_id: Uuid, args: &[String]) -> VmResult<SpawnedProcess>;

    /// SIGTERM, wait out the grace period, then SIGKILL. Returns once the exit
    /// has been observed. No-op for untracked or already exited VMs.
    async fn terminate(&self, vm_id: Uuid);

    /// Track a live process started by a previous manager instance.
    async fn adopt(&self, vm_id: Uuid, pid: u32) -> oneshot::Receiver<ProcessExit>;

    async fn is_tracked(&self, vm_id: Uuid) -> bool;

    /// Non-blocking liveness check. Only used for reconciliation.
    fn is_alive(&self, pid: u32) -> bool;

    /// Whether `pid` is the hypervisor launched for the VM named `vm_name`.
    /// Pids are reused, so a live pid alone does not identify a VM.
    fn is_hypervisor_for(&self, pid: u32, vm_name: &str) -> bool;
}

/// Configuration for [`QemuSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the hypervisor binary.
    pub binary: PathBuf,
    /// Time between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Directory for per-VM stderr logs. Stderr is discarded when unset.
    pub log_dir: Option<PathBuf>,
    /// Liveness polling interval for adopted processes.
    pub adopt_poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            stop_grace: Duration::from_secs(2),
            log_dir: None,
            adopt_poll_interval: Duration::from_secs(1),
        }
    }
}

struct Tracked {
    pid: u32,
    /// Flips to `true` once the exit is observed.
    exited: watch::Receiver<bool>,
}

/// [`ProcessSupervisor`] backed by real OS processes.
///
/// Each spawned child is owned by a waiter task that reaps it, drops it from
/// the map and resolves the completion future. The map lock is never held
/// across an await on the process.
pub struct QemuSupervisor {
    config: SupervisorConfig,
    procs: Arc<Mutex<HashMap<Uuid, Tracked>>>,
}

impl QemuSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            procs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open the stderr log for a VM. QEMU must not write to an unread pipe:
    /// once the 64KB buffer fills its main loop blocks.
    fn stderr_target(&self, vm_id: Uuid) -> std::process::Stdio {
        let Some(dir) = &self.config.log_dir else {
            return std::process::Stdio::null();
        };
        let path = dir.join(format!("{}-stderr.log", &vm_id.to_string()[..8]));
        let opened = std::fs::create_dir_all(dir).and_then(|_| std::fs::File::create(&path));
        match opened {
            Ok(file) => std::process::Stdio::from(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open hypervisor stderr log, discarding");
                std::process::Stdio::null()
            }
        }
    }
}

/// Remove the map entry for `vm_id` if it still belongs to `pid`.
async fn untrack(procs: &Mutex<HashMap<Uuid, Tracked>>, vm_id: Uuid, pid: u32) {
    let mut procs = procs.lock().await;
    if procs.get(&vm_id).is_some_and(|t| t.pid == pid) {
        procs.remove(&vm_id);
    }
}

#[async_trait]
impl ProcessSupervisor for QemuSupervisor {
    async fn spawn(&self, vm_id: Uuid, args: &[String]) -> VmResult<SpawnedProcess> {
        debug!(vm_id = %vm_id, binary = %self.config.binary.display(), ?args, "spawning hypervisor");

        let mut child = tokio::process::Command::new(&self.config.binary)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(self.stderr_target(vm_id))
            .spawn()
            .map_err(|e| {
                VmError::SpawnFailure(format!("{}: {}", self.config.binary.display(), e))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| VmError::SpawnFailure("process exited immediately after spawn".into()))?;

        let (exit_tx, exit_rx) = oneshot::channel();
        let (alive_tx, alive_rx) = watch::channel(false);
        self.procs.lock().await.insert(
            vm_id,
            Tracked {
                pid,
                exited: alive_rx,
            },
        );

        let procs = Arc::clone(&self.procs);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(vm_id = %vm_id, pid, error = %e, "error waiting for hypervisor exit");
                    None
                }
            };
            info!(vm_id = %vm_id, pid, exit_code = ?code, "hypervisor process exited");
            untrack(&procs, vm_id, pid).await;
            let _ = alive_tx.send(true);
            let _ = exit_tx.send(ProcessExit { pid, code });
        });

        info!(vm_id = %vm_id, pid, "hypervisor process spawned");
        Ok(SpawnedProcess {
            pid,
            exited: exit_rx,
        })
    }

    async fn terminate(&self, vm_id: Uuid) {
        let tracked = {
            let procs = self.procs.lock().await;
            procs.get(&vm_id).map(|t| (t.pid, t.exited.clone()))
        };
        let Some((pid, mut exited)) = tracked else {
            debug!(vm_id = %vm_id, "no tracked process to terminate");
            return;
        };
        if *exited.borrow() {
            return;
        }

        info!(vm_id = %vm_id, pid, "sending SIGTERM to hypervisor");
        if let Err(e) = send_signal(pid, libc::SIGTERM) {
            debug!(vm_id = %vm_id, pid, error = %e, "SIGTERM failed (process may be gone)");
        }

        let grace = self.config.stop_grace;
        if tokio::time::timeout(grace, exited.wait_for(|done| *done)).await.is_ok() {
            debug!(vm_id = %vm_id, pid, "hypervisor exited after SIGTERM");
            return;
        }

        warn!(vm_id = %vm_id, pid, ?grace, "hypervisor still running after grace period, sending SIGKILL");
        if let Err(e) = send_signal(pid, libc::SIGKILL) {
            debug!(vm_id = %vm_id, pid, error = %e, "SIGKILL failed (process may be gone)");
        }

        if tokio::time::timeout(KILL_WAIT, exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            error!(vm_id = %vm_id, pid, "hypervisor exit not observed after SIGKILL");
        }
    }

    async fn adopt(&self, vm_id: Uuid, pid: u32) -> oneshot::Receiver<ProcessExit> {
        let (exit_tx, exit_rx) = oneshot::channel();
        let (alive_tx, alive_rx) = watch::channel(false);
        self.procs.lock().await.insert(
            vm_id,
            Tracked {
                pid,
                exited: alive_rx,
            },
        );

        let procs = Arc::clone(&self.procs);
        let poll = self.config.adopt_poll_interval;
        tokio::spawn(async move {
            while process_alive(pid) {
                tokio::time::sleep(poll).await;
            }
            info!(vm_id = %vm_id, pid, "adopted hypervisor process exited");
            untrack(&procs, vm_id, pid).await;
            let _ = alive_tx.send(true);
            let _ = exit_tx.send(ProcessExit { pid, code: None });
        });

        info!(vm_id = %vm_id, pid, "adopted running hypervisor process");
        exit_rx
    }

    async fn is_tracked(&self, vm_id: Uuid) -> bool {
        self.procs.lock().await.contains_key(&vm_id)
    }

    fn is_alive(&self, pid: u32) -> bool {
        process_alive(pid)
    }

    fn is_hypervisor_for(&self, pid: u32, vm_name: &str) -> bool {
        match std::fs::read(format!("/proc/{}/cmdline", pid)) {
            Ok(raw) => cmdline_matches(&raw, &self.config.binary, vm_name),
            Err(e) => {
                debug!(pid, error = %e, "cannot read process command line");
                false
            }
        }
    }
}

/// Match a NUL-separated argv against the hypervisor launch for `vm_name`:
/// argv[0] is the configured binary (full path or file name) and the
/// arguments carry `-name <vm_name>`.
fn cmdline_matches(raw: &[u8], binary: &Path, vm_name: &str) -> bool {
    let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
    let argv: Vec<&[u8]> = raw.split(|b| *b == 0).collect();

    let argv0 = Path::new(OsStr::from_bytes(argv[0]));
    let same_binary = argv0 == binary
        || (argv0.file_name().is_some() && argv0.file_name() == binary.file_name());

    let name = escape_opt_value(vm_name);
    let named = argv
        .windows(2)
        .any(|pair| pair[0] == b"-name" && pair[1] == name.as_bytes());

    same_binary && named
}

fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    // pid 0 and negative values address process groups.
    let pid = match libc::pid_t::try_from(pid) {
        Ok(p) if p > 0 => p,
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid pid {}", pid),
            ))
        }
    };
    // SAFETY: kill(2) takes plain integers and has no memory-safety requirements.
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Signal-zero existence check. EPERM means the process exists under another user.
pub fn process_alive(pid: u32) -> bool {
    match send_signal(pid, 0) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(binary: &str, grace: Duration) -> QemuSupervisor {
        QemuSupervisor::new(SupervisorConfig {
            binary: PathBuf::from(binary),
            stop_grace: grace,
            log_dir: None,
            adopt_poll_interval: Duration::from_millis(20),
        })
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_process_alive_for_self() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn test_process_alive_rejects_group_pids() {
        assert!(!process_alive(0));
        assert!(!process_alive(u32::MAX));
    }

    #[test]
    fn test_process_alive_false_for_unused_pid() {
        // Above the kernel's pid_max ceiling.
        assert!(!process_alive(i32::MAX as u32));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_spawn_failure() {
        let sup = supervisor("/nonexistent/qemu-system-x86_64", Duration::from_secs(1));
        let err = sup.spawn(Uuid::new_v4(), &[]).await.unwrap_err();
        assert!(matches!(err, VmError::SpawnFailure(_)));
        assert_eq!(err.code(), "SPAWN_FAILURE");
    }

    #[tokio::test]
    async fn test_self_exit_resolves_completion_and_untracks() {
        let sup = supervisor("true", Duration::from_secs(1));
        let vm_id = Uuid::new_v4();
        let spawned = sup.spawn(vm_id, &[]).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), spawned.exited)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.pid, spawned.pid);
        assert_eq!(exit.code, Some(0));
        assert!(!sup.is_tracked(vm_id).await);
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let sup = supervisor("sleep", Duration::from_secs(2));
        let vm_id = Uuid::new_v4();
        let spawned = sup.spawn(vm_id, &args(&["30"])).await.unwrap();
        assert!(sup.is_alive(spawned.pid));
        assert!(sup.is_tracked(vm_id).await);

        sup.terminate(vm_id).await;

        let exit = tokio::time::timeout(Duration::from_secs(1), spawned.exited)
            .await
            .unwrap()
            .unwrap();
        // Killed by SIGTERM, so no exit code.
        assert_eq!(exit.code, None);
        assert!(!sup.is_tracked(vm_id).await);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let sup = supervisor("sh", Duration::from_millis(200));
        let vm_id = Uuid::new_v4();
        let spawned = sup
            .spawn(vm_id, &args(&["-c", "trap '' TERM; while true; do sleep 1; done"]))
            .await
            .unwrap();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        sup.terminate(vm_id).await;

        let exit = tokio::time::timeout(Duration::from_secs(1), spawned.exited)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.pid, spawned.pid);
        assert!(!sup.is_tracked(vm_id).await);
    }

    #[tokio::test]
    async fn test_terminate_untracked_is_noop() {
        let sup = supervisor("sleep", Duration::from_secs(1));
        sup.terminate(Uuid::new_v4()).await;
    }

    #[tokio::test]
    async fn test_terminate_twice_is_noop() {
        let sup = supervisor("sleep", Duration::from_secs(2));
        let vm_id = Uuid::new_v4();
        sup.spawn(vm_id, &args(&["30"])).await.unwrap();
        sup.terminate(vm_id).await;
        sup.terminate(vm_id).await;
        assert!(!sup.is_tracked(vm_id).await);
    }

    #[tokio::test]
    async fn test_adopted_process_exit_is_observed() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();

        let sup = supervisor("unused", Duration::from_secs(2));
        let vm_id = Uuid::new_v4();
        let exited = sup.adopt(vm_id, pid).await;
        assert!(sup.is_tracked(vm_id).await);

        child.kill().unwrap();
        child.wait().unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(2), exited)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ProcessExit { pid, code: None });
        assert!(!sup.is_tracked(vm_id).await);
    }

    /// Running, not a zombie waiting to be reaped.
    fn running(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| stat.rsplit_once(") ").map(|(_, rest)| !rest.starts_with('Z')))
            .unwrap_or(false)
    }

    #[test]
    fn test_spawned_process_outlives_manager_runtime() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pid = rt.block_on(async {
            let sup = supervisor("sleep", Duration::from_secs(1));
            sup.spawn(Uuid::new_v4(), &args(&["30"])).await.unwrap().pid
        });
        drop(rt);
        std::thread::sleep(Duration::from_millis(200));

        let alive = running(pid);
        send_signal(pid, libc::SIGKILL).ok();
        assert!(alive, "hypervisor {} was killed with the runtime", pid);
    }

    #[test]
    fn test_cmdline_matches_binary_and_name() {
        let bin = Path::new("/usr/bin/qemu-system-x86_64");
        let raw = b"/usr/bin/qemu-system-x86_64\0-name\0alpha\0-m\02048\0";
        assert!(cmdline_matches(raw, bin, "alpha"));
        assert!(cmdline_matches(raw, Path::new("qemu-system-x86_64"), "alpha"));
        assert!(!cmdline_matches(raw, bin, "beta"));
        assert!(!cmdline_matches(b"/usr/sbin/sshd\0-D\0", bin, "alpha"));
        // Another binary that happens to carry the same -name.
        assert!(!cmdline_matches(b"/usr/bin/sleep\0-name\0alpha\0", bin, "alpha"));

        let raw = b"qemu-system-x86_64\0-name\0a,,b\0";
        assert!(cmdline_matches(raw, bin, "a,b"));
        assert!(!cmdline_matches(b"", bin, "alpha"));
    }

    #[test]
    fn test_is_hypervisor_for_live_processes() {
        let sup = supervisor("sh", Duration::from_secs(1));
        let mut vm = std::process::Command::new("sh")
            .args(["-c", "while :; do sleep 1; done", "-name", "alpha"])
            .spawn()
            .unwrap();
        let mut other = std::process::Command::new("sleep").arg("30").spawn().unwrap();

        let matched = sup.is_hypervisor_for(vm.id(), "alpha");
        let wrong_name = sup.is_hypervisor_for(vm.id(), "beta");
        let unrelated = sup.is_hypervisor_for(other.id(), "alpha");
        let gone = sup.is_hypervisor_for(i32::MAX as u32, "alpha");

        vm.kill().unwrap();
        vm.wait().unwrap();
        other.kill().unwrap();
        other.wait().unwrap();

        assert!(matched);
        assert!(!wrong_name);
        assert!(!unrelated);
        assert!(!gone);
    }

    #[tokio::test]
    async fn test_stderr_log_written_to_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sup = QemuSupervisor::new(SupervisorConfig {
            binary: PathBuf::from("sh"),
            stop_grace: Duration::from_secs(1),
            log_dir: Some(dir.path().to_path_buf()),
            adopt_poll_interval: Duration::from_millis(20),
        });
        let vm_id = Uuid::new_v4();
        let spawned = sup
            .spawn(vm_id, &args(&["-c", "echo boom >&2"]))
            .await
            .unwrap();
        spawned.exited.await.unwrap();

        let log = dir.path().join(format!("{}-stderr.log", &vm_id.to_string()[..8]));
        let contents = std::fs::read_to_string(log).unwrap();
        assert!(contents.contains("boom"));
    }
}
