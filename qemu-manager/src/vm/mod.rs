pub mod command;
pub mod supervisor;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{VmError, VmResult};
use crate::registry::{Registry, VmRecord, VmStatus};
use crate::vm::command::{LaunchOptions, LaunchSpec};
use crate::vm::supervisor::{ProcessExit, ProcessSupervisor};

/// Configuration for the VM lifecycle manager.
#[derive(Debug, Clone)]
pub struct VmManagerConfig {
    /// Hypervisor binary, used to render the reported command line.
    pub qemu_binary: PathBuf,
    pub launch: LaunchOptions,
    /// Inclusive range VNC ports are drawn from.
    pub console_port_min: u16,
    pub console_port_max: u16,
    pub default_cpus: u32,
    pub default_memory_mb: u32,
}

impl Default for VmManagerConfig {
    fn default() -> Self {
        Self {
            qemu_binary: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            launch: LaunchOptions::default(),
            console_port_min: command::VNC_BASE_PORT,
            console_port_max: command::VNC_BASE_PORT + 99,
            default_cpus: 2,
            default_memory_mb: 2048,
        }
    }
}

/// Per-VM async mutexes. Every mutation of one VM (lifecycle, attachments,
/// exit handling) runs under that VM's lock; different VMs never contend.
#[derive(Default)]
pub struct VmLocks {
    inner: std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl VmLocks {
    /// Lock for `id`, created on first use.
    pub fn get(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(id).or_default())
    }

    /// Lock for `id` only if one was created and not removed since.
    pub fn existing(&self, id: Uuid) -> Option<Arc<Mutex<()>>> {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(&id).cloned()
    }

    pub fn remove(&self, id: Uuid) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(&id);
    }

    /// Take the lock for `id` and load the VM under it.
    ///
    /// When no such VM exists the entry is pruned again, so requests for
    /// unknown ids leave nothing behind.
    pub async fn lock_vm(
        &self,
        registry: &dyn Registry,
        id: Uuid,
    ) -> VmResult<(OwnedMutexGuard<()>, VmRecord)> {
        let guard = self.get(id).lock_owned().await;
        let loaded = registry.get_vm(id).await;
        match loaded {
            Ok(Some(vm)) => Ok((guard, vm)),
            Ok(None) => {
                drop(guard);
                self.prune(id);
                Err(VmError::vm_not_found(id))
            }
            Err(e) => {
                drop(guard);
                self.prune(id);
                Err(e.into())
            }
        }
    }

    /// Drop the entry for `id` unless another task still holds or awaits it.
    fn prune(&self, id: Uuid) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(&id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(&id);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Parameters for creating a new VM.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateParams {
    pub name: String,
    pub cpus: Option<u32>,
    #[serde(alias = "memory")]
    pub memory_mb: Option<u32>,
}

/// Partial resource update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceUpdate {
    pub cpus: Option<u32>,
    #[serde(alias = "memory")]
    pub memory_mb: Option<u32>,
}

/// A VM record enriched with its attached disk paths.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmView {
    #[serde(flatten)]
    pub vm: VmRecord,
    pub disks: Vec<String>,
}

/// Result of a successful start.
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub vm: VmView,
    /// The launched command line, for display.
    pub command: String,
    /// Attachments left out of the launch by the disk cap.
    pub omitted_disks: Vec<String>,
}

/// Counts from startup reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Running records whose process was gone, now stopped.
    pub stopped: usize,
    /// Running records whose process was still alive, now supervised.
    pub adopted: usize,
}

/// VM lifecycle state machine (stopped <-> running).
///
/// Composes launch arguments, delegates process handling to the
/// [`ProcessSupervisor`] and persists every transition through the
/// [`Registry`] before returning.
pub struct VmManager {
    config: VmManagerConfig,
    registry: Arc<dyn Registry>,
    supervisor: Arc<dyn ProcessSupervisor>,
    locks: Arc<VmLocks>,
    /// Serializes creation so name and port checks are atomic with insertion.
    create_lock: Mutex<()>,
}

impl VmManager {
    pub fn new(
        config: VmManagerConfig,
        registry: Arc<dyn Registry>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        Self {
            config,
            registry,
            supervisor,
            locks: Arc::new(VmLocks::default()),
            create_lock: Mutex::new(()),
        }
    }

    /// Per-VM locks, shared with the attachment tracker.
    pub fn locks(&self) -> Arc<VmLocks> {
        Arc::clone(&self.locks)
    }

    async fn load(&self, id: Uuid) -> VmResult<VmRecord> {
        self.registry
            .get_vm(id)
            .await?
            .ok_or_else(|| VmError::vm_not_found(id))
    }

    async fn view(&self, vm: VmRecord) -> VmResult<VmView> {
        let disks = self.registry.vm_disks(vm.id).await?;
        Ok(VmView { vm, disks })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: Uuid) -> VmResult<VmView> {
        let vm = self.load(id).await?;
        self.view(vm).await
    }

    /// All VMs, newest first, each with its attachments.
    pub async fn list(&self) -> VmResult<Vec<VmView>> {
        let vms = self.registry.list_vms().await?;
        let mut by_vm: HashMap<Uuid, Vec<String>> = HashMap::new();
        for edge in self.registry.list_attachments().await? {
            by_vm.entry(edge.vm_id).or_default().push(edge.disk_path);
        }
        Ok(vms
            .into_iter()
            .map(|vm| {
                let disks = by_vm.remove(&vm.id).unwrap_or_default();
                VmView { vm, disks }
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register a new stopped VM with a free console port.
    #[instrument(skip(self, params), fields(name = %params.name))]
    pub async fn create(&self, params: CreateParams) -> VmResult<VmView> {
        let name = params.name.trim();
        if name.is_empty() {
            return Err(VmError::InvalidArgument("name must not be empty".into()));
        }
        if name.chars().any(char::is_control) {
            return Err(VmError::InvalidArgument(
                "name must not contain control characters".into(),
            ));
        }
        let cpus = params.cpus.unwrap_or(self.config.default_cpus);
        let memory_mb = params.memory_mb.unwrap_or(self.config.default_memory_mb);
        validate_resources(cpus, memory_mb)?;

        let _guard = self.create_lock.lock().await;
        let existing = self.registry.list_vms().await?;
        if existing.iter().any(|v| v.name == name) {
            return Err(VmError::duplicate_name(name));
        }
        let port = self.pick_console_port(&existing)?;

        let vm = VmRecord::new(name, cpus, memory_mb, port);
        self.registry.insert_vm(&vm).await?;

        info!(vm_id = %vm.id, cpus, memory_mb, vnc_port = port, "VM created");
        Ok(VmView {
            vm,
            disks: Vec::new(),
        })
    }

    /// Draw a random port from the configured range that no VM holds.
    fn pick_console_port(&self, existing: &[VmRecord]) -> VmResult<u16> {
        let (min, max) = (self.config.console_port_min, self.config.console_port_max);
        let used: HashSet<u16> = existing.iter().map(|v| v.vnc_port).collect();
        let free: Vec<u16> = (min..=max).filter(|p| !used.contains(p)).collect();
        free.choose(&mut rand::thread_rng())
            .copied()
            .ok_or(VmError::NoFreeConsolePort { min, max })
    }

    /// Launch the hypervisor for a stopped VM.
    #[instrument(skip(self))]
    pub async fn start(&self, id: Uuid) -> VmResult<StartOutcome> {
        let (_guard, mut vm) = self.locks.lock_vm(self.registry.as_ref(), id).await?;
        if vm.is_running() {
            return Err(VmError::InvalidState(format!(
                "VM '{}' is already running",
                vm.name
            )));
        }

        let disks = self.registry.vm_disks(id).await?;
        let cmd = command::build_command(
            LaunchSpec {
                vm: &vm,
                disks: &disks,
                iso: vm.iso.as_deref(),
            },
            &self.config.launch,
        );
        if !cmd.omitted_disks.is_empty() {
            warn!(
                vm_id = %id,
                limit = command::MAX_ATTACHED_DISKS,
                omitted = ?cmd.omitted_disks,
                "too many attached disks, extra disks left out of launch"
            );
        }
        let command_line = cmd.command_line(&self.config.qemu_binary);
        debug!(vm_id = %id, command = %command_line, "launching VM");

        // A spawn failure returns here with the record untouched (stopped).
        let spawned = self.supervisor.spawn(id, &cmd.args).await?;

        vm.mark_running(spawned.pid);
        if let Err(e) = self.registry.update_vm(&vm).await {
            error!(vm_id = %id, pid = spawned.pid, error = %e, "failed to persist running state, killing hypervisor");
            self.supervisor.terminate(id).await;
            return Err(e.into());
        }
        self.watch_exit(id, spawned.exited);

        info!(vm_id = %id, pid = spawned.pid, vnc_port = vm.vnc_port, "VM started");
        Ok(StartOutcome {
            vm: VmView { vm, disks },
            command: command_line,
            omitted_disks: cmd.omitted_disks,
        })
    }

    /// Terminate the hypervisor and persist the stopped state.
    ///
    /// Succeeds for a VM that is already stopped.
    #[instrument(skip(self))]
    pub async fn stop(&self, id: Uuid) -> VmResult<VmView> {
        let (_guard, mut vm) = self.locks.lock_vm(self.registry.as_ref(), id).await?;
        self.supervisor.terminate(id).await;

        if vm.is_running() || vm.pid.is_some() {
            vm.mark_stopped();
            self.registry.update_vm(&vm).await?;
            info!(vm_id = %id, "VM stopped");
        } else {
            debug!(vm_id = %id, "VM already stopped");
        }
        self.view(vm).await
    }

    /// Change cpus and/or memory of a stopped VM.
    #[instrument(skip(self))]
    pub async fn update_resources(&self, id: Uuid, update: ResourceUpdate) -> VmResult<VmView> {
        let (_guard, mut vm) = self.locks.lock_vm(self.registry.as_ref(), id).await?;
        if vm.is_running() {
            return Err(VmError::InvalidState(format!(
                "cannot change resources of running VM '{}'; stop it first",
                vm.name
            )));
        }

        let cpus = update.cpus.unwrap_or(vm.cpus);
        let memory_mb = update.memory_mb.unwrap_or(vm.memory_mb);
        validate_resources(cpus, memory_mb)?;

        if cpus != vm.cpus || memory_mb != vm.memory_mb {
            vm.cpus = cpus;
            vm.memory_mb = memory_mb;
            self.registry.update_vm(&vm).await?;
            info!(vm_id = %id, cpus, memory_mb, "VM resources updated");
        }
        self.view(vm).await
    }

    /// Stop the VM if running, then remove its attachments and record.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> VmResult<()> {
        let (guard, vm) = self.locks.lock_vm(self.registry.as_ref(), id).await?;
        if vm.is_running() {
            self.supervisor.terminate(id).await;
        }
        self.registry.delete_vm_disks(id).await?;
        self.registry.delete_vm(id).await?;

        drop(guard);
        self.locks.remove(id);
        info!(vm_id = %id, name = %vm.name, "VM deleted");
        Ok(())
    }

    /// Stop every running VM. Used on daemon shutdown.
    pub async fn shutdown_all(&self) -> usize {
        let vms = match self.registry.list_vms().await {
            Ok(vms) => vms,
            Err(e) => {
                error!(error = %e, "cannot list VMs for shutdown");
                return 0;
            }
        };

        let mut stopped = 0;
        for vm in vms.into_iter().filter(VmRecord::is_running) {
            match self.stop(vm.id).await {
                Ok(_) => stopped += 1,
                Err(e) => warn!(vm_id = %vm.id, error = %e, "failed to stop VM during shutdown"),
            }
        }
        stopped
    }

    // -----------------------------------------------------------------------
    // Process exit handling
    // -----------------------------------------------------------------------

    /// Correct the registry after a crash or restart of the manager.
    ///
    /// Running records whose pid is absent or dead become stopped; live ones
    /// are adopted so their exit is observed and `stop` can terminate them.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> VmResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for vm in self.registry.list_vms().await? {
            // Re-read under the lock; deleted since the listing means skip.
            let (_guard, mut vm) = match self.locks.lock_vm(self.registry.as_ref(), vm.id).await {
                Ok(locked) => locked,
                Err(VmError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            match (vm.status, vm.pid) {
                (VmStatus::Running, Some(pid))
                    if self.supervisor.is_alive(pid)
                        && self.supervisor.is_hypervisor_for(pid, &vm.name) =>
                {
                    let exited = self.supervisor.adopt(vm.id, pid).await;
                    self.watch_exit(vm.id, exited);
                    report.adopted += 1;
                    info!(vm_id = %vm.id, pid, "VM process still alive, adopted");
                }
                (VmStatus::Running, Some(pid)) if self.supervisor.is_alive(pid) => {
                    warn!(vm_id = %vm.id, pid, "pid now belongs to another process, marking stopped");
                    vm.mark_stopped();
                    self.registry.update_vm(&vm).await?;
                    report.stopped += 1;
                }
                (VmStatus::Running, pid) => {
                    warn!(vm_id = %vm.id, ?pid, "VM process not alive, marking stopped");
                    vm.mark_stopped();
                    self.registry.update_vm(&vm).await?;
                    report.stopped += 1;
                }
                (VmStatus::Stopped, Some(pid)) => {
                    debug!(vm_id = %vm.id, pid, "clearing stale pid on stopped VM");
                    vm.mark_stopped();
                    self.registry.update_vm(&vm).await?;
                }
                (VmStatus::Stopped, None) => {}
            }
        }

        info!(stopped = report.stopped, adopted = report.adopted, "reconciliation complete");
        Ok(report)
    }

    /// Spawn a task that records the process exit once it resolves.
    fn watch_exit(&self, vm_id: Uuid, exited: oneshot::Receiver<ProcessExit>) {
        let registry = Arc::clone(&self.registry);
        let locks = Arc::clone(&self.locks);
        tokio::spawn(async move {
            let Ok(exit) = exited.await else {
                debug!(vm_id = %vm_id, "exit channel closed without a result");
                return;
            };
            if let Err(e) = record_exit(registry.as_ref(), &locks, vm_id, exit).await {
                error!(vm_id = %vm_id, error = %e, "failed to record VM exit");
            }
        });
    }
}

/// Mark the VM stopped if `exit` belongs to its current process.
///
/// Dropped when the VM was deleted or has been restarted with a new pid.
pub(crate) async fn record_exit(
    registry: &dyn Registry,
    locks: &VmLocks,
    vm_id: Uuid,
    exit: ProcessExit,
) -> VmResult<()> {
    let Some(lock) = locks.existing(vm_id) else {
        debug!(vm_id = %vm_id, pid = exit.pid, "exit for deleted VM dropped");
        return Ok(());
    };
    let _guard = lock.lock().await;

    let Some(mut vm) = registry.get_vm(vm_id).await? else {
        debug!(vm_id = %vm_id, pid = exit.pid, "exit for deleted VM dropped");
        return Ok(());
    };
    if vm.pid != Some(exit.pid) {
        debug!(vm_id = %vm_id, pid = exit.pid, current = ?vm.pid, "stale exit ignored");
        return Ok(());
    }

    warn!(vm_id = %vm_id, pid = exit.pid, exit_code = ?exit.code, "hypervisor exited unexpectedly, marking VM stopped");
    vm.mark_stopped();
    registry.update_vm(&vm).await?;
    Ok(())
}

fn validate_resources(cpus: u32, memory_mb: u32) -> VmResult<()> {
    if cpus == 0 {
        return Err(VmError::InvalidArgument("cpus must be at least 1".into()));
    }
    if memory_mb == 0 {
        return Err(VmError::InvalidArgument("memory must be at least 1 MB".into()));
    }
    Ok(())
}
