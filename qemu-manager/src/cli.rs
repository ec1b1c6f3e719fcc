//! CLI-only subcommand implementations: `check` and `status`.
//!
//! Neither command starts the server. `status` reads the state file directly,
//! so it works while the daemon is running or after it has exited.

use std::path::Path;

use anyhow::Result;

use crate::config::Config;
use crate::registry::{PersistedState, VmStatus};

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `qemu-manager check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let checks = vec![
        check_binary("QEMU", &config.vm.qemu_binary, "--version", "apt install qemu-system-x86"),
        check_binary("qemu-img", &config.storage.qemu_img_binary, "--version", "apt install qemu-utils"),
        check_kvm(config.vm.enable_kvm),
        check_state_dir(config),
        check_dir("Disk directory", &config.storage.disks_dir),
        check_dir("ISO directory", &config.storage.isos_dir),
    ];

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if !c.ok {
            if let Some(fix) = &c.fix {
                println!("    Fix: {}", fix);
            }
        }
    }

    println!();
    let failed = checks.iter().filter(|c| !c.ok).count();
    if failed == 0 {
        println!("All checks passed. Run: qemu-manager serve");
        Ok(())
    } else {
        anyhow::bail!("{} check(s) failed", failed)
    }
}

fn check_binary(label: &'static str, binary: &Path, version_flag: &str, install: &str) -> Check {
    match std::process::Command::new(binary).arg(version_flag).output() {
        Ok(out) if out.status.success() => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            let version = stdout.lines().next().unwrap_or("unknown").trim().to_string();
            Check::pass(label, version)
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Check::fail(
                label,
                format!("{} exited with error: {}", binary.display(), stderr.trim()),
                format!("Install it ({}) or point the config at a working binary", install),
            )
        }
        Err(e) => Check::fail(
            label,
            format!("{} not found: {}", binary.display(), e),
            format!("Install it ({}) or point the config at a working binary", install),
        ),
    }
}

/// KVM is only required when acceleration is enabled in the config.
fn check_kvm(required: bool) -> Check {
    use std::os::unix::fs::FileTypeExt;

    let path = "/dev/kvm";
    let problem = match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_char_device() => return Check::pass("KVM device", path),
        Ok(_) => format!("{} exists but is not a character device", path),
        Err(e) => format!("{}: {}", path, e),
    };

    if required {
        Check::fail(
            "KVM device",
            problem,
            "Load the KVM kernel module (modprobe kvm_intel or kvm_amd) or set vm.enable_kvm = false",
        )
    } else {
        Check::pass("KVM device", format!("not used, {}", problem))
    }
}

fn check_state_dir(config: &Config) -> Check {
    let state_file = &config.server.state_file;
    let Some(parent) = state_file.parent() else {
        return Check::fail(
            "State directory",
            format!("state_file path {} has no parent", state_file.display()),
            "Set server.state_file to an absolute path",
        );
    };

    if !parent.exists() {
        return Check::fail(
            "State directory",
            format!("{} does not exist", parent.display()),
            format!("mkdir -p {}", parent.display()),
        );
    }

    let scratch = parent.join(".qemu-manager-check");
    match std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&scratch)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&scratch);
            Check::pass("State directory", parent.display().to_string())
        }
        Err(e) => Check::fail(
            "State directory",
            format!("{} is not writable: {}", parent.display(), e),
            format!("chmod u+w {} or run as a user with write access", parent.display()),
        ),
    }
}

fn check_dir(label: &'static str, dir: &Path) -> Check {
    if dir.is_dir() {
        return Check::pass(label, dir.display().to_string());
    }
    match std::fs::create_dir_all(dir) {
        Ok(()) => Check::pass(label, format!("{} (created)", dir.display())),
        Err(e) => Check::fail(
            label,
            format!("{} does not exist and could not be created: {}", dir.display(), e),
            format!("mkdir -p {}", dir.display()),
        ),
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

/// Run `qemu-manager status`. Informational only, always returns `Ok(())`.
pub fn run_status(config: &Config) -> Result<()> {
    let state_file = &config.server.state_file;

    if !state_file.exists() {
        println!("No state file at {}", state_file.display());
        println!("Is the server running? Try: qemu-manager serve");
        return Ok(());
    }

    let modified_ago = std::fs::metadata(state_file)
        .and_then(|meta| meta.modified())
        .map(|mtime| format_duration(mtime.elapsed().unwrap_or_default()))
        .unwrap_or_else(|_| "unknown".to_string());

    println!("State file: {} (last modified: {})\n", state_file.display(), modified_ago);

    let state = match PersistedState::read(state_file) {
        Ok(s) => s,
        Err(e) => {
            println!("Error: {:#}", e);
            return Ok(());
        }
    };

    print!("{}", render_status(&state));
    Ok(())
}

fn render_status(state: &PersistedState) -> String {
    let mut out = String::new();
    let running = state.vms.values().filter(|v| v.status == VmStatus::Running).count();
    out.push_str(&format!("VMs: {} ({} running)\n", state.vms.len(), running));

    let mut vms: Vec<_> = state.vms.values().collect();
    vms.sort_by_key(|v| v.created_at);
    for vm in vms {
        let disks = state.attachments.iter().filter(|a| a.vm_id == vm.id).count();
        let pid = vm.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "  {:<16}  {:<8}  vnc={:<5}  pid={:<8}  {} cpu, {} MiB, {} disk{}\n",
            vm.name,
            vm.status.to_string(),
            vm.vnc_port,
            pid,
            vm.cpus,
            vm.memory_mb,
            disks,
            if disks == 1 { "" } else { "s" },
        ));
    }

    out.push_str(&format!("\nDisks: {}  ISOs: {}\n", state.disks.len(), state.isos.len()));
    out
}

/// Format a duration as a human-friendly relative string (e.g. "3 seconds ago", "2 minutes ago").
fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    let (n, unit) = if secs < 60 {
        (secs, "second")
    } else if secs < 3600 {
        (secs / 60, "minute")
    } else if secs < 86400 {
        (secs / 3600, "hour")
    } else {
        (secs / 86400, "day")
    };
    if n == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", n, unit)
    }
}
