use std::path::Path;

use crate::registry::{DiskFormat, VmRecord};

/// TCP port of VNC display 0.
pub const VNC_BASE_PORT: u16 = 5900;

/// Number of disks emitted per VM. Attachments past this are left out of the
/// launch arguments and reported in [`QemuCommand::omitted_disks`].
pub const MAX_ATTACHED_DISKS: usize = 4;

/// IDE index used for the CD-ROM (secondary master).
const CDROM_IDE_INDEX: u32 = 2;

/// Host-level launch options that are not part of a VM record.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Add `-enable-kvm`.
    pub enable_kvm: bool,
}

/// Everything the composer needs to know about one VM.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub vm: &'a VmRecord,
    /// Attached disk paths in attachment order.
    pub disks: &'a [String],
    pub iso: Option<&'a str>,
}

/// Composed hypervisor arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuCommand {
    /// Argument vector, one element per argument. Never passed through a shell.
    pub args: Vec<String>,
    /// Attached disks that did not fit under [`MAX_ATTACHED_DISKS`].
    pub omitted_disks: Vec<String>,
}

impl QemuCommand {
    /// Return the full command line as a string (for logging and API responses).
    pub fn command_line(&self, binary: &Path) -> String {
        let mut parts = vec![binary.display().to_string()];
        parts.extend(self.args.iter().map(|a| {
            if a.contains(' ') || a.contains(',') {
                format!("'{}'", a)
            } else {
                a.clone()
            }
        }));
        parts.join(" ")
    }
}

/// Escape a value embedded in a QEMU `key=value,...` option string.
///
/// QEMU splits option strings on `,` and reads `,,` as a literal comma, so a
/// path containing a comma would otherwise add options to the drive.
pub(crate) fn escape_opt_value(value: &str) -> String {
    value.replace(',', ",,")
}

/// Build the QEMU argument vector for a VM.
///
/// Pure: the same spec and options always produce the same vector.
pub fn build_command(spec: LaunchSpec<'_>, opts: &LaunchOptions) -> QemuCommand {
    let vm = spec.vm;
    let mut args: Vec<String> = Vec::new();

    args.push("-name".into());
    args.push(escape_opt_value(&vm.name));

    if opts.enable_kvm {
        args.push("-enable-kvm".into());
    }

    // Memory
    args.push("-m".into());
    args.push(format!("{}", vm.memory_mb));

    // SMP (virtual CPUs)
    args.push("-smp".into());
    args.push(format!("{}", vm.cpus));

    // VNC on loopback only; the console relay is the sole client.
    args.push("-vnc".into());
    args.push(format!("127.0.0.1:{}", vm.display_offset()));

    // No interactive monitor: stdin is /dev/null.
    args.push("-monitor".into());
    args.push("none".into());

    let emitted = spec.disks.len().min(MAX_ATTACHED_DISKS);
    for (index, path) in spec.disks[..emitted].iter().enumerate() {
        let format = DiskFormat::from_path(Path::new(path)).unwrap_or(DiskFormat::Qcow2);
        args.push("-drive".into());
        args.push(format!(
            "file={},format={},if=virtio,index={}",
            escape_opt_value(path),
            format,
            index
        ));
    }
    let omitted_disks = spec.disks[emitted..].to_vec();

    if let Some(iso) = spec.iso {
        args.push("-drive".into());
        args.push(format!(
            "file={},media=cdrom,if=ide,index={},readonly=on",
            escape_opt_value(iso),
            CDROM_IDE_INDEX
        ));
    }

    // Boot order: disk, then optical, else QEMU default.
    if emitted > 0 {
        args.push("-boot".into());
        args.push("order=c".into());
    } else if spec.iso.is_some() {
        args.push("-boot".into());
        args.push("order=d".into());
    }

    QemuCommand {
        args,
        omitted_disks,
    }
}
