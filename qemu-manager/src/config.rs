use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::vm::command::{LaunchOptions, VNC_BASE_PORT};
use crate::vm::supervisor::SupervisorConfig;
use crate::vm::VmManagerConfig;

/// Top-level configuration for the qemu-manager daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub vm: VmConfig,
    pub storage: StorageConfig,
    pub console: ConsoleConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` if given (defaults otherwise), apply environment
    /// overrides, then validate.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the deployment environment variables on top of the file values.
    ///
    /// `PORT`, `QEMU_BIN`, `QEMU_IMG_BIN`, `DISKS_STORAGE_PATH`, `ISO_STORAGE_PATH`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {}", port))?;
        }
        if let Some(bin) = lookup("QEMU_BIN") {
            self.vm.qemu_binary = PathBuf::from(bin);
        }
        if let Some(bin) = lookup("QEMU_IMG_BIN") {
            self.storage.qemu_img_binary = PathBuf::from(bin);
        }
        if let Some(dir) = lookup("DISKS_STORAGE_PATH") {
            self.storage.disks_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("ISO_STORAGE_PATH") {
            self.storage.isos_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.server.port != 0, "server.port must not be 0");
        anyhow::ensure!(self.vm.default_cpus >= 1, "vm.default_cpus must be >= 1");
        anyhow::ensure!(
            self.vm.default_memory_mb >= 16,
            "vm.default_memory_mb must be >= 16"
        );
        anyhow::ensure!(
            self.console.port_min >= VNC_BASE_PORT,
            "console.port_min must be >= {}",
            VNC_BASE_PORT
        );
        anyhow::ensure!(
            self.console.port_min <= self.console.port_max,
            "console.port_min must be <= console.port_max"
        );
        anyhow::ensure!(
            self.console.connect_timeout_secs >= 1,
            "console.connect_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.storage.default_disk_size_gb >= 1,
            "storage.default_disk_size_gb must be >= 1"
        );
        Ok(())
    }

    pub fn vm_manager_config(&self) -> VmManagerConfig {
        VmManagerConfig {
            qemu_binary: self.vm.qemu_binary.clone(),
            launch: LaunchOptions {
                enable_kvm: self.vm.enable_kvm,
            },
            console_port_min: self.console.port_min,
            console_port_max: self.console.port_max,
            default_cpus: self.vm.default_cpus,
            default_memory_mb: self.vm.default_memory_mb,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            binary: self.vm.qemu_binary.clone(),
            stop_grace: Duration::from_secs(self.vm.stop_grace_secs),
            log_dir: self.vm.log_dir.clone(),
            adopt_poll_interval: Duration::from_secs(1),
        }
    }
}

/// HTTP server and daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Path of the persisted registry.
    pub state_file: PathBuf,
    /// CORS origins. Empty allows any origin.
    pub allowed_origins: Vec<String>,
    /// Stop running VMs when the daemon shuts down.
    pub stop_vms_on_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 5000,
            state_file: PathBuf::from("/var/lib/qemu-manager/state.json"),
            allowed_origins: Vec::new(),
            stop_vms_on_shutdown: true,
        }
    }
}

/// Hypervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Path to the qemu-system binary.
    pub qemu_binary: PathBuf,
    /// Pass `-enable-kvm` to every VM.
    pub enable_kvm: bool,
    pub default_cpus: u32,
    pub default_memory_mb: u32,
    /// Seconds between SIGTERM and SIGKILL on stop.
    pub stop_grace_secs: u64,
    /// Directory for per-VM hypervisor stderr logs.
    pub log_dir: Option<PathBuf>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            qemu_binary: PathBuf::from("qemu-system-x86_64"),
            enable_kvm: false,
            default_cpus: 2,
            default_memory_mb: 2048,
            stop_grace_secs: 2,
            log_dir: Some(PathBuf::from("/tmp/qemu-vms")),
        }
    }
}

/// Disk and ISO storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub qemu_img_binary: PathBuf,
    pub disks_dir: PathBuf,
    pub isos_dir: PathBuf,
    pub default_disk_size_gb: u64,
    /// Register unknown image files found in the storage directories at startup.
    pub scan_on_startup: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            qemu_img_binary: PathBuf::from("qemu-img"),
            disks_dir: PathBuf::from("/tmp/qemu-disks"),
            isos_dir: PathBuf::from("/tmp/qemu-isos"),
            default_disk_size_gb: 20,
            scan_on_startup: true,
        }
    }
}

/// VNC console configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Inclusive range VNC ports are assigned from.
    pub port_min: u16,
    pub port_max: u16,
    pub connect_timeout_secs: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            port_min: VNC_BASE_PORT,
            port_max: VNC_BASE_PORT + 99,
            connect_timeout_secs: 5,
        }
    }
}

impl ConsoleConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.vm.default_cpus, 2);
        assert_eq!(config.vm.default_memory_mb, 2048);
        assert_eq!(config.storage.default_disk_size_gb, 20);
        assert_eq!(config.storage.disks_dir, PathBuf::from("/tmp/qemu-disks"));
        assert_eq!(config.console.port_min, 5900);
        assert_eq!(config.console.port_max, 5999);
        assert_eq!(config.console.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn config_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn config_load_from_toml() {
        let toml_content = r#"
[server]
port = 8080

[vm]
qemu_binary = "/opt/qemu/bin/qemu-system-x86_64"
enable_kvm = true

[console]
port_min = 5910
port_max = 5919
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.vm.enable_kvm);
        assert_eq!(config.console.port_min, 5910);
        // Unset fields use defaults
        assert_eq!(config.server.bind_addr, "0.0.0.0");
        assert_eq!(config.vm.default_memory_mb, 2048);
        assert_eq!(config.storage.qemu_img_binary, PathBuf::from("qemu-img"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = [
            ("PORT", "7000"),
            ("QEMU_BIN", "/usr/local/bin/qemu"),
            ("QEMU_IMG_BIN", "/usr/local/bin/qemu-img"),
            ("DISKS_STORAGE_PATH", "/srv/disks"),
            ("ISO_STORAGE_PATH", "/srv/isos"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.vm.qemu_binary, PathBuf::from("/usr/local/bin/qemu"));
        assert_eq!(config.storage.qemu_img_binary, PathBuf::from("/usr/local/bin/qemu-img"));
        assert_eq!(config.storage.disks_dir, PathBuf::from("/srv/disks"));
        assert_eq!(config.storage.isos_dir, PathBuf::from("/srv/isos"));
    }

    #[test]
    fn env_override_rejects_bad_port() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(|k| (k == "PORT").then(|| "web".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn validation_rejects_inverted_port_range() {
        let mut config = Config::default();
        config.console.port_min = 5950;
        config.console.port_max = 5940;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_port_below_vnc_base() {
        let mut config = Config::default();
        config.console.port_min = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_cpus() {
        let mut config = Config::default();
        config.vm.default_cpus = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_component_configs() {
        let mut config = Config::default();
        config.vm.enable_kvm = true;
        config.vm.stop_grace_secs = 3;

        let vm = config.vm_manager_config();
        assert!(vm.launch.enable_kvm);
        assert_eq!(vm.console_port_max, 5999);

        let sup = config.supervisor_config();
        assert_eq!(sup.stop_grace, Duration::from_secs(3));
        assert_eq!(sup.binary, PathBuf::from("qemu-system-x86_64"));
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.server.port, config.server.port);
        assert_eq!(back.vm.log_dir, config.vm.log_dir);
    }
}
