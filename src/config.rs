use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::ProvError;
use crate::paths;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub server: ServerConfig,
    #[facet(default)]
    pub storage: StorageConfig,
    #[facet(default)]
    pub limits: LimitsConfig,
    #[facet(default)]
    pub retry: RetryConfig,
    #[facet(default)]
    pub libvirt: LibvirtConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ServerConfig {
    #[facet(default = "127.0.0.1:7878")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7878".into(),
        }
    }
}

/// Empty strings mean "use the platform default under `dirs::data_local_dir()`".
#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct StorageConfig {
    #[facet(default)]
    pub image_dir: String,
    #[facet(default)]
    pub state_dir: String,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct LimitsConfig {
    #[facet(default = 128)]
    pub min_memory_mib: u64,
    #[facet(default = 262144)]
    pub max_memory_mib: u64,
    #[facet(default = 1)]
    pub min_vcpus: u32,
    #[facet(default = 64)]
    pub max_vcpus: u32,
    #[facet(default = 4096)]
    pub max_disk_gib: u64,
    #[facet(default = 8)]
    pub max_data_disks: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_memory_mib: 128,
            max_memory_mib: 262144,
            min_vcpus: 1,
            max_vcpus: 64,
            max_disk_gib: 4096,
            max_data_disks: 8,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct RetryConfig {
    /// Tries per pipeline step, including the first one.
    #[facet(default = 3)]
    pub max_attempts: u32,
    #[facet(default = 500)]
    pub initial_backoff_ms: u64,
    #[facet(default = 10000)]
    pub max_backoff_ms: u64,
    /// Upper bound for a single control-plane call.
    #[facet(default = 120)]
    pub call_timeout_s: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10000,
            call_timeout_s: 120,
        }
    }
}

impl RetryConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_s)
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct LibvirtConfig {
    /// `libvirt` drives a real hypervisor; `memory` simulates one in-process.
    #[facet(default = "libvirt")]
    pub backend: String,
    #[facet(default = "qemu:///system")]
    pub uri: String,
    #[facet(default = "kvm")]
    pub domain_type: String,
    #[facet(default = "q35")]
    pub machine: String,
    /// Host bridge used for `Bridged` VMs.
    #[facet(default = "br0")]
    pub bridge: String,
    /// Libvirt network used for `NAT` VMs.
    #[facet(default = "default")]
    pub nat_network: String,
    /// Libvirt network used for `Isolated` VMs; defined on demand.
    #[facet(default = "kvmprov-isolated")]
    pub isolated_network: String,
    /// Seconds to wait for an ACPI shutdown before forcing it.
    #[facet(default = 30)]
    pub shutdown_timeout_s: u64,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            backend: "libvirt".into(),
            uri: "qemu:///system".into(),
            domain_type: "kvm".into(),
            machine: "q35".into(),
            bridge: "br0".into(),
            nat_network: "default".into(),
            isolated_network: "kvmprov-isolated".into(),
            shutdown_timeout_s: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Libvirt,
    Memory,
}

impl Config {
    pub fn listen_addr(&self) -> Result<SocketAddr, ProvError> {
        self.server.listen.parse().map_err(|_| ProvError::Config {
            message: format!("server.listen is not a socket address: '{}'", self.server.listen),
        })
    }

    pub fn image_dir(&self) -> PathBuf {
        if self.storage.image_dir.is_empty() {
            paths::image_dir()
        } else {
            PathBuf::from(&self.storage.image_dir)
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        if self.storage.state_dir.is_empty() {
            paths::state_dir()
        } else {
            PathBuf::from(&self.storage.state_dir)
        }
    }

    pub fn backend_kind(&self) -> Result<BackendKind, ProvError> {
        match self.libvirt.backend.as_str() {
            "libvirt" => Ok(BackendKind::Libvirt),
            "memory" => Ok(BackendKind::Memory),
            other => Err(ProvError::Config {
                message: format!("libvirt.backend must be 'libvirt' or 'memory' (got '{other}')"),
            }),
        }
    }
}

// ── validation ────────────────────────────────────────────

fn invalid(message: impl Into<String>) -> ProvError {
    ProvError::Config {
        message: message.into(),
    }
}

fn validate_config(config: &Config) -> Result<(), ProvError> {
    config.listen_addr()?;
    config.backend_kind()?;

    let limits = &config.limits;
    if limits.min_memory_mib == 0 {
        return Err(invalid("limits.min_memory_mib must be at least 1"));
    }
    if limits.min_memory_mib > limits.max_memory_mib {
        return Err(invalid("limits.min_memory_mib must not exceed limits.max_memory_mib"));
    }
    if limits.min_vcpus == 0 {
        return Err(invalid("limits.min_vcpus must be at least 1"));
    }
    if limits.min_vcpus > limits.max_vcpus {
        return Err(invalid("limits.min_vcpus must not exceed limits.max_vcpus"));
    }
    if limits.max_disk_gib == 0 {
        return Err(invalid("limits.max_disk_gib must be at least 1"));
    }

    let retry = &config.retry;
    if retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts must be at least 1"));
    }
    if retry.initial_backoff_ms > retry.max_backoff_ms {
        return Err(invalid("retry.initial_backoff_ms must not exceed retry.max_backoff_ms"));
    }
    if retry.call_timeout_s == 0 {
        return Err(invalid("retry.call_timeout_s must be at least 1"));
    }
    if retry.call_timeout_s <= config.libvirt.shutdown_timeout_s {
        return Err(invalid(
            "retry.call_timeout_s must exceed libvirt.shutdown_timeout_s",
        ));
    }

    for (key, value) in [
        ("libvirt.uri", &config.libvirt.uri),
        ("libvirt.bridge", &config.libvirt.bridge),
        ("libvirt.nat_network", &config.libvirt.nat_network),
        ("libvirt.isolated_network", &config.libvirt.isolated_network),
    ] {
        if value.is_empty() {
            return Err(invalid(format!("{key} must not be empty")));
        }
    }

    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<Config, ProvError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ProvError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = facet_toml::from_str(&contents).map_err(|e| ProvError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate_config(&config)?;
    Ok(config)
}

/// Load an explicit config file, or the default one if it exists, or fall
/// back to built-in defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<Config, ProvError> {
    if let Some(path) = path {
        return load_config(path);
    }
    let default_path = paths::default_config_path();
    if default_path.exists() {
        load_config(&default_path)
    } else {
        tracing::debug!(path = %default_path.display(), "no config file, using defaults");
        Ok(Config::default())
    }
}
