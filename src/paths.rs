use std::path::PathBuf;

use sha2::{Digest, Sha256};

/// Root of everything kvmprov writes: `~/.local/share/kvmprov/`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("kvmprov")
}

/// Default disk image directory: `~/.local/share/kvmprov/images/`
pub fn image_dir() -> PathBuf {
    data_dir().join("images")
}

/// Default state directory (inventory + logs): `~/.local/share/kvmprov/state/`
pub fn state_dir() -> PathBuf {
    data_dir().join("state")
}

/// Default config file: `~/.config/kvmprov/kvmprov.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join("kvmprov")
        .join("kvmprov.toml")
}

/// Inventory records live under `<state_dir>/inventory/`.
pub fn inventory_dir(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("inventory")
}

/// Daemon and per-VM logs live under `<state_dir>/logs/`.
pub fn logs_dir(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("logs")
}

/// Filesystem-safe key for a VM name: hex SHA-256 of the name.
pub fn name_key(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

/// Attempt logs for one VM: `<state_dir>/logs/vms/<name_key>/`.
pub fn vm_logs_dir(state_dir: &std::path::Path, name: &str) -> PathBuf {
    logs_dir(state_dir).join("vms").join(name_key(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_logs_stay_under_state_dir() {
        let state = std::path::Path::new("/var/lib/kvmprov");
        let dir = vm_logs_dir(state, "../../../victim");
        assert!(dir.starts_with("/var/lib/kvmprov/logs/vms"));
        assert_eq!(dir.parent(), Some(logs_dir(state).join("vms").as_path()));
        assert_eq!(name_key("vm1").len(), 64);
    }
}
