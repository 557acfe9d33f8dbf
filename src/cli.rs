use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::model::{NetworkMode, ProvisionRequest};

#[derive(Parser, Debug)]
#[command(name = "kvmprov", about = "Declarative KVM virtual machine provisioning via libvirt")]
pub struct Cli {
    /// Path to config file (default: ~/.config/kvmprov/kvmprov.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Address of a running `kvmprov serve` (overrides server.listen)
    #[arg(long, env = "KVMPROV_SERVER", global = true)]
    pub server: Option<String>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the provisioning service
    Serve,

    /// Submit a provisioning request
    Create {
        name: String,

        /// Memory in MiB
        #[arg(long)]
        memory: u64,

        /// Number of virtual CPUs
        #[arg(long)]
        vcpus: u32,

        /// Root disk size in GiB
        #[arg(long)]
        disk: u64,

        /// Image to clone the root disk from
        #[arg(long)]
        image: Option<PathBuf>,

        /// bridged, nat or isolated
        #[arg(long, default_value = "nat")]
        network: NetworkMode,

        /// Extra blank data disk in GiB (repeatable)
        #[arg(long = "data-disk")]
        data_disks: Vec<u64>,

        /// Wait until the attempt settles
        #[arg(long)]
        wait: bool,
    },

    /// Show one VM's record
    Status { name: String },

    /// List all VMs
    List,

    /// Stop a running VM
    Stop {
        name: String,

        /// Power off without an ACPI shutdown
        #[arg(long)]
        force: bool,
    },

    /// Start a stopped VM
    Start { name: String },

    /// Tear down a VM and everything it owns
    Delete {
        name: String,

        /// Wait until the VM is gone
        #[arg(long)]
        wait: bool,
    },

    /// Cancel a provisioning attempt in progress
    Cancel { name: String },

    /// Print the latest attempt or operation log for a VM
    Log { name: String },

    /// Validate the config file and print the effective settings
    CheckConfig,
}

impl Command {
    /// The request described by `create` arguments.
    pub fn provision_request(&self) -> Option<ProvisionRequest> {
        match self {
            Command::Create {
                name,
                memory,
                vcpus,
                disk,
                image,
                network,
                data_disks,
                ..
            } => Some(ProvisionRequest {
                name: name.clone(),
                memory_mib: *memory,
                vcpu_count: *vcpus,
                disk_size_gib: *disk,
                image_source_path: image.clone(),
                network_mode: *network,
                data_disks_gib: data_disks.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_builds_a_request() {
        let cli = Cli::parse_from([
            "kvmprov", "create", "vm1", "--memory", "2048", "--vcpus", "2", "--disk", "20",
            "--network", "bridged", "--data-disk", "5", "--data-disk", "10",
        ]);
        let request = cli.command.provision_request().unwrap();
        assert_eq!(request.name, "vm1");
        assert_eq!(request.memory_mib, 2048);
        assert_eq!(request.network_mode, NetworkMode::Bridged);
        assert_eq!(request.data_disks_gib, vec![5, 10]);
        assert!(request.image_source_path.is_none());
    }

    #[test]
    fn network_defaults_to_nat() {
        let cli = Cli::parse_from([
            "kvmprov", "create", "vm1", "--memory", "512", "--vcpus", "1", "--disk", "4",
        ]);
        let request = cli.command.provision_request().unwrap();
        assert_eq!(request.network_mode, NetworkMode::Nat);
    }

    #[test]
    fn unknown_network_is_rejected() {
        let result = Cli::try_parse_from([
            "kvmprov", "create", "vm1", "--memory", "512", "--vcpus", "1", "--disk", "4",
            "--network", "wifi",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from(["kvmprov", "list", "--json", "--server", "10.0.0.1:7878"]);
        assert!(cli.json);
        assert_eq!(cli.server.as_deref(), Some("10.0.0.1:7878"));
        assert!(cli.command.provision_request().is_none());
    }
}
