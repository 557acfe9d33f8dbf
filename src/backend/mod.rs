pub mod libvirt;
pub mod memory;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{BackendKind, Config};
use crate::error::{ControlPlaneError, ProvError};
use crate::model::{DiskImage, DomainHandle, NetworkMode, ProvisionRequest};

/// What the control plane needs to define a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
    pub name: String,
    pub memory_mib: u64,
    pub vcpu_count: u32,
    pub network_mode: NetworkMode,
    pub root_disk: PathBuf,
}

impl DomainSpec {
    pub fn new(request: &ProvisionRequest, root: &DiskImage) -> Self {
        Self {
            name: request.name.clone(),
            memory_mib: request.memory_mib,
            vcpu_count: request.vcpu_count,
            network_mode: request.network_mode,
            root_disk: root.path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DomainStatus {
    Running,
    Paused,
    ShutOff,
    Crashed,
    Other,
}

/// The boundary to the hypervisor.
///
/// Implementations are idempotent where the hypervisor allows it: starting a
/// running domain or stopping a shut-off one succeeds, and creating a domain
/// that already exists with the same root disk adopts it.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_domain(&self, spec: &DomainSpec) -> Result<DomainHandle, ControlPlaneError>;

    async fn start_domain(&self, handle: &DomainHandle) -> Result<(), ControlPlaneError>;

    /// `graceful` asks the guest to power off before forcing it.
    async fn stop_domain(
        &self,
        handle: &DomainHandle,
        graceful: bool,
    ) -> Result<(), ControlPlaneError>;

    /// Power off (if needed) and undefine.
    async fn destroy_domain(&self, handle: &DomainHandle) -> Result<(), ControlPlaneError>;

    async fn domain_status(&self, handle: &DomainHandle) -> Result<DomainStatus, ControlPlaneError>;

    async fn list_domains(&self) -> Result<Vec<String>, ControlPlaneError>;

    /// Persistently attach a data disk.
    async fn attach_disk(
        &self,
        handle: &DomainHandle,
        disk: &DiskImage,
    ) -> Result<(), ControlPlaneError>;
}

pub fn create_backend(config: &Config) -> Result<Arc<dyn ControlPlane>, ProvError> {
    Ok(match config.backend_kind()? {
        BackendKind::Libvirt => Arc::new(libvirt::LibvirtBackend::new(config.libvirt.clone())),
        BackendKind::Memory => {
            tracing::warn!("using the in-memory control plane; no real VMs will be created");
            Arc::new(memory::MemoryBackend::new())
        }
    })
}
