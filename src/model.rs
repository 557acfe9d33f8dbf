//! Request and record types shared by the store, the orchestrator and the API.
//!
//! Field names serialize in the camelCase wire format used by the HTTP API and
//! the persisted inventory (`memoryMiB`, `lastError`, ...).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vm_state::VmState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    #[serde(alias = "bridged")]
    Bridged,
    #[serde(rename = "NAT", alias = "nat", alias = "Nat")]
    Nat,
    #[serde(alias = "isolated")]
    Isolated,
}

impl std::str::FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bridged" => Ok(NetworkMode::Bridged),
            "nat" => Ok(NetworkMode::Nat),
            "isolated" => Ok(NetworkMode::Isolated),
            other => Err(format!(
                "unknown network mode '{other}' (use bridged, nat or isolated)"
            )),
        }
    }
}

/// What currently owns a record while `inProgress` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Provision,
    Stop,
    Start,
    Delete,
}

/// A declarative request to create one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub name: String,
    #[serde(rename = "memoryMiB")]
    pub memory_mib: u64,
    pub vcpu_count: u32,
    #[serde(rename = "diskSizeGiB")]
    pub disk_size_gib: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_source_path: Option<PathBuf>,
    pub network_mode: NetworkMode,
    /// Blank data disks attached after the root disk (vdb, vdc, ...).
    #[serde(rename = "dataDisksGiB", default, skip_serializing_if = "Vec::is_empty")]
    pub data_disks_gib: Vec<u64>,
}

/// A control-plane domain owned by a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainHandle {
    pub name: String,
    pub uuid: String,
}

/// A disk image written for a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskImage {
    pub path: PathBuf,
    #[serde(rename = "sizeGiB")]
    pub size_gib: u64,
    /// Guest device name, e.g. `vda`.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_source: Option<PathBuf>,
    /// SHA-256 of the backing source at clone time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// The inventory's view of one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    pub name: String,
    pub request: ProvisionRequest,
    pub state: VmState,
    pub last_error: Option<String>,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set while an attempt or lifecycle operation owns the record.
    #[serde(default)]
    pub in_progress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub delete_requested: bool,
    /// A rollback or teardown left artifacts behind; needs a `delete`.
    #[serde(default)]
    pub rollback_incomplete: bool,
    #[serde(default)]
    pub domain: Option<DomainHandle>,
    #[serde(default)]
    pub disk: Option<DiskImage>,
    #[serde(default)]
    pub data_disks: Vec<DiskImage>,
}

impl VmRecord {
    /// A fresh record for a newly reserved name.
    pub fn pending(request: ProvisionRequest) -> Self {
        let now = Utc::now();
        Self {
            name: request.name.clone(),
            request,
            state: VmState::Pending,
            last_error: None,
            attempt: 1,
            created_at: now,
            updated_at: now,
            in_progress: true,
            operation: Some(Operation::Provision),
            cancel_requested: false,
            delete_requested: false,
            rollback_incomplete: false,
            domain: None,
            disk: None,
            data_disks: Vec::new(),
        }
    }

    pub fn begin(&mut self, operation: Operation) {
        self.in_progress = true;
        self.operation = Some(operation);
    }

    /// Release the record: clears the in-progress marker and any pending
    /// cancellation.
    pub fn end(&mut self) {
        self.in_progress = false;
        self.operation = None;
        self.cancel_requested = false;
    }

    /// Every disk image the record owns, root first.
    pub fn disks(&self) -> impl Iterator<Item = &DiskImage> {
        self.disk.iter().chain(self.data_disks.iter())
    }

    /// Whether the control plane or the image directory may still hold
    /// something this record created.
    pub fn owns_artifacts(&self) -> bool {
        self.domain.is_some() || self.disk.is_some() || !self.data_disks.is_empty()
    }

    /// A `Failed` record can start a new attempt once nothing is left over.
    pub fn can_resubmit(&self) -> bool {
        self.state == VmState::Failed
            && !self.in_progress
            && !self.rollback_incomplete
            && !self.owns_artifacts()
    }
}
