//! An in-process control plane.
//!
//! Keeps domains in a map, records every call, and can be scripted to fail
//! or stall specific operations. Used by the test suite and by
//! `libvirt.backend = "memory"` for dry runs of the service.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{ControlPlane, DomainSpec, DomainStatus};
use crate::error::ControlPlaneError;
use crate::model::{DiskImage, DomainHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Start,
    Stop,
    Destroy,
    Status,
    List,
    AttachDisk,
}

/// One recorded call, in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(String),
    Start(String),
    Stop { name: String, graceful: bool },
    Destroy(String),
    Status(String),
    List,
    AttachDisk { name: String, target: String },
}

impl Call {
    pub fn op(&self) -> Op {
        match self {
            Call::Create(_) => Op::Create,
            Call::Start(_) => Op::Start,
            Call::Stop { .. } => Op::Stop,
            Call::Destroy(_) => Op::Destroy,
            Call::Status(_) => Op::Status,
            Call::List => Op::List,
            Call::AttachDisk { .. } => Op::AttachDisk,
        }
    }
}

#[derive(Debug, Clone)]
struct MemDomain {
    uuid: String,
    running: bool,
    root_disk: PathBuf,
    disks: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    domains: HashMap<String, MemDomain>,
    calls: Vec<Call>,
    faults: HashMap<Op, VecDeque<ControlPlaneError>>,
    delays: HashMap<Op, Duration>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next call of `op` fail with `error`. Queued faults are
    /// consumed in order.
    pub fn fail_next(&self, op: Op, error: ControlPlaneError) {
        self.lock().faults.entry(op).or_default().push_back(error);
    }

    /// Make the next `times` calls of `op` fail with `error`.
    pub fn fail_times(&self, op: Op, times: usize, error: ControlPlaneError) {
        for _ in 0..times {
            self.fail_next(op, error.clone());
        }
    }

    /// Stall every call of `op` for `delay` before it takes effect.
    pub fn delay(&self, op: Op, delay: Duration) {
        self.lock().delays.insert(op, delay);
    }

    pub fn clear_delay(&self, op: Op) {
        self.lock().delays.remove(&op);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn has_domain(&self, name: &str) -> bool {
        self.lock().domains.contains_key(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock().domains.get(name).is_some_and(|d| d.running)
    }

    /// Flip a domain to shut off, as if the guest powered itself down.
    pub fn power_off(&self, name: &str) {
        if let Some(dom) = self.lock().domains.get_mut(name) {
            dom.running = false;
        }
    }

    /// Record `call`, wait out any configured delay, then pop a scripted fault.
    async fn enter(&self, call: Call) -> Result<(), ControlPlaneError> {
        let op = call.op();
        let delay = {
            let mut inner = self.lock();
            inner.calls.push(call);
            inner.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.lock().faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn not_found(name: &str) -> ControlPlaneError {
    ControlPlaneError::NotFound {
        name: name.to_string(),
    }
}

#[async_trait]
impl ControlPlane for MemoryBackend {
    async fn create_domain(&self, spec: &DomainSpec) -> Result<DomainHandle, ControlPlaneError> {
        self.enter(Call::Create(spec.name.clone())).await?;
        let mut inner = self.lock();
        if let Some(existing) = inner.domains.get(&spec.name) {
            if existing.root_disk == spec.root_disk {
                return Ok(DomainHandle {
                    name: spec.name.clone(),
                    uuid: existing.uuid.clone(),
                });
            }
            return Err(ControlPlaneError::Permanent {
                message: format!(
                    "a domain named '{}' already exists with a different root disk",
                    spec.name
                ),
                hint: "pick another name".into(),
            });
        }
        inner.next_id += 1;
        let uuid = format!("00000000-0000-4000-8000-{:012x}", inner.next_id);
        inner.domains.insert(
            spec.name.clone(),
            MemDomain {
                uuid: uuid.clone(),
                running: false,
                root_disk: spec.root_disk.clone(),
                disks: Vec::new(),
            },
        );
        Ok(DomainHandle {
            name: spec.name.clone(),
            uuid,
        })
    }

    async fn start_domain(&self, handle: &DomainHandle) -> Result<(), ControlPlaneError> {
        self.enter(Call::Start(handle.name.clone())).await?;
        let mut inner = self.lock();
        let dom = inner
            .domains
            .get_mut(&handle.name)
            .ok_or_else(|| not_found(&handle.name))?;
        dom.running = true;
        Ok(())
    }

    async fn stop_domain(
        &self,
        handle: &DomainHandle,
        graceful: bool,
    ) -> Result<(), ControlPlaneError> {
        self.enter(Call::Stop {
            name: handle.name.clone(),
            graceful,
        })
        .await?;
        let mut inner = self.lock();
        let dom = inner
            .domains
            .get_mut(&handle.name)
            .ok_or_else(|| not_found(&handle.name))?;
        dom.running = false;
        Ok(())
    }

    async fn destroy_domain(&self, handle: &DomainHandle) -> Result<(), ControlPlaneError> {
        self.enter(Call::Destroy(handle.name.clone())).await?;
        self.lock()
            .domains
            .remove(&handle.name)
            .map(|_| ())
            .ok_or_else(|| not_found(&handle.name))
    }

    async fn domain_status(&self, handle: &DomainHandle) -> Result<DomainStatus, ControlPlaneError> {
        self.enter(Call::Status(handle.name.clone())).await?;
        let inner = self.lock();
        let dom = inner
            .domains
            .get(&handle.name)
            .ok_or_else(|| not_found(&handle.name))?;
        Ok(if dom.running {
            DomainStatus::Running
        } else {
            DomainStatus::ShutOff
        })
    }

    async fn list_domains(&self) -> Result<Vec<String>, ControlPlaneError> {
        self.enter(Call::List).await?;
        let mut names: Vec<String> = self.lock().domains.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn attach_disk(
        &self,
        handle: &DomainHandle,
        disk: &DiskImage,
    ) -> Result<(), ControlPlaneError> {
        self.enter(Call::AttachDisk {
            name: handle.name.clone(),
            target: disk.target.clone(),
        })
        .await?;
        let mut inner = self.lock();
        let dom = inner
            .domains
            .get_mut(&handle.name)
            .ok_or_else(|| not_found(&handle.name))?;
        if !dom.disks.contains(&disk.target) {
            dom.disks.push(disk.target.clone());
        }
        Ok(())
    }
}
