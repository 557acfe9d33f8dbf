use std::collections::HashSet;

use serde::Serialize;

use crate::backend::DomainStatus;
use crate::error::{ControlPlaneError, ProvError};
use crate::logging::OperationLog;
use crate::model::{DomainHandle, Operation, VmRecord};
use crate::vm_state::VmState;

use super::Orchestrator;
use super::provision::Halt;

/// What `reconcile` changed after comparing the inventory with the
/// control plane.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    /// Records whose domain no longer exists; now `Failed`.
    pub missing: Vec<String>,
    /// `Running` records whose domain was found shut off; now `Stopped`.
    pub shut_off: Vec<String>,
}

fn claim(
    r: &mut VmRecord,
    action: &'static str,
    allowed: VmState,
    operation: Operation,
) -> Result<(), ProvError> {
    if r.in_progress {
        return Err(ProvError::Busy {
            name: r.name.clone(),
        });
    }
    if r.state != allowed {
        return Err(ProvError::InvalidState {
            name: r.name.clone(),
            state: r.state,
            action,
        });
    }
    r.begin(operation);
    Ok(())
}

impl Orchestrator {
    /// Stop a `Running` VM. `force` skips the ACPI shutdown.
    pub fn stop(&self, name: &str, force: bool) -> Result<VmRecord, ProvError> {
        let record = self
            .store
            .try_update(name, |r| claim(r, "stop", VmState::Running, Operation::Stop))?;
        let this = self.clone();
        let name = name.to_string();
        tokio::spawn(async move { this.run_stop(name, force).await });
        Ok(record)
    }

    /// Boot a `Stopped` VM again.
    pub fn start(&self, name: &str) -> Result<VmRecord, ProvError> {
        let record = self.store.try_update(name, |r| {
            claim(r, "start", VmState::Stopped, Operation::Start)?;
            r.state = VmState::Starting;
            r.last_error = None;
            Ok(())
        })?;
        let this = self.clone();
        let name = name.to_string();
        tokio::spawn(async move { this.run_start(name).await });
        Ok(record)
    }

    /// Tear a VM down from any state. An attempt in progress is cancelled and
    /// the teardown happens once it reaches its next boundary.
    pub fn delete(&self, name: &str) -> Result<VmRecord, ProvError> {
        let mut start_now = false;
        let record = self.store.try_update(name, |r| {
            r.delete_requested = true;
            if r.in_progress {
                if r.operation == Some(Operation::Provision) {
                    r.cancel_requested = true;
                }
            } else {
                r.begin(Operation::Delete);
                start_now = true;
            }
            Ok(())
        })?;
        if start_now {
            let this = self.clone();
            let name = name.to_string();
            tokio::spawn(async move { this.run_delete(name).await });
        } else {
            tracing::info!(name, "delete queued behind operation in progress");
        }
        Ok(record)
    }

    /// Ask a provisioning attempt in progress to roll back.
    pub fn cancel(&self, name: &str) -> Result<VmRecord, ProvError> {
        let record = self.store.try_update(name, |r| {
            if r.operation != Some(Operation::Provision) {
                return Err(ProvError::InvalidState {
                    name: r.name.clone(),
                    state: r.state,
                    action: "cancel",
                });
            }
            r.cancel_requested = true;
            Ok(())
        })?;
        tracing::info!(name, state = %record.state, "cancellation requested");
        Ok(record)
    }

    /// Compare settled records with what the control plane reports.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ProvError> {
        let defined: HashSet<String> = self
            .timed(self.backend.list_domains())
            .await?
            .into_iter()
            .collect();

        let mut report = ReconcileReport::default();
        for record in self.store.list() {
            if record.in_progress || !matches!(record.state, VmState::Running | VmState::Stopped) {
                continue;
            }
            let Some(handle) = &record.domain else {
                continue;
            };
            report.checked += 1;

            if !defined.contains(&handle.name) {
                tracing::warn!(name = %record.name, "domain disappeared from the control plane");
                self.store.update(&record.name, |r| {
                    r.state = VmState::Failed;
                    r.domain = None;
                    r.last_error = Some(format!(
                        "domain '{}' is no longer defined; delete the VM to clean up its disks",
                        handle.name
                    ));
                })?;
                report.missing.push(record.name.clone());
                continue;
            }

            if record.state == VmState::Running {
                match self.timed(self.backend.domain_status(handle)).await {
                    Ok(DomainStatus::ShutOff | DomainStatus::Crashed) => {
                        tracing::info!(name = %record.name, "domain found shut off");
                        self.store.update(&record.name, |r| {
                            r.state = VmState::Stopped;
                            r.last_error = Some("domain was found shut off".into());
                        })?;
                        report.shut_off.push(record.name.clone());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(name = %record.name, error = %e, "cannot read domain status");
                    }
                }
            }
        }
        Ok(report)
    }

    async fn run_stop(self, name: String, force: bool) {
        let mut log = OperationLog::create(&self.logs_dir(&name), "stop");
        log.line(if force { "force stop" } else { "graceful stop" });

        let result = match self.store.get(&name).and_then(|r| r.domain) {
            Some(handle) => {
                self.retry(&name, &mut log, "stop domain", || {
                    self.stop_or_absent(&handle, !force)
                })
                .await
            }
            None => Err(Halt::Failed("record has no domain".into())),
        };

        match &result {
            Ok(()) => log.line("stopped"),
            Err(halt) => log.line(format!("stop failed: {halt}")),
        }
        self.settle(&name, log, result.is_ok(), |r| match result {
            Ok(()) => {
                r.state = VmState::Stopped;
                r.last_error = None;
            }
            Err(halt) => r.last_error = Some(halt.to_string()),
        })
        .await;
    }

    async fn run_start(self, name: String) {
        let mut log = OperationLog::create(&self.logs_dir(&name), "start");
        let result = self.restart(&name, &mut log).await;

        match &result {
            Ok(()) => log.line("running"),
            Err(halt) => log.line(format!("start failed: {halt}")),
        }
        // A failed restart keeps the disks: the VM's data is never rolled back.
        self.settle(&name, log, result.is_ok(), |r| match result {
            Ok(()) => {
                r.state = VmState::Running;
                r.last_error = None;
            }
            Err(halt) => {
                r.state = VmState::Failed;
                r.last_error = Some(halt.to_string());
            }
        })
        .await;
    }

    async fn restart(&self, name: &str, log: &mut OperationLog) -> Result<(), Halt> {
        let record = self
            .store
            .get(name)
            .ok_or_else(|| Halt::Failed("record disappeared".into()))?;
        for disk in record.disks() {
            self.retry(name, log, "verify image", || self.images.verify(disk))
                .await?;
        }
        log.line("images verified");

        let handle = record
            .domain
            .ok_or_else(|| Halt::Failed("record has no domain".into()))?;
        self.retry(name, log, "start domain", || {
            self.timed(self.backend.start_domain(&handle))
        })
        .await
    }

    async fn run_delete(self, name: String) {
        let mut log = OperationLog::create(&self.logs_dir(&name), "delete");
        match self.release_artifacts(&name, &mut log).await {
            Ok(()) => {
                log.line("deleted");
                log.finish(true);
                self.forget(&name).await;
            }
            Err(incomplete) => {
                tracing::error!(name, error = %incomplete, "teardown incomplete");
                let result = self.store.update(&name, |r| {
                    r.state = VmState::Failed;
                    r.rollback_incomplete = true;
                    r.delete_requested = false;
                    r.last_error = Some(format!("teardown incomplete: {incomplete}"));
                    r.end();
                });
                if let Err(e) = result {
                    tracing::error!(name, error = %e, "failed to record teardown failure");
                }
                log.finish(false);
            }
        }
    }

    /// Apply the outcome of a lifecycle operation and release the record,
    /// unless a delete was queued meanwhile, in which case it runs now.
    async fn settle(
        &self,
        name: &str,
        log: OperationLog,
        success: bool,
        apply: impl FnOnce(&mut VmRecord),
    ) {
        let mut delete_next = false;
        let result = self.store.update(name, |r| {
            apply(r);
            if r.delete_requested {
                r.begin(Operation::Delete);
                delete_next = true;
            } else {
                r.end();
            }
        });
        log.finish(success);
        if let Err(e) = result {
            tracing::error!(name, error = %e, "failed to record operation outcome");
            return;
        }
        if delete_next {
            self.clone().run_delete(name.to_string()).await;
        }
    }

    async fn stop_or_absent(
        &self,
        handle: &DomainHandle,
        graceful: bool,
    ) -> Result<(), ControlPlaneError> {
        match self.timed(self.backend.stop_domain(handle, graceful)).await {
            Err(ControlPlaneError::NotFound { .. }) => {
                tracing::warn!(name = %handle.name, "domain already gone; treating as stopped");
                Ok(())
            }
            other => other,
        }
    }
}
