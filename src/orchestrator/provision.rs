use std::future::Future;

use crate::backend::DomainSpec;
use crate::error::{ControlPlaneError, ProvError, Retryable};
use crate::logging::OperationLog;
use crate::model::{DiskImage, Operation, ProvisionRequest};
use crate::vm_state::VmState;

use super::Orchestrator;

/// Why an attempt stopped short of `Running`.
#[derive(Debug)]
pub(super) enum Halt {
    Failed(String),
    Cancelled,
}

impl From<ProvError> for Halt {
    fn from(e: ProvError) -> Self {
        Halt::Failed(e.to_string())
    }
}

impl std::fmt::Display for Halt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Halt::Failed(message) => f.write_str(message),
            Halt::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl Orchestrator {
    /// Drive one attempt from `Pending` to `Running`, or roll it back.
    pub(super) async fn run_attempt(self, name: String) {
        let Some(record) = self.store.get(&name) else {
            return;
        };
        let request = record.request.clone();
        let mut log = OperationLog::create(
            &self.logs_dir(&name),
            &format!("attempt-{}", record.attempt),
        );
        log.line(format!(
            "provisioning {name}: {} MiB, {} vCPU, {} GiB root, {:?} network, {} data disk(s)",
            request.memory_mib,
            request.vcpu_count,
            request.disk_size_gib,
            request.network_mode,
            request.data_disks_gib.len(),
        ));
        tracing::info!(name, attempt = record.attempt, "attempt started");

        match self.provision(&request, &mut log).await {
            Ok(()) => {
                tracing::info!(name, "VM running");
                log.line("running");
                log.finish(true);
            }
            Err(halt) => {
                tracing::warn!(name, reason = %halt, "attempt halted");
                log.line(format!("halted: {halt}"));
                self.abort(&name, halt, &mut log).await;
                log.finish(false);
            }
        }
    }

    async fn provision(
        &self,
        request: &ProvisionRequest,
        log: &mut OperationLog,
    ) -> Result<(), Halt> {
        let name = request.name.as_str();

        self.advance(name, VmState::ImagePreparing)?;
        log.line("preparing root image");
        let root = self
            .retry(name, log, "prepare image", || self.images.prepare_image(request))
            .await?;
        log.line(format!("root image ready at {}", root.path.display()));
        self.store.update(name, |r| r.disk = Some(root.clone()))?;

        let mut data_disks = Vec::with_capacity(request.data_disks_gib.len());
        for (i, size_gib) in request.data_disks_gib.iter().copied().enumerate() {
            let index = i + 1;
            let disk = self
                .retry(name, log, "prepare data disk", || {
                    self.images.prepare_data_disk(name, index, size_gib)
                })
                .await?;
            log.line(format!("data disk {} ready at {}", disk.target, disk.path.display()));
            self.store.update(name, |r| r.data_disks.push(disk.clone()))?;
            data_disks.push(disk);
        }

        self.advance(name, VmState::Creating)?;
        let spec = DomainSpec::new(request, &root);
        let handle = self
            .retry(name, log, "create domain", || {
                self.timed(self.backend.create_domain(&spec))
            })
            .await?;
        log.line(format!("domain defined (uuid {})", handle.uuid));
        self.store.update(name, |r| r.domain = Some(handle.clone()))?;

        for disk in &data_disks {
            self.retry(name, log, "attach data disk", || {
                self.timed(self.backend.attach_disk(&handle, disk))
            })
            .await?;
            log.line(format!("attached {}", disk.target));
        }

        self.advance(name, VmState::Starting)?;
        self.retry(name, log, "start domain", || {
            self.timed(self.backend.start_domain(&handle))
        })
        .await?;
        log.line("domain started");

        self.advance(name, VmState::Running)?;
        Ok(())
    }

    /// Move `name` to `next`. Every transition is a cancellation boundary:
    /// a pending cancel refuses the move atomically.
    pub(super) fn advance(&self, name: &str, next: VmState) -> Result<(), Halt> {
        let mut cancelled = false;
        let result = self.store.try_update(name, |r| {
            if r.cancel_requested {
                cancelled = true;
                return Err(ProvError::Busy {
                    name: r.name.clone(),
                });
            }
            if !r.state.can_transition_to(next) {
                return Err(ProvError::InvalidState {
                    name: r.name.clone(),
                    state: r.state,
                    action: "advance",
                });
            }
            r.state = next;
            if next == VmState::Running {
                r.last_error = None;
                r.end();
            }
            Ok(())
        });
        match result {
            Ok(_) => {
                tracing::debug!(name, state = %next, "state changed");
                Ok(())
            }
            Err(_) if cancelled => Err(Halt::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    /// Run `op` until it succeeds, fails for good, or runs out of tries.
    /// Retries during provisioning bump the record's attempt counter.
    pub(super) async fn retry<T, E, F, Fut>(
        &self,
        name: &str,
        log: &mut OperationLog,
        what: &str,
        mut op: F,
    ) -> Result<T, Halt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut tries = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && tries < self.policy.max_attempts => {
                    let delay = self.policy.backoff(tries - 1);
                    tracing::warn!(name, step = what, error = %e, ?delay, "retrying");
                    log.line(format!("{what} failed: {e}; retrying in {delay:?}"));
                    self.store.update(name, |r| {
                        if r.operation == Some(Operation::Provision) {
                            r.attempt += 1;
                        }
                        r.last_error = Some(format!("{what}: {e}"));
                    })?;
                    self.sleep_unless_cancelled(name, delay).await?;
                    tries += 1;
                }
                Err(e) => return Err(Halt::Failed(format!("{what}: {e}"))),
            }
        }
    }

    async fn sleep_unless_cancelled(
        &self,
        name: &str,
        delay: std::time::Duration,
    ) -> Result<(), Halt> {
        let mut changes = self.store.subscribe();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            if self.store.get(name).is_some_and(|r| r.cancel_requested) {
                return Err(Halt::Cancelled);
            }
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                changed = changes.changed() => {
                    if changed.is_err() {
                        (&mut sleep).await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Roll back a halted attempt and settle its record.
    async fn abort(&self, name: &str, halt: Halt, log: &mut OperationLog) {
        let rollback = self.release_artifacts(name, log).await;
        let delete_requested = self.store.get(name).is_some_and(|r| r.delete_requested);

        if delete_requested && rollback.is_ok() {
            log.line("deleted");
            self.forget(name).await;
            return;
        }

        let result = self.store.update(name, |r| {
            r.state = VmState::Failed;
            r.delete_requested = false;
            r.last_error = Some(match &rollback {
                Ok(()) => halt.to_string(),
                Err(incomplete) => format!("{halt}; rollback incomplete: {incomplete}"),
            });
            r.rollback_incomplete = rollback.is_err();
            r.end();
        });
        if let Err(e) = result {
            tracing::error!(name, error = %e, "failed to record attempt failure");
        }
    }

    /// Tear down whatever the record owns, domain first. Each released
    /// artifact is dropped from the record as soon as it is gone. Disks are
    /// kept if the domain could not be destroyed.
    pub(super) async fn release_artifacts(
        &self,
        name: &str,
        log: &mut OperationLog,
    ) -> Result<(), String> {
        let Some(record) = self.store.get(name) else {
            return Ok(());
        };

        if let Some(handle) = &record.domain {
            match self.timed(self.backend.destroy_domain(handle)).await {
                Ok(()) | Err(ControlPlaneError::NotFound { .. }) => {
                    log.line(format!("destroyed domain {}", handle.name));
                    self.store
                        .update(name, |r| r.domain = None)
                        .map_err(|e| e.to_string())?;
                }
                Err(e) => {
                    log.line(format!("destroy domain failed: {e}"));
                    return Err(format!("destroy domain: {e}"));
                }
            }
        }

        let mut errors = Vec::new();
        let disks: Vec<DiskImage> = record.disks().cloned().collect();
        for disk in &disks {
            match self.images.remove(disk).await {
                Ok(()) => {
                    log.line(format!("removed {}", disk.path.display()));
                    let forgotten = self.store.update(name, |r| {
                        if r.disk.as_ref().is_some_and(|d| d.path == disk.path) {
                            r.disk = None;
                        }
                        r.data_disks.retain(|d| d.path != disk.path);
                    });
                    if let Err(e) = forgotten {
                        errors.push(e.to_string());
                    }
                }
                Err(e) => {
                    log.line(format!("remove image failed: {e}"));
                    errors.push(format!("remove image: {e}"));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    /// Drop the logs, then the record. Watchers see the record vanish only
    /// once nothing of the VM is left on disk.
    pub(super) async fn forget(&self, name: &str) {
        let logs = self.logs_dir(name);
        if let Err(e) = tokio::fs::remove_dir_all(&logs).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %logs.display(), error = %e, "failed to remove VM logs");
        }
        if let Err(e) = self.store.remove(name) {
            tracing::error!(name, error = %e, "failed to remove record");
            return;
        }
        tracing::info!(name, "VM deleted");
    }
}
