//! The provisioning state machine and the lifecycle operations around it.
//!
//! `submit` and the lifecycle calls only touch the inventory and return;
//! the control-plane work runs on spawned tasks that advance the record one
//! transition at a time. Callers observe progress by polling the record.

mod lifecycle;
mod provision;
mod retry;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::ControlPlane;
use crate::config::Config;
use crate::error::{ControlPlaneError, ProvError, ValidationError};
use crate::image::ImageProvisioner;
use crate::inventory::{InventoryStore, Reservation};
use crate::model::{ProvisionRequest, VmRecord};
use crate::validate::{RequestValidator, validate_name};
use crate::vm_state::VmState;
use crate::{logging, paths};

pub use lifecycle::ReconcileReport;
pub use retry::RetryPolicy;

/// Result of a successful `submit`.
#[derive(Debug, Clone)]
pub enum Submission {
    /// A new attempt was started.
    Accepted(VmRecord),
    /// The same request is already owned by a record; nothing was started.
    Existing(VmRecord),
}

impl Submission {
    pub fn record(&self) -> &VmRecord {
        match self {
            Submission::Accepted(r) | Submission::Existing(r) => r,
        }
    }
}

/// The `{name, state}` body returned for submissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub name: String,
    pub state: VmState,
}

impl From<&VmRecord> for Accepted {
    fn from(record: &VmRecord) -> Self {
        Self {
            name: record.name.clone(),
            state: record.state,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<InventoryStore>,
    backend: Arc<dyn ControlPlane>,
    images: ImageProvisioner,
    validator: RequestValidator,
    policy: RetryPolicy,
    state_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        store: Arc<InventoryStore>,
        backend: Arc<dyn ControlPlane>,
        images: ImageProvisioner,
        validator: RequestValidator,
        policy: RetryPolicy,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            backend,
            images,
            validator,
            policy,
            state_dir,
        }
    }

    /// Wire an orchestrator from config, opening the inventory under the
    /// configured state directory.
    pub fn from_config(config: &Config, backend: Arc<dyn ControlPlane>) -> Result<Self, ProvError> {
        let state_dir = config.state_dir();
        let store = InventoryStore::open(&paths::inventory_dir(&state_dir))?;
        Ok(Self::new(
            Arc::new(store),
            backend,
            ImageProvisioner::new(config.image_dir()),
            RequestValidator::new(config.limits.clone()),
            RetryPolicy::from(&config.retry),
            state_dir,
        ))
    }

    pub fn store(&self) -> &InventoryStore {
        &self.store
    }

    /// Submit a provisioning request.
    ///
    /// Resubmitting a request whose name is already owned returns the
    /// existing record. A different request for an owned name, or an invalid
    /// request, is a `ValidationError`. A malformed name is refused before
    /// anything is stored; any other invalid request on a fresh name leaves
    /// a `Failed` record behind.
    pub async fn submit(&self, request: ProvisionRequest) -> Result<Submission, ProvError> {
        validate_name(&request.name)?;
        let record = match self.store.reserve(&request)? {
            Reservation::Existing(existing) => {
                if existing.request == request {
                    tracing::info!(name = %existing.name, state = %existing.state, "idempotent resubmission");
                    return Ok(Submission::Existing(existing));
                }
                return Err(ValidationError::new(
                    "name",
                    format!(
                        "'{}' is already reserved by a VM in state {}",
                        existing.name, existing.state
                    ),
                )
                .into());
            }
            Reservation::Fresh(record) | Reservation::Resubmitted(record) => record,
        };

        let mut others = self.store.names();
        others.remove(&record.name);
        if let Err(e) = self.validator.validate(&request, &others) {
            tracing::info!(name = %record.name, field = %e.field, reason = %e.reason, "request rejected");
            self.reject(&record.name, &e).await?;
            return Err(e.into());
        }

        let this = self.clone();
        let name = record.name.clone();
        tokio::spawn(async move { this.run_attempt(name).await });
        Ok(Submission::Accepted(record))
    }

    /// Settle a reserved record whose request failed validation. Nothing was
    /// created for it, so a delete queued meanwhile just drops the record.
    async fn reject(&self, name: &str, error: &ValidationError) -> Result<(), ProvError> {
        let mut delete_requested = false;
        self.store.update(name, |r| {
            r.state = VmState::Failed;
            r.last_error = Some(error.to_string());
            r.end();
            delete_requested = r.delete_requested;
            r.delete_requested = false;
        })?;
        if delete_requested {
            tracing::info!(name, "rejected request had a delete queued");
            self.forget(name).await;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<VmRecord> {
        self.store.get(name)
    }

    pub fn list(&self) -> Vec<VmRecord> {
        self.store.list()
    }

    /// Wait until `name` has no operation in progress. Returns `None` once
    /// the record is gone.
    pub async fn wait_settled(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<VmRecord>, ProvError> {
        let mut changes = self.store.subscribe();
        let wait = async {
            loop {
                match self.store.get(name) {
                    None => return None,
                    Some(record) if !record.in_progress => return Some(record),
                    Some(_) => {}
                }
                if changes.changed().await.is_err() {
                    return self.store.get(name);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ProvError::Busy {
                name: name.to_string(),
            })
    }

    /// Path to the newest attempt or operation log for `name`.
    pub fn latest_log(&self, name: &str) -> Option<PathBuf> {
        logging::latest_log(&self.logs_dir(name))
    }

    fn logs_dir(&self, name: &str) -> PathBuf {
        paths::vm_logs_dir(&self.state_dir, name)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Run one control-plane call under the configured timeout.
    async fn timed<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, ControlPlaneError>>,
    ) -> Result<T, ControlPlaneError> {
        let limit = self.policy.call_timeout;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| {
                Err(ControlPlaneError::Transient {
                    message: format!("control-plane call timed out after {limit:?}"),
                })
            })
    }
}
