//! Durable per-name VM records.
//!
//! Each record is one JSON document at
//! `<state_dir>/inventory/<sha256(name)>.json`, replaced through a temp file
//! and a rename so a crash never leaves a half-written record.
//!
//! Locking: an outer map lock guards the set of names, and each name has its
//! own slot lock. The outer lock is always taken before a slot lock. Only
//! `reserve` and `remove` persist under the outer lock; updates hold just the
//! slot lock, so updates to different names proceed independently while
//! updates to one name serialize.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::watch;

use crate::error::ProvError;
use crate::model::{Operation, ProvisionRequest, VmRecord};
use crate::paths;
use crate::validate::validate_name;
use crate::vm_state::VmState;

/// Outcome of [`InventoryStore::reserve`].
#[derive(Debug, Clone)]
pub enum Reservation {
    /// The name was free; a new `Pending` record now owns it.
    Fresh(VmRecord),
    /// A clean `Failed` record was reset to `Pending` for a new attempt.
    Resubmitted(VmRecord),
    /// Someone else owns the name; the record is returned untouched.
    Existing(VmRecord),
}

#[derive(Debug, Default)]
struct Slot {
    /// `None` once the record has been removed.
    record: Option<VmRecord>,
}

pub struct InventoryStore {
    dir: PathBuf,
    slots: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
    changes: watch::Sender<u64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InventoryStore {
    /// Open the store under `dir`, loading every persisted record.
    ///
    /// Records left mid-operation by a previous process are settled here:
    /// provisioning attempts become `Failed`, and anything that still owns a
    /// domain or disk is flagged for manual cleanup.
    pub fn open(dir: &Path) -> Result<Self, ProvError> {
        std::fs::create_dir_all(dir).map_err(|source| ProvError::Io {
            context: format!("creating inventory directory {}", dir.display()),
            source,
        })?;

        let (changes, _) = watch::channel(0);
        let store = Self {
            dir: dir.to_path_buf(),
            slots: Mutex::new(HashMap::new()),
            changes,
        };

        let entries = std::fs::read_dir(dir).map_err(|source| ProvError::Io {
            context: format!("reading inventory directory {}", dir.display()),
            source,
        })?;

        let mut slots = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record = match load_record(&path) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping corrupt inventory record");
                    continue;
                }
            };
            if let Err(e) = validate_name(&record.name) {
                tracing::warn!(path = %path.display(), error = %e, "skipping record with an invalid name");
                continue;
            }
            let record = match recover(record.clone()) {
                Some(recovered) => {
                    tracing::warn!(
                        name = %recovered.name,
                        state = %recovered.state,
                        "settling record interrupted by restart"
                    );
                    store.persist(&recovered)?;
                    recovered
                }
                None => record,
            };
            slots.insert(
                record.name.clone(),
                Arc::new(Mutex::new(Slot {
                    record: Some(record),
                })),
            );
        }

        tracing::debug!(dir = %dir.display(), records = slots.len(), "inventory opened");
        *lock(&store.slots) = slots;
        Ok(store)
    }

    /// Atomically claim `request.name`.
    pub fn reserve(&self, request: &ProvisionRequest) -> Result<Reservation, ProvError> {
        let mut slots = lock(&self.slots);

        if let Some(slot) = slots.get(&request.name).cloned() {
            let mut slot = lock(&slot);
            if let Some(existing) = &slot.record {
                if !existing.can_resubmit() {
                    return Ok(Reservation::Existing(existing.clone()));
                }
                let mut next = existing.clone();
                next.request = request.clone();
                next.state = VmState::Pending;
                next.attempt += 1;
                next.last_error = None;
                next.begin(Operation::Provision);
                next.cancel_requested = false;
                next.delete_requested = false;
                next.updated_at = Utc::now();
                self.persist(&next)?;
                slot.record = Some(next.clone());
                drop(slot);
                drop(slots);
                self.notify();
                tracing::info!(name = %next.name, attempt = next.attempt, "name resubmitted");
                return Ok(Reservation::Resubmitted(next));
            }
        }

        let record = VmRecord::pending(request.clone());
        self.persist(&record)?;
        slots.insert(
            record.name.clone(),
            Arc::new(Mutex::new(Slot {
                record: Some(record.clone()),
            })),
        );
        drop(slots);
        self.notify();
        tracing::info!(name = %record.name, "name reserved");
        Ok(Reservation::Fresh(record))
    }

    pub fn get(&self, name: &str) -> Option<VmRecord> {
        let slot = self.slot(name)?;
        let slot = lock(&slot);
        slot.record.clone()
    }

    /// Atomic read-modify-write of one record.
    pub fn update(
        &self,
        name: &str,
        mutate: impl FnOnce(&mut VmRecord),
    ) -> Result<VmRecord, ProvError> {
        self.try_update(name, |record| {
            mutate(record);
            Ok(())
        })
    }

    /// Like [`update`](Self::update), but the mutator may refuse. A refused
    /// or unpersisted change leaves the stored record untouched.
    pub fn try_update(
        &self,
        name: &str,
        mutate: impl FnOnce(&mut VmRecord) -> Result<(), ProvError>,
    ) -> Result<VmRecord, ProvError> {
        let not_found = || ProvError::NotFound {
            name: name.to_string(),
        };
        let slot = self.slot(name).ok_or_else(not_found)?;
        let mut slot = lock(&slot);
        let current = slot.record.as_ref().ok_or_else(not_found)?;

        let mut next = current.clone();
        mutate(&mut next)?;
        next.updated_at = Utc::now();
        self.persist(&next)?;
        slot.record = Some(next.clone());
        drop(slot);
        self.notify();
        Ok(next)
    }

    /// Drop a record and its file. Returns the removed record, if any.
    pub fn remove(&self, name: &str) -> Result<Option<VmRecord>, ProvError> {
        let mut slots = lock(&self.slots);
        let Some(slot) = slots.get(name).cloned() else {
            return Ok(None);
        };
        let mut slot = lock(&slot);
        let path = self.record_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ProvError::Persist {
                    name: name.to_string(),
                    message: format!("removing {}: {e}", path.display()),
                });
            }
        }
        let removed = slot.record.take();
        drop(slot);
        slots.remove(name);
        drop(slots);
        self.notify();
        tracing::info!(name, "record removed");
        Ok(removed)
    }

    /// Every record, sorted by name.
    pub fn list(&self) -> Vec<VmRecord> {
        let slots: Vec<_> = lock(&self.slots).values().cloned().collect();
        let mut records: Vec<VmRecord> = slots
            .iter()
            .filter_map(|slot| lock(slot).record.clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn names(&self) -> HashSet<String> {
        self.list().into_iter().map(|r| r.name).collect()
    }

    /// A receiver that changes whenever any record does.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn slot(&self, name: &str) -> Option<Arc<Mutex<Slot>>> {
        lock(&self.slots).get(name).cloned()
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", paths::name_key(name)))
    }

    fn persist(&self, record: &VmRecord) -> Result<(), ProvError> {
        let persist_err = |message: String| ProvError::Persist {
            name: record.name.clone(),
            message,
        };
        let path = self.record_path(&record.name);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record).map_err(|e| persist_err(e.to_string()))?;
        write_synced(&tmp, &json)
            .map_err(|e| persist_err(format!("writing {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| persist_err(format!("renaming into {}: {e}", path.display())))?;
        tracing::debug!(name = %record.name, state = %record.state, "record saved");
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn load_record(path: &Path) -> Result<VmRecord, String> {
    let json = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&json).map_err(|e| e.to_string())
}

/// The settled form of a record a restart interrupted, or `None` if it was
/// already at rest.
fn recover(mut record: VmRecord) -> Option<VmRecord> {
    if record.state.is_provisioning() {
        record.state = VmState::Failed;
        record.last_error = Some(format!(
            "attempt {} interrupted by a service restart",
            record.attempt
        ));
    } else if record.in_progress {
        record.last_error = Some("operation interrupted by a service restart".into());
    } else {
        return None;
    }
    record.end();
    record.delete_requested = false;
    if record.state == VmState::Failed && record.owns_artifacts() {
        record.rollback_incomplete = true;
    }
    record.updated_at = Utc::now();
    Some(record)
}
