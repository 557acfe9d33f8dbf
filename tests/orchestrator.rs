use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kvmprov::backend::memory::{Call, MemoryBackend, Op};
use kvmprov::backend::ControlPlane;
use kvmprov::config::LimitsConfig;
use kvmprov::error::{ControlPlaneError, ProvError};
use kvmprov::image::ImageProvisioner;
use kvmprov::inventory::InventoryStore;
use kvmprov::model::{NetworkMode, ProvisionRequest, VmRecord};
use kvmprov::orchestrator::{Orchestrator, RetryPolicy, Submission};
use kvmprov::paths;
use kvmprov::validate::RequestValidator;
use kvmprov::vm_state::VmState;

const SETTLE: Duration = Duration::from_secs(10);

struct Harness {
    dir: tempfile::TempDir,
    backend: Arc<MemoryBackend>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        Self::with_policy(fast_policy())
    }

    fn with_policy(policy: RetryPolicy) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let orchestrator = build(dir.path(), backend.clone(), policy);
        Self {
            dir,
            backend,
            orchestrator,
        }
    }

    fn image_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("images")
    }

    fn root_image(&self, name: &str) -> std::path::PathBuf {
        self.image_dir().join(name).join("root.qcow2")
    }

    fn state_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("state")
    }

    async fn submit_and_settle(&self, request: ProvisionRequest) -> VmRecord {
        let name = request.name.clone();
        self.orchestrator.submit(request).await.unwrap();
        self.settle(&name).await.unwrap()
    }

    async fn settle(&self, name: &str) -> Option<VmRecord> {
        self.orchestrator.wait_settled(name, SETTLE).await.unwrap()
    }

    async fn wait_for_state(&self, name: &str, state: VmState) {
        tokio::time::timeout(SETTLE, async {
            while self.orchestrator.get(name).map(|r| r.state) != Some(state) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

fn build(dir: &Path, backend: Arc<MemoryBackend>, policy: RetryPolicy) -> Orchestrator {
    let state_dir = dir.join("state");
    let store = InventoryStore::open(&paths::inventory_dir(&state_dir)).unwrap();
    Orchestrator::new(
        Arc::new(store),
        backend,
        ImageProvisioner::new(dir.join("images")),
        RequestValidator::new(LimitsConfig::default()),
        policy,
        state_dir,
    )
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        call_timeout: Duration::from_secs(5),
    }
}

fn request(name: &str) -> ProvisionRequest {
    ProvisionRequest {
        name: name.into(),
        memory_mib: 2048,
        vcpu_count: 2,
        disk_size_gib: 20,
        image_source_path: None,
        network_mode: NetworkMode::Bridged,
        data_disks_gib: vec![],
    }
}

fn transient() -> ControlPlaneError {
    ControlPlaneError::Transient {
        message: "connection reset".into(),
    }
}

#[tokio::test]
async fn provisions_to_running() {
    let h = Harness::new();
    let record = h.submit_and_settle(request("vm1")).await;

    assert_eq!(record.state, VmState::Running);
    assert_eq!(record.attempt, 1);
    assert!(record.last_error.is_none());
    assert!(!record.in_progress);
    assert_eq!(h.backend.count(Op::Create), 1);
    assert_eq!(h.backend.count(Op::Start), 1);
    assert!(h.backend.is_running("vm1"));

    let disk = record.disk.unwrap();
    assert_eq!(disk.path, h.root_image("vm1"));
    assert_eq!(disk.size_gib, 20);
    assert!(disk.path.exists());
    assert_eq!(record.domain.unwrap().name, "vm1");
}

#[tokio::test]
async fn invalid_request_fails_without_backend_calls() {
    let h = Harness::new();
    let mut req = request("vm1");
    req.memory_mib = 0;
    req.vcpu_count = 0;
    req.disk_size_gib = 0;

    let err = h.orchestrator.submit(req).await.unwrap_err();
    let ProvError::Validation(e) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert_eq!(e.field, "memoryMiB");

    let record = h.orchestrator.get("vm1").unwrap();
    assert_eq!(record.state, VmState::Failed);
    assert!(!record.in_progress);
    assert!(record.last_error.unwrap().contains("memoryMiB"));
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn unsafe_name_is_refused_before_reservation() {
    let h = Harness::new();
    let victim = h.dir.path().join("victim");
    std::fs::create_dir(&victim).unwrap();
    std::fs::write(victim.join("precious.txt"), "keep").unwrap();

    let name = "../../../victim";
    let err = h.orchestrator.submit(request(name)).await.unwrap_err();
    let ProvError::Validation(e) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert_eq!(e.field, "name");

    assert!(h.orchestrator.get(name).is_none());
    assert!(h.orchestrator.list().is_empty());
    assert!(matches!(
        h.orchestrator.delete(name),
        Err(ProvError::NotFound { .. })
    ));
    assert!(victim.join("precious.txt").exists());
    assert!(h.backend.calls().is_empty());

    // Nothing reached the inventory directory either.
    let inventory = paths::inventory_dir(&h.state_dir());
    assert_eq!(std::fs::read_dir(inventory).unwrap().count(), 0);
    assert!(!h.image_dir().exists());
}

#[tokio::test]
async fn missing_image_source_is_rejected() {
    let h = Harness::new();
    let mut req = request("vm1");
    req.image_source_path = Some(h.dir.path().join("nope.img"));

    let err = h.orchestrator.submit(req).await.unwrap_err();
    let ProvError::Validation(e) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert_eq!(e.field, "imageSourcePath");
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn different_request_for_reserved_name_is_rejected() {
    let h = Harness::new();
    h.submit_and_settle(request("vm1")).await;

    let mut other = request("vm1");
    other.memory_mib = 4096;
    let err = h.orchestrator.submit(other).await.unwrap_err();
    let ProvError::Validation(e) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert_eq!(e.field, "name");

    let record = h.orchestrator.get("vm1").unwrap();
    assert_eq!(record.state, VmState::Running);
    assert_eq!(record.request.memory_mib, 2048);
    assert_eq!(h.backend.count(Op::Create), 1);
}

#[tokio::test]
async fn concurrent_identical_submits_create_once() {
    let h = Harness::new();
    let a = h.orchestrator.clone();
    let b = h.orchestrator.clone();
    let (first, second) = tokio::join!(a.submit(request("vm1")), b.submit(request("vm1")));

    let outcomes = [first.unwrap(), second.unwrap()];
    let accepted = outcomes
        .iter()
        .filter(|s| matches!(s, Submission::Accepted(_)))
        .count();
    assert_eq!(accepted, 1);

    let record = h.settle("vm1").await.unwrap();
    assert_eq!(record.state, VmState::Running);
    assert_eq!(h.orchestrator.list().len(), 1);
    assert_eq!(h.backend.count(Op::Create), 1);
}

#[tokio::test]
async fn resubmitting_running_vm_returns_existing() {
    let h = Harness::new();
    h.submit_and_settle(request("vm1")).await;

    let again = h.orchestrator.submit(request("vm1")).await.unwrap();
    let Submission::Existing(record) = again else {
        panic!("expected the existing record");
    };
    assert_eq!(record.state, VmState::Running);
    assert_eq!(h.backend.count(Op::Create), 1);
}

#[tokio::test]
async fn permanent_start_failure_rolls_back() {
    let h = Harness::new();
    h.backend.fail_next(
        Op::Start,
        ControlPlaneError::Permanent {
            message: "no kvm support".into(),
            hint: "enable virtualization".into(),
        },
    );

    let record = h.submit_and_settle(request("vm1")).await;
    assert_eq!(record.state, VmState::Failed);
    assert!(record.last_error.unwrap().contains("start domain"));
    assert!(!record.rollback_incomplete);
    assert!(record.domain.is_none());
    assert!(record.disk.is_none());

    assert!(h.backend.calls().contains(&Call::Destroy("vm1".into())));
    assert!(!h.backend.has_domain("vm1"));
    assert!(!h.root_image("vm1").exists());
    assert_eq!(h.backend.count(Op::Start), 1);

    // The name is free for a fresh attempt once rolled back.
    let retried = h.submit_and_settle(request("vm1")).await;
    assert_eq!(retried.state, VmState::Running);
    assert_eq!(retried.attempt, 2);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let h = Harness::new();
    h.backend.fail_times(Op::Start, 2, transient());

    let record = h.submit_and_settle(request("vm1")).await;
    assert_eq!(record.state, VmState::Running);
    assert_eq!(record.attempt, 3);
    assert!(record.last_error.is_none());
    assert_eq!(h.backend.count(Op::Start), 3);
    assert_eq!(h.backend.count(Op::Create), 1);
}

#[tokio::test]
async fn retries_are_bounded() {
    let h = Harness::new();
    h.backend.fail_times(Op::Create, 5, transient());

    let record = h.submit_and_settle(request("vm1")).await;
    assert_eq!(record.state, VmState::Failed);
    assert_eq!(h.backend.count(Op::Create), 3);
    assert!(record.last_error.unwrap().contains("connection reset"));
    assert!(!h.root_image("vm1").exists());
}

#[tokio::test]
async fn call_timeout_counts_as_transient() {
    let h = Harness::with_policy(RetryPolicy {
        max_attempts: 4,
        call_timeout: Duration::from_millis(100),
        ..fast_policy()
    });
    h.backend.delay(Op::Create, Duration::from_millis(400));
    h.orchestrator.submit(request("vm1")).await.unwrap();

    tokio::time::timeout(SETTLE, async {
        while h.orchestrator.get("vm1").is_some_and(|r| r.attempt < 2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    h.backend.clear_delay(Op::Create);

    let record = h.settle("vm1").await.unwrap();
    assert_eq!(record.state, VmState::Running);
    assert!(record.attempt >= 2);
    assert!(h.backend.count(Op::Create) >= 2);
}

#[tokio::test]
async fn data_disks_are_created_and_attached() {
    let h = Harness::new();
    let mut req = request("vm1");
    req.data_disks_gib = vec![1, 2];

    let record = h.submit_and_settle(req).await;
    assert_eq!(record.state, VmState::Running);
    let targets: Vec<&str> = record.data_disks.iter().map(|d| d.target.as_str()).collect();
    assert_eq!(targets, ["vdb", "vdc"]);
    for disk in &record.data_disks {
        assert!(disk.path.exists());
    }
    assert!(h.backend.calls().contains(&Call::AttachDisk {
        name: "vm1".into(),
        target: "vdc".into(),
    }));

    h.orchestrator.delete("vm1").unwrap();
    assert!(h.settle("vm1").await.is_none());
    for disk in &record.data_disks {
        assert!(!disk.path.exists());
    }
}

#[tokio::test]
async fn each_disk_belongs_to_one_vm() {
    let h = Harness::new();
    let mut owner = request("vm1");
    owner.data_disks_gib = vec![1];
    let vm1 = h.submit_and_settle(owner).await;
    let lookalike = h.submit_and_settle(request("vm1-data1")).await;
    assert_eq!(vm1.state, VmState::Running);
    assert_eq!(lookalike.state, VmState::Running);

    let vm1_disks: Vec<_> = vm1.disks().map(|d| d.path.clone()).collect();
    let other_disks: Vec<_> = lookalike.disks().map(|d| d.path.clone()).collect();
    for path in &vm1_disks {
        assert!(!other_disks.contains(path), "{} is shared", path.display());
    }

    h.orchestrator.delete("vm1-data1").unwrap();
    assert!(h.settle("vm1-data1").await.is_none());
    for path in &vm1_disks {
        assert!(path.exists(), "{} was removed", path.display());
    }
    for path in &other_disks {
        assert!(!path.exists());
    }

    h.orchestrator.delete("vm1").unwrap();
    assert!(h.settle("vm1").await.is_none());
    assert!(!h.image_dir().join("vm1").exists());
}

#[tokio::test]
async fn clones_from_image_source() {
    let h = Harness::new();
    let source = h.dir.path().join("base.img");
    std::fs::write(&source, vec![0u8; 1024 * 1024]).unwrap();

    let mut req = request("vm1");
    req.disk_size_gib = 4;
    req.image_source_path = Some(source);

    let record = h.submit_and_settle(req).await;
    assert_eq!(record.state, VmState::Running);
    let disk = record.disk.unwrap();
    assert!(disk.backing_source.is_some());
    assert_eq!(disk.checksum.map(|c| c.len()), Some(64));
}

#[tokio::test]
async fn delete_running_vm_removes_everything() {
    let h = Harness::new();
    h.submit_and_settle(request("vm1")).await;

    let record = h.orchestrator.delete("vm1").unwrap();
    assert!(record.delete_requested);
    assert!(h.settle("vm1").await.is_none());

    assert!(h.orchestrator.get("vm1").is_none());
    assert!(!h.backend.has_domain("vm1"));
    assert!(!h.root_image("vm1").exists());

    let logs = paths::vm_logs_dir(&h.state_dir(), "vm1");
    assert!(!logs.exists());

    // The name is free again.
    let again = h.submit_and_settle(request("vm1")).await;
    assert_eq!(again.state, VmState::Running);
    assert_eq!(again.attempt, 1);
}

#[tokio::test]
async fn failed_teardown_is_recorded() {
    let h = Harness::new();
    h.submit_and_settle(request("vm1")).await;
    h.backend.fail_next(
        Op::Destroy,
        ControlPlaneError::Permanent {
            message: "domain is locked".into(),
            hint: "retry later".into(),
        },
    );

    h.orchestrator.delete("vm1").unwrap();
    let record = h.settle("vm1").await.unwrap();
    assert_eq!(record.state, VmState::Failed);
    assert!(record.rollback_incomplete);
    assert!(record.domain.is_some());
    // Disks stay while the domain may still use them.
    assert!(h.root_image("vm1").exists());

    h.orchestrator.delete("vm1").unwrap();
    assert!(h.settle("vm1").await.is_none());
    assert!(!h.root_image("vm1").exists());
}

#[tokio::test]
async fn cancel_rolls_back_at_next_boundary() {
    let h = Harness::new();
    h.backend.delay(Op::Create, Duration::from_millis(300));
    h.orchestrator.submit(request("vm1")).await.unwrap();
    h.wait_for_state("vm1", VmState::Creating).await;

    let record = h.orchestrator.cancel("vm1").unwrap();
    assert!(record.cancel_requested);

    let record = h.settle("vm1").await.unwrap();
    assert_eq!(record.state, VmState::Failed);
    assert_eq!(record.last_error.as_deref(), Some("cancelled"));
    assert!(!record.cancel_requested);
    assert!(!h.backend.has_domain("vm1"));
    assert!(!h.root_image("vm1").exists());
    assert_eq!(h.backend.count(Op::Start), 0);
}

#[tokio::test]
async fn delete_during_provisioning_cancels_then_removes() {
    let h = Harness::new();
    h.backend.delay(Op::Create, Duration::from_millis(300));
    h.orchestrator.submit(request("vm1")).await.unwrap();
    h.wait_for_state("vm1", VmState::Creating).await;

    h.orchestrator.delete("vm1").unwrap();
    assert!(h.settle("vm1").await.is_none());
    assert!(!h.backend.has_domain("vm1"));
    assert!(!h.root_image("vm1").exists());
}

#[tokio::test]
async fn cancel_outside_provisioning_is_invalid() {
    let h = Harness::new();
    h.submit_and_settle(request("vm1")).await;
    let err = h.orchestrator.cancel("vm1").unwrap_err();
    assert!(matches!(err, ProvError::InvalidState { .. }));

    let err = h.orchestrator.cancel("ghost").unwrap_err();
    assert!(matches!(err, ProvError::NotFound { .. }));
}

#[tokio::test]
async fn stop_and_start_cycle() {
    let h = Harness::new();
    h.submit_and_settle(request("vm1")).await;

    h.orchestrator.stop("vm1", false).unwrap();
    let record = h.settle("vm1").await.unwrap();
    assert_eq!(record.state, VmState::Stopped);
    assert!(!h.backend.is_running("vm1"));
    assert!(h.backend.calls().contains(&Call::Stop {
        name: "vm1".into(),
        graceful: true,
    }));

    // Stopping again is not allowed from Stopped.
    let err = h.orchestrator.stop("vm1", true).unwrap_err();
    assert!(matches!(err, ProvError::InvalidState { .. }));

    h.orchestrator.start("vm1").unwrap();
    let record = h.settle("vm1").await.unwrap();
    assert_eq!(record.state, VmState::Running);
    assert!(h.backend.is_running("vm1"));
    assert_eq!(h.backend.count(Op::Create), 1);

    h.orchestrator.stop("vm1", true).unwrap();
    h.settle("vm1").await.unwrap();
    assert!(h.backend.calls().contains(&Call::Stop {
        name: "vm1".into(),
        graceful: false,
    }));
}

#[tokio::test]
async fn lifecycle_retries_leave_attempt_alone() {
    let h = Harness::new();
    h.submit_and_settle(request("vm1")).await;

    h.backend.fail_next(Op::Stop, transient());
    h.orchestrator.stop("vm1", false).unwrap();
    let record = h.settle("vm1").await.unwrap();
    assert_eq!(record.state, VmState::Stopped);
    assert_eq!(record.attempt, 1);
    assert!(h.backend.count(Op::Stop) >= 2);
}

#[tokio::test]
async fn start_refuses_missing_image() {
    let h = Harness::new();
    h.submit_and_settle(request("vm1")).await;
    h.orchestrator.stop("vm1", true).unwrap();
    h.settle("vm1").await.unwrap();

    std::fs::remove_file(h.root_image("vm1")).unwrap();
    h.orchestrator.start("vm1").unwrap();
    let record = h.settle("vm1").await.unwrap();
    assert_eq!(record.state, VmState::Failed);
    assert!(!h.backend.is_running("vm1"));
}

#[tokio::test]
async fn lifecycle_calls_are_busy_while_in_progress() {
    let h = Harness::new();
    h.backend.delay(Op::Create, Duration::from_millis(200));
    h.orchestrator.submit(request("vm1")).await.unwrap();

    let err = h.orchestrator.stop("vm1", false).unwrap_err();
    assert!(matches!(err, ProvError::Busy { .. }));
    h.settle("vm1").await.unwrap();
}

#[tokio::test]
async fn records_survive_reopen() {
    let h = Harness::new();
    h.submit_and_settle(request("vm1")).await;

    let reopened = build(h.dir.path(), h.backend.clone(), fast_policy());
    let record = reopened.get("vm1").unwrap();
    assert_eq!(record.state, VmState::Running);
    assert!(record.disk.is_some());
}

#[tokio::test]
async fn interrupted_attempt_is_failed_on_reopen() {
    let h = Harness::new();
    h.backend.delay(Op::Create, Duration::from_secs(2));
    h.orchestrator.submit(request("vm1")).await.unwrap();
    h.wait_for_state("vm1", VmState::Creating).await;

    let reopened = build(h.dir.path(), Arc::new(MemoryBackend::new()), fast_policy());
    let record = reopened.get("vm1").unwrap();
    assert_eq!(record.state, VmState::Failed);
    assert!(!record.in_progress);
    assert!(record.last_error.unwrap().contains("interrupted"));
    assert!(record.rollback_incomplete);
}

#[tokio::test]
async fn reconcile_notices_shut_off_and_missing_domains() {
    let h = Harness::new();
    h.submit_and_settle(request("vm1")).await;
    h.submit_and_settle(request("vm2")).await;

    h.backend.power_off("vm1");
    let vm2 = h.orchestrator.get("vm2").unwrap();
    h.backend.destroy_domain(&vm2.domain.unwrap()).await.unwrap();

    let report = h.orchestrator.reconcile().await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.shut_off, ["vm1"]);
    assert_eq!(report.missing, ["vm2"]);

    assert_eq!(h.orchestrator.get("vm1").unwrap().state, VmState::Stopped);
    let vm2 = h.orchestrator.get("vm2").unwrap();
    assert_eq!(vm2.state, VmState::Failed);
    assert!(vm2.domain.is_none());
}

#[tokio::test]
async fn attempt_log_is_written() {
    let h = Harness::new();
    h.submit_and_settle(request("vm1")).await;

    let log = h.orchestrator.latest_log("vm1").unwrap();
    let name = log.file_name().unwrap().to_str().unwrap().to_string();
    assert!(name.contains("attempt-1"));
    assert!(name.ends_with("_ok.log"));
    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(contents.contains("domain started"));
}
