use std::time::{Duration, Instant};

use async_trait::async_trait;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{self as virt_error, ErrorNumber};
use virt::network::Network;

use super::{ControlPlane, DomainSpec, DomainStatus};
use crate::config::LibvirtConfig;
use crate::error::ControlPlaneError;
use crate::model::{DiskImage, DomainHandle, NetworkMode};
use crate::{domain_xml, network_xml};

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

/// Drives a libvirt daemon. Every call opens its own connection on a
/// blocking thread, so a wedged call never blocks another VM's progress.
pub struct LibvirtBackend {
    config: LibvirtConfig,
}

impl LibvirtBackend {
    pub fn new(config: LibvirtConfig) -> Self {
        Self { config }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, ControlPlaneError>
    where
        T: Send + 'static,
        F: FnOnce(&LibvirtConfig, &Connect) -> Result<T, ControlPlaneError> + Send + 'static,
    {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let conn = connect(&config.uri)?;
            f(&config, &conn)
        })
        .await
        .map_err(|e| ControlPlaneError::Transient {
            message: format!("libvirt worker task failed: {e}"),
        })?
    }
}

#[async_trait]
impl ControlPlane for LibvirtBackend {
    async fn create_domain(&self, spec: &DomainSpec) -> Result<DomainHandle, ControlPlaneError> {
        let spec = spec.clone();
        self.run(move |config, conn| {
            ensure_network(conn, config, spec.network_mode)?;

            if let Ok(dom) = Domain::lookup_by_name(conn, &spec.name) {
                let xml = dom
                    .get_xml_desc(0)
                    .map_err(|e| classify(e, "reading domain XML", "check libvirt permissions"))?;
                if domain_xml::references_disk(&xml, &spec.root_disk) {
                    tracing::info!(name = %spec.name, "adopting existing domain");
                    return handle_of(&dom, &spec.name);
                }
                return Err(ControlPlaneError::Permanent {
                    message: format!(
                        "a domain named '{}' already exists with a different root disk",
                        spec.name
                    ),
                    hint: format!("remove it with `virsh undefine {}` or pick another name", spec.name),
                });
            }

            let xml = domain_xml::generate_domain_xml(&spec, config);
            let dom = Domain::define_xml(conn, &xml).map_err(|e| ControlPlaneError::Permanent {
                message: format!("failed to define domain: {e}"),
                hint: "check the generated domain XML for errors".into(),
            })?;
            tracing::info!(name = %spec.name, "domain defined");
            handle_of(&dom, &spec.name)
        })
        .await
    }

    async fn start_domain(&self, handle: &DomainHandle) -> Result<(), ControlPlaneError> {
        let name = handle.name.clone();
        self.run(move |_, conn| {
            let dom = lookup(conn, &name)?;
            if is_running(&dom) {
                tracing::info!(name, "domain already running");
                return Ok(());
            }
            dom.create().map_err(|e| {
                classify(
                    e,
                    "failed to start domain",
                    &format!("check `virsh start {name}` for details"),
                )
            })?;
            tracing::info!(name, "domain started");
            Ok(())
        })
        .await
    }

    async fn stop_domain(
        &self,
        handle: &DomainHandle,
        graceful: bool,
    ) -> Result<(), ControlPlaneError> {
        let name = handle.name.clone();
        self.run(move |config, conn| {
            let dom = lookup(conn, &name)?;
            if !is_running(&dom) {
                return Ok(());
            }

            if graceful {
                tracing::info!(name, "sending ACPI shutdown");
                dom.shutdown()
                    .map_err(|e| classify(e, "shutdown failed", "VM may not have ACPI support"))?;

                let deadline = Instant::now() + Duration::from_secs(config.shutdown_timeout_s);
                while Instant::now() < deadline {
                    if !is_running(&dom) {
                        tracing::info!(name, "domain shut down");
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
                tracing::warn!(name, "ACPI shutdown timed out, force stopping");
            }

            dom.destroy()
                .map_err(|e| classify(e, "force stop failed", "check libvirt permissions"))?;
            tracing::info!(name, "domain force stopped");
            Ok(())
        })
        .await
    }

    async fn destroy_domain(&self, handle: &DomainHandle) -> Result<(), ControlPlaneError> {
        let name = handle.name.clone();
        self.run(move |_, conn| {
            let dom = lookup(conn, &name)?;
            if is_running(&dom) {
                dom.destroy()
                    .map_err(|e| classify(e, "force stop failed", "check libvirt permissions"))?;
            }
            dom.undefine()
                .map_err(|e| classify(e, "failed to undefine domain", "check libvirt permissions"))?;
            tracing::info!(name, "domain undefined");
            Ok(())
        })
        .await
    }

    async fn domain_status(&self, handle: &DomainHandle) -> Result<DomainStatus, ControlPlaneError> {
        let name = handle.name.clone();
        self.run(move |_, conn| {
            let dom = lookup(conn, &name)?;
            let (state, _reason) = dom
                .get_state()
                .map_err(|e| classify(e, "failed to read domain state", "check libvirt permissions"))?;
            Ok(match state {
                virt::sys::VIR_DOMAIN_RUNNING => DomainStatus::Running,
                virt::sys::VIR_DOMAIN_PAUSED => DomainStatus::Paused,
                virt::sys::VIR_DOMAIN_SHUTOFF => DomainStatus::ShutOff,
                virt::sys::VIR_DOMAIN_CRASHED => DomainStatus::Crashed,
                _ => DomainStatus::Other,
            })
        })
        .await
    }

    async fn list_domains(&self) -> Result<Vec<String>, ControlPlaneError> {
        self.run(|_, conn| {
            let domains = conn
                .list_all_domains(0)
                .map_err(|e| classify(e, "failed to list domains", "check libvirt permissions"))?;
            domains
                .iter()
                .map(|dom| {
                    dom.get_name()
                        .map_err(|e| classify(e, "failed to read domain name", "check libvirt permissions"))
                })
                .collect()
        })
        .await
    }

    async fn attach_disk(
        &self,
        handle: &DomainHandle,
        disk: &DiskImage,
    ) -> Result<(), ControlPlaneError> {
        let name = handle.name.clone();
        let disk = disk.clone();
        self.run(move |_, conn| {
            let dom = lookup(conn, &name)?;
            let current = dom
                .get_xml_desc(0)
                .map_err(|e| classify(e, "reading domain XML", "check libvirt permissions"))?;
            if domain_xml::references_disk(&current, &disk.path) {
                return Ok(());
            }
            let xml = domain_xml::disk_device_xml(&disk);
            dom.attach_device_flags(&xml, virt::sys::VIR_DOMAIN_AFFECT_CONFIG)
                .map_err(|e| {
                    classify(
                        e,
                        "failed to attach disk",
                        &format!("check that {} is readable by libvirt", disk.path.display()),
                    )
                })?;
            tracing::info!(name, target = %disk.target, "data disk attached");
            Ok(())
        })
        .await
    }
}

fn connect(uri: &str) -> Result<ConnGuard, ControlPlaneError> {
    // Suppress libvirt's default error handler that prints to stderr.
    virt_error::clear_error_callback();

    Connect::open(Some(uri))
        .map(ConnGuard)
        .map_err(|e| ControlPlaneError::Transient {
            message: format!("failed to connect to libvirt at {uri}: {e}"),
        })
}

fn lookup(conn: &Connect, name: &str) -> Result<Domain, ControlPlaneError> {
    Domain::lookup_by_name(conn, name).map_err(|_| ControlPlaneError::NotFound {
        name: name.to_string(),
    })
}

fn handle_of(dom: &Domain, name: &str) -> Result<DomainHandle, ControlPlaneError> {
    let uuid = dom
        .get_uuid_string()
        .map_err(|e| classify(e, "failed to read domain uuid", "check libvirt permissions"))?;
    Ok(DomainHandle {
        name: name.to_string(),
        uuid,
    })
}

fn is_running(dom: &Domain) -> bool {
    dom.is_active().unwrap_or(false)
}

/// Timeouts and dropped connections are retryable; everything else fails
/// the same way on a second try.
fn classify(e: virt::error::Error, what: &str, hint: &str) -> ControlPlaneError {
    match e.code() {
        ErrorNumber::OperationTimeout
        | ErrorNumber::NoConnect
        | ErrorNumber::Rpc
        | ErrorNumber::SystemError => ControlPlaneError::Transient {
            message: format!("{what}: {e}"),
        },
        _ => ControlPlaneError::Permanent {
            message: format!("{what}: {e}"),
            hint: hint.to_string(),
        },
    }
}

fn ensure_network(
    conn: &Connect,
    config: &LibvirtConfig,
    mode: NetworkMode,
) -> Result<(), ControlPlaneError> {
    let name = match mode {
        // Host bridges are managed outside libvirt.
        NetworkMode::Bridged => return Ok(()),
        NetworkMode::Nat => config.nat_network.as_str(),
        NetworkMode::Isolated => config.isolated_network.as_str(),
    };

    let net = match Network::lookup_by_name(conn, name) {
        Ok(net) => net,
        Err(_) if mode == NetworkMode::Isolated => {
            let subnet = network_xml::derive_subnet(name);
            let xml = network_xml::generate_network_xml(name, &subnet)?;
            let net = Network::define_xml(conn, &xml).map_err(|e| ControlPlaneError::Permanent {
                message: format!("failed to define network '{name}': {e}"),
                hint: format!("check that {subnet}.0/24 does not overlap an existing network"),
            })?;
            tracing::info!(network = name, subnet, "isolated network defined");
            net
        }
        Err(_) => {
            return Err(ControlPlaneError::Permanent {
                message: format!("network '{name}' not found"),
                hint: format!(
                    "run `sudo virsh net-define /usr/share/libvirt/networks/default.xml && sudo virsh net-start {name}`"
                ),
            });
        }
    };

    if !net.is_active().unwrap_or(false) {
        tracing::info!(network = name, "starting inactive network");
        net.create().map_err(|e| {
            classify(
                e,
                &format!("failed to start network '{name}'"),
                &format!("try `sudo virsh net-start {name}`"),
            )
        })?;
    }

    Ok(())
}
