use std::path::Path;

use crate::backend::DomainSpec;
use crate::config::LibvirtConfig;
use crate::model::{DiskImage, NetworkMode};

/// Generate libvirt domain XML for `spec`.
pub fn generate_domain_xml(spec: &DomainSpec, libvirt: &LibvirtConfig) -> String {
    let name = &spec.name;
    let memory_kib = spec.memory_mib * 1024;
    let cpus = spec.vcpu_count;
    let domain_type = &libvirt.domain_type;
    let machine = &libvirt.machine;
    let root = escape_attr(&spec.root_disk.display().to_string());
    let interface = interface_xml(spec.network_mode, libvirt);

    format!(
        r#"<domain type='{domain_type}'>
  <name>{name}</name>
  <memory unit='KiB'>{memory_kib}</memory>
  <vcpu>{cpus}</vcpu>
  <os>
    <type arch='x86_64' machine='{machine}'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{root}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
{interface}
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
"#
    )
}

fn interface_xml(mode: NetworkMode, libvirt: &LibvirtConfig) -> String {
    let source = match mode {
        NetworkMode::Bridged => format!(
            "    <interface type='bridge'>\n      <source bridge='{}'/>",
            escape_attr(&libvirt.bridge)
        ),
        NetworkMode::Nat => format!(
            "    <interface type='network'>\n      <source network='{}'/>",
            escape_attr(&libvirt.nat_network)
        ),
        NetworkMode::Isolated => format!(
            "    <interface type='network'>\n      <source network='{}'/>",
            escape_attr(&libvirt.isolated_network)
        ),
    };
    format!("{source}\n      <model type='virtio'/>\n    </interface>")
}

/// Device XML for hot-plugging or persistently attaching a data disk.
pub fn disk_device_xml(disk: &DiskImage) -> String {
    let path = escape_attr(&disk.path.display().to_string());
    let target = &disk.target;
    format!(
        r#"<disk type='file' device='disk'>
  <driver name='qemu' type='qcow2'/>
  <source file='{path}'/>
  <target dev='{target}' bus='virtio'/>
</disk>
"#
    )
}

/// Whether a domain's XML description uses `disk` as a file source.
pub fn references_disk(domain_xml: &str, disk: &Path) -> bool {
    let path = escape_attr(&disk.display().to_string());
    domain_xml.contains(&format!("file='{path}'")) || domain_xml.contains(&format!("file=\"{path}\""))
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}
