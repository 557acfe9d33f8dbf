//! Libvirt network XML generation using facet-xml struct serialization.

use facet::Facet;
use facet_xml as xml;

use crate::error::ControlPlaneError;

// ── XML model structs ──────────────────────────────────────

/// A network with no `<forward>` element, which libvirt treats as isolated:
/// guests reach each other and the host, nothing else.
#[derive(Debug, Facet)]
#[facet(rename = "network")]
struct NetworkDef {
    name: String,
    ip: NetworkIp,
}

#[derive(Debug, Facet)]
struct NetworkIp {
    #[facet(xml::attribute)]
    address: String,
    #[facet(xml::attribute)]
    netmask: String,
    dhcp: NetworkDhcp,
}

#[derive(Debug, Facet)]
struct NetworkDhcp {
    range: DhcpRange,
}

#[derive(Debug, Facet)]
struct DhcpRange {
    #[facet(xml::attribute)]
    start: String,
    #[facet(xml::attribute)]
    end: String,
}

// ── public API ─────────────────────────────────────────────

/// Generate libvirt network XML for an isolated network with DHCP.
pub fn generate_network_xml(name: &str, subnet: &str) -> Result<String, ControlPlaneError> {
    let net = NetworkDef {
        name: name.into(),
        ip: NetworkIp {
            address: format!("{subnet}.1"),
            netmask: "255.255.255.0".into(),
            dhcp: NetworkDhcp {
                range: DhcpRange {
                    start: format!("{subnet}.100"),
                    end: format!("{subnet}.254"),
                },
            },
        },
    };

    facet_xml::to_string(&net).map_err(|e| ControlPlaneError::Permanent {
        message: format!("failed to serialize network XML for '{name}': {e}"),
        hint: "check libvirt.isolated_network in the config".into(),
    })
}

/// Derive a /24 subnet prefix (first 3 octets) from the network name, so the
/// same name always lands on the same `192.168.<n>` range.
pub fn derive_subnet(name: &str) -> String {
    let mut hash: u32 = 5381;
    for b in name.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    let octet = (hash % 253) + 2; // 2..254
    format!("192.168.{octet}")
}
