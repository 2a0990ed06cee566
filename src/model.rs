//! Entity model shared by every component: opaque references, VM/VDI/SR/VBD/
//! VIF/VGPU records, the destination descriptor, mirror bookkeeping, and the
//! resolved migration plan.
//!
//! Entities are always identified by opaque reference and resolved through
//! [`crate::collaborators::Database`] — the orchestrator never holds an
//! owning pointer from one entity to another, which sidesteps the cyclic
//! VM ↔ VBD ↔ VDI ↔ SR relationships the cluster database maintains.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

macro_rules! opaque_ref {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

opaque_ref!(VmRef);
opaque_ref!(VdiRef);
opaque_ref!(SrRef);
opaque_ref!(VbdRef);
opaque_ref!(VifRef);
opaque_ref!(NetworkRef);
opaque_ref!(VgpuRef);
opaque_ref!(GpuGroupRef);
opaque_ref!(HostRef);
opaque_ref!(PoolRef);
opaque_ref!(DatapathHandle);
opaque_ref!(TaskHandle);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Halted,
    Suspended,
    Running,
    Paused,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::Halted => "Halted",
            PowerState::Suspended => "Suspended",
            PowerState::Running => "Running",
            PowerState::Paused => "Paused",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnBoot {
    Persist,
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VbdMode {
    Ro,
    Rw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VbdType {
    Disk,
    Cd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SrCapability {
    VdiSnapshot,
    VdiMirror,
    VdiMirrorIn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sr {
    pub sr_ref: SrRef,
    pub sr_type: String,
    pub capabilities: HashSet<SrCapability>,
}

impl Sr {
    pub fn supports(&self, caps: &[SrCapability]) -> bool {
        caps.iter().all(|c| self.capabilities.contains(c))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vdi {
    pub vdi_ref: VdiRef,
    pub uuid: String,
    /// Opaque storage-backend location string within the SR (not the UUID).
    pub location: String,
    pub sr: SrRef,
    pub virtual_size: u64,
    pub on_boot: OnBoot,
    pub cbt_enabled: bool,
    pub sm_config: HashMap<String, String>,
    pub snapshot_of: Option<VdiRef>,
    pub snapshot_time: chrono::DateTime<chrono::Utc>,
}

impl Vdi {
    pub fn is_encrypted(&self) -> bool {
        self.sm_config.contains_key("key_hash")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vbd {
    pub vbd_ref: VbdRef,
    pub vm: VmRef,
    pub vdi: Option<VdiRef>,
    pub mode: VbdMode,
    pub ty: VbdType,
    pub empty: bool,
}

impl Vbd {
    /// Leaf VBDs are the non-empty, non-CD disks attached to the live VM.
    pub fn is_leaf_disk(&self) -> bool {
        !self.empty && matches!(self.ty, VbdType::Disk)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vif {
    pub vif_ref: VifRef,
    pub vm: VmRef,
    pub network: NetworkRef,
    pub mac: String,
    pub device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vgpu {
    pub vgpu_ref: VgpuRef,
    pub vm: VmRef,
    pub gpu_group: GpuGroupRef,
    /// Matches the guest-visible device label used by the hypervisor agent,
    /// e.g. "0", "1".
    pub device_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub vm_ref: VmRef,
    pub uuid: String,
    pub power_state: PowerState,
    pub is_snapshot: bool,
    pub is_a_template: bool,
    pub suspend_vdi: Option<VdiRef>,
    pub ha_always_run: bool,
    pub other_config: HashMap<String, String>,
    pub resident_on: Option<HostRef>,
    /// Set when the VM has a PCI/USB passthrough device, a pass-through GPU
    /// without vGPU virtualization, or another device tied to the source
    /// host's physical hardware. Precondition 2 rejects migration outright.
    pub has_legacy_hardware: bool,
}

/// Parsed and classified destination handshake. Produced by the
/// destination descriptor resolver (component A); purely derived, no
/// side effects on the database.
#[derive(Debug, Clone)]
pub struct DestDescriptor {
    pub master_url: String,
    pub xenops_url: String,
    pub sm_url: String,
    pub session_handle: String,
    pub dest_host_ref: HostRef,
    pub remote_ip: String,
    pub remote_master_ip: String,
    pub cross_cluster: bool,
}

/// Bookkeeping for a single VDI once its mirror or copy task has completed.
#[derive(Debug, Clone)]
pub struct MirrorRecord {
    pub source_vdi: VdiRef,
    pub mirrored: bool,
    pub datapath: Option<DatapathHandle>,
    pub local_sr: SrRef,
    pub local_vdi: VdiRef,
    pub remote_sr: SrRef,
    pub remote_vdi_ref: VdiRef,
    pub remote_vdi_location: String,
    pub local_xenops_locator: String,
    pub remote_xenops_locator: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdiRole {
    Leaf { mirror: bool },
    Snapshot,
    Suspend,
}

/// A single VDI entry in the resolved disk-transfer plan, already ordered.
#[derive(Debug, Clone)]
pub struct VdiMirrorRequest {
    pub vdi: VdiRef,
    pub role: VdiRole,
    pub source_sr: SrRef,
    pub dest_sr: SrRef,
    pub virtual_size: u64,
    pub snapshot_time: chrono::DateTime<chrono::Utc>,
    /// The owning leaf VDI, used to group snapshot-chain replication calls.
    pub leaf_vdi: VdiRef,
}

/// One or two `(device_label, pci_address)` pairs produced per VGPU by the
/// vGPU mapper, both locally (for the hypervisor-agent call) and remotely
/// (stamped into the metadata export for cross-cluster migrations).
#[derive(Debug, Clone)]
pub struct VgpuPciMapping {
    pub vgpu: VgpuRef,
    pub local: Vec<(String, String)>,
    pub remote_gpu_group: Option<GpuGroupRef>,
}

/// The fully resolved plan produced by components A–C, consumed by D–I.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Ascending by (virtual_size, snapshot_time) — see Disk Mirror Planner.
    pub vdi_requests: Vec<VdiMirrorRequest>,
    pub vif_map: HashMap<VifRef, NetworkRef>,
    pub vgpu_map: Vec<VgpuPciMapping>,
    pub dest: DestDescriptor,
}

/// Parsed and defaulted options bag (component B.10).
#[derive(Debug, Clone, Copy)]
pub struct MigrateOptions {
    pub force: bool,
    pub copy: bool,
    pub compress: bool,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            force: false,
            copy: false,
            compress: false,
        }
    }
}

/// Parses one of the recognized truthy/falsy option tokens, case-insensitively.
pub fn parse_bool_option(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "on" | "1" => Some(true),
        "false" | "off" | "0" => Some(false),
        _ => None,
    }
}
