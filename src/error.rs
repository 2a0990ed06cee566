use std::fmt;

/// Crate-wide error type for the migration orchestrator.
///
/// Variants map 1:1 onto the cluster-visible error codes in the external
/// interface contract; [`MigrateError::code`] returns that wire string.
#[derive(Debug, Clone)]
pub enum MigrateError {
    TooManyStorageMigrates(u32),
    SrDoesNotSupportMigration(String),
    VdiCbtEnabled(String),
    VdiIsEncrypted(String),
    VdiOnBootModeIncompatible(String),
    VdiNotInMap(String),
    VifNotInMap(String),
    VmHasLegacyHardware(String),
    CpuFeatureSetIncompatible(String),
    VdiLocationMissing(String),
    LocationNotUnique(String),
    MirrorFailed(String),
    SuspendImageNotAccessible(String),
    HostDisabled(String),
    VmHostIncompatibleVersionMigrate(String),
    VmBadPowerState {
        vm: String,
        expected: String,
        actual: String,
    },
    VmMigrateFailed(String),
    UnimplementedInSmBackend(String),
    CannotContactHost(String),
    HostHasNoManagementIp(String),
    OperationNotAllowed(String),
    /// `VGPU_mapping` translated per the vGPU mapper's explicit failure mode.
    VgpuMapping(String),
    /// Cooperative cancellation raised at a cancellation checkpoint.
    Cancelled,
    /// A storage backend error, re-raised with its original code/params.
    StorageBackend(String, Vec<String>),
    InvalidConfig,
    ConfigError(String),
    VmNotFound(String),
    NotFound(String),
    IoError(std::io::Error),
    SerdeError(String),
    Internal(String),
}

impl fmt::Display for MigrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrateError::TooManyStorageMigrates(n) => {
                write!(f, "too many concurrent storage migrations (limit {})", n)
            }
            MigrateError::SrDoesNotSupportMigration(sr) => {
                write!(f, "SR '{}' does not support migration", sr)
            }
            MigrateError::VdiCbtEnabled(vdi) => {
                write!(f, "VDI '{}' has changed-block-tracking enabled", vdi)
            }
            MigrateError::VdiIsEncrypted(vdi) => write!(f, "VDI '{}' is encrypted", vdi),
            MigrateError::VdiOnBootModeIncompatible(vdi) => write!(
                f,
                "VDI '{}' has on_boot=reset, incompatible with migration",
                vdi
            ),
            MigrateError::VdiNotInMap(vdi) => write!(f, "VDI '{}' not in map", vdi),
            MigrateError::VifNotInMap(vif) => write!(f, "VIF '{}' not in map", vif),
            MigrateError::VmHasLegacyHardware(vm) => write!(
                f,
                "VM '{}' has legacy hardware attached, incompatible with migration",
                vm
            ),
            MigrateError::CpuFeatureSetIncompatible(host) => write!(
                f,
                "destination host '{}' CPU featureset is incompatible with the source",
                host
            ),
            MigrateError::VdiLocationMissing(loc) => {
                write!(f, "no VDI found at location '{}' on destination SR", loc)
            }
            MigrateError::LocationNotUnique(loc) => write!(
                f,
                "more than one VDI found at location '{}' on destination SR",
                loc
            ),
            MigrateError::MirrorFailed(vdi) => write!(f, "mirror failed for VDI '{}'", vdi),
            MigrateError::SuspendImageNotAccessible(vdi) => {
                write!(f, "suspend image VDI '{}' not accessible from source host", vdi)
            }
            MigrateError::HostDisabled(host) => write!(f, "host '{}' is disabled", host),
            MigrateError::VmHostIncompatibleVersionMigrate(msg) => {
                write!(f, "incompatible host platform version: {}", msg)
            }
            MigrateError::VmBadPowerState {
                vm,
                expected,
                actual,
            } => write!(
                f,
                "VM '{}' has power state '{}', expected '{}'",
                vm, actual, expected
            ),
            MigrateError::VmMigrateFailed(msg) => write!(f, "VM migration failed: {}", msg),
            MigrateError::UnimplementedInSmBackend(code) => {
                write!(f, "operation '{}' not implemented in SM backend", code)
            }
            MigrateError::CannotContactHost(host) => write!(f, "cannot contact host '{}'", host),
            MigrateError::HostHasNoManagementIp(host) => {
                write!(f, "host '{}' has no management IP", host)
            }
            MigrateError::OperationNotAllowed(msg) => write!(f, "operation not allowed: {}", msg),
            MigrateError::VgpuMapping(msg) => write!(f, "vGPU mapping failed: {}", msg),
            MigrateError::Cancelled => write!(f, "task cancelled"),
            MigrateError::StorageBackend(code, params) => {
                write!(f, "storage backend error {}: {}", code, params.join(", "))
            }
            MigrateError::InvalidConfig => write!(f, "invalid configuration"),
            MigrateError::ConfigError(msg) => write!(f, "configuration error: {}", msg),
            MigrateError::VmNotFound(vm) => write!(f, "VM '{}' not found", vm),
            MigrateError::NotFound(what) => write!(f, "not found: {}", what),
            MigrateError::IoError(err) => write!(f, "IO error: {}", err),
            MigrateError::SerdeError(err) => write!(f, "serialization error: {}", err),
            MigrateError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for MigrateError {}

impl From<std::io::Error> for MigrateError {
    fn from(err: std::io::Error) -> Self {
        MigrateError::IoError(err)
    }
}

impl From<toml::de::Error> for MigrateError {
    fn from(err: toml::de::Error) -> Self {
        MigrateError::SerdeError(err.to_string())
    }
}

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        MigrateError::SerdeError(err.to_string())
    }
}

impl MigrateError {
    /// The stable wire code a cluster client would see for this error,
    /// matching the contract in the external-interfaces section.
    pub fn code(&self) -> &'static str {
        match self {
            MigrateError::TooManyStorageMigrates(_) => "too_many_storage_migrates",
            MigrateError::SrDoesNotSupportMigration(_) => "sr_does_not_support_migration",
            MigrateError::VdiCbtEnabled(_) => "vdi_cbt_enabled",
            MigrateError::VdiIsEncrypted(_) => "vdi_is_encrypted",
            MigrateError::VdiOnBootModeIncompatible(_) => {
                "vdi_on_boot_mode_incompatible_with_operation"
            }
            MigrateError::VdiNotInMap(_) => "vdi_not_in_map",
            MigrateError::VifNotInMap(_) => "vif_not_in_map",
            MigrateError::VmHasLegacyHardware(_) => "vm_has_legacy_hardware",
            MigrateError::CpuFeatureSetIncompatible(_) => "vm_incompatible_with_this_host",
            MigrateError::VdiLocationMissing(_) => "vdi_location_missing",
            MigrateError::LocationNotUnique(_) => "location_not_unique",
            MigrateError::MirrorFailed(_) => "mirror_failed",
            MigrateError::SuspendImageNotAccessible(_) => "suspend_image_not_accessible",
            MigrateError::HostDisabled(_) => "host_disabled",
            MigrateError::VmHostIncompatibleVersionMigrate(_) => {
                "vm_host_incompatible_version_migrate"
            }
            MigrateError::VmBadPowerState { .. } => "vm_bad_power_state",
            MigrateError::VmMigrateFailed(_) => "vm_migrate_failed",
            MigrateError::UnimplementedInSmBackend(_) => "unimplemented_in_sm_backend",
            MigrateError::CannotContactHost(_) => "cannot_contact_host",
            MigrateError::HostHasNoManagementIp(_) => "host_has_no_management_ip",
            MigrateError::OperationNotAllowed(_) => "operation_not_allowed",
            MigrateError::VgpuMapping(_) => "vm_migrate_failed",
            MigrateError::Cancelled => "cancelled",
            MigrateError::StorageBackend(..) => "sr_backend_failure",
            MigrateError::InvalidConfig | MigrateError::ConfigError(_) => "invalid_config",
            MigrateError::VmNotFound(_) => "vm_not_found",
            MigrateError::NotFound(_) => "not_found",
            MigrateError::IoError(_) => "io_error",
            MigrateError::SerdeError(_) => "serde_error",
            MigrateError::Internal(_) => "internal_error",
        }
    }
}
