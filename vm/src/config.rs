use std::path::{Path, PathBuf};

use haven_service::CpuTopology;
use serde::{Deserialize, Serialize};

use crate::error::VmError;
use crate::fs;

/// Current version of the persisted config record. Readers reject anything
/// newer; older records deserialize with field defaults.
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugLevel {
    /// Production mode; no debugging facilities inside the VM.
    #[default]
    None,
    /// Full debugging; required for output capture.
    Full,
}

/// Immutable description of a VM's identity and resources.
///
/// Fields fall in two classes. Identity-affecting fields (payload location
/// and entry point, debug level, protection, encrypted-storage size, output
/// capture) feed the VM's secrets; two configs are *compatible* iff all of
/// them are equal. Resource-affecting fields (memory, CPU topology) may
/// differ between compatible configs and can be swapped on a stopped VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Owning application whose bundle carries the payload. Exactly one of
    /// `owner` and `payload_archive` is set.
    #[serde(default)]
    pub(crate) owner: Option<String>,
    #[serde(default)]
    pub(crate) payload_archive: Option<PathBuf>,
    #[serde(default)]
    pub(crate) extra_archives: Vec<PathBuf>,
    /// Entry point: exactly one of `payload_binary` and `payload_config_path`
    /// is set.
    #[serde(default)]
    pub(crate) payload_binary: Option<String>,
    #[serde(default)]
    pub(crate) payload_config_path: Option<String>,
    #[serde(default)]
    pub(crate) debug_level: DebugLevel,
    pub(crate) protected: bool,
    /// Zero means encrypted storage is disabled.
    #[serde(default)]
    pub(crate) encrypted_storage_bytes: u64,
    #[serde(default)]
    pub(crate) output_captured: bool,
    #[serde(default)]
    pub(crate) memory_bytes: Option<u64>,
    #[serde(default)]
    pub(crate) cpu_topology: CpuTopology,
}

/// Wire form of the persisted record: the config plus a version tag.
#[derive(Serialize, Deserialize)]
struct PersistedConfig {
    version: u32,
    #[serde(flatten)]
    config: VmConfig,
}

impl VmConfig {
    pub fn builder() -> VmConfigBuilder {
        VmConfigBuilder::default()
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn payload_archive(&self) -> Option<&Path> {
        self.payload_archive.as_deref()
    }

    pub fn extra_archives(&self) -> &[PathBuf] {
        &self.extra_archives
    }

    pub fn payload_binary(&self) -> Option<&str> {
        self.payload_binary.as_deref()
    }

    pub fn payload_config_path(&self) -> Option<&str> {
        self.payload_config_path.as_deref()
    }

    pub fn debug_level(&self) -> DebugLevel {
        self.debug_level
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn is_encrypted_storage_enabled(&self) -> bool {
        self.encrypted_storage_bytes > 0
    }

    pub fn encrypted_storage_bytes(&self) -> u64 {
        self.encrypted_storage_bytes
    }

    pub fn is_output_captured(&self) -> bool {
        self.output_captured
    }

    pub fn memory_bytes(&self) -> Option<u64> {
        self.memory_bytes
    }

    pub fn cpu_topology(&self) -> CpuTopology {
        self.cpu_topology
    }

    /// Whether `other` may replace this config on a stopped VM without
    /// changing the VM's identity or secrets. Symmetric by construction:
    /// only identity-affecting fields are compared, for equality.
    pub fn is_compatible_with(&self, other: &VmConfig) -> bool {
        self.owner == other.owner
            && self.payload_archive == other.payload_archive
            && self.extra_archives == other.extra_archives
            && self.payload_binary == other.payload_binary
            && self.payload_config_path == other.payload_config_path
            && self.debug_level == other.debug_level
            && self.protected == other.protected
            && self.encrypted_storage_bytes == other.encrypted_storage_bytes
            && self.output_captured == other.output_captured
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, VmError> {
        let record = PersistedConfig {
            version: CONFIG_VERSION,
            config: self.clone(),
        };
        Ok(serde_json::to_vec_pretty(&record)?)
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, VmError> {
        #[derive(Deserialize)]
        struct VersionProbe {
            version: u32,
        }
        let probe: VersionProbe = serde_json::from_slice(bytes)?;
        if probe.version > CONFIG_VERSION {
            return Err(VmError::ConfigVersionTooNew {
                found: probe.version,
                supported: CONFIG_VERSION,
            });
        }
        let record: PersistedConfig = serde_json::from_slice(bytes)?;
        Ok(record.config)
    }

    pub(crate) async fn save(&self, path: &Path) -> Result<(), VmError> {
        let bytes = self.to_bytes()?;
        fs::write(path, &bytes).await?;
        Ok(())
    }

    pub(crate) async fn load(path: &Path) -> Result<Self, VmError> {
        let bytes = fs::read(path).await?;
        Self::from_bytes(&bytes)
    }
}

/// Builder for [`VmConfig`].
///
/// `build` enforces the constraints the config cannot express on its own:
/// exactly one payload location, exactly one entry point, an explicit
/// protection choice, and output capture only under full debugging.
#[derive(Debug, Default, Clone)]
pub struct VmConfigBuilder {
    owner: Option<String>,
    payload_archive: Option<PathBuf>,
    extra_archives: Vec<PathBuf>,
    payload_binary: Option<String>,
    payload_config_path: Option<String>,
    debug_level: DebugLevel,
    protected: Option<bool>,
    encrypted_storage_bytes: u64,
    output_captured: bool,
    memory_bytes: Option<u64>,
    cpu_topology: CpuTopology,
}

impl VmConfigBuilder {
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn payload_archive(mut self, path: impl Into<PathBuf>) -> Self {
        self.payload_archive = Some(path.into());
        self
    }

    pub fn extra_archive(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_archives.push(path.into());
        self
    }

    pub fn payload_binary(mut self, name: impl Into<String>) -> Self {
        self.payload_binary = Some(name.into());
        self
    }

    pub fn payload_config_path(mut self, path: impl Into<String>) -> Self {
        self.payload_config_path = Some(path.into());
        self
    }

    pub fn debug_level(mut self, level: DebugLevel) -> Self {
        self.debug_level = level;
        self
    }

    /// Protection has no default: callers must make the security decision.
    pub fn protected(mut self, protected: bool) -> Self {
        self.protected = Some(protected);
        self
    }

    pub fn encrypted_storage_bytes(mut self, bytes: u64) -> Self {
        self.encrypted_storage_bytes = bytes;
        self
    }

    pub fn capture_output(mut self, captured: bool) -> Self {
        self.output_captured = captured;
        self
    }

    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    pub fn cpu_topology(mut self, topology: CpuTopology) -> Self {
        self.cpu_topology = topology;
        self
    }

    pub fn build(self) -> Result<VmConfig, VmError> {
        match (&self.owner, &self.payload_archive) {
            (Some(_), Some(_)) => {
                return Err(VmError::InvalidConfig(
                    "owner and payload_archive may not both be set".into(),
                ));
            }
            (None, None) => {
                return Err(VmError::InvalidConfig(
                    "either owner or payload_archive must be set".into(),
                ));
            }
            _ => {}
        }

        match (&self.payload_binary, &self.payload_config_path) {
            (Some(_), Some(_)) => {
                return Err(VmError::InvalidConfig(
                    "payload_binary and payload_config_path may not both be set".into(),
                ));
            }
            (None, None) => {
                return Err(VmError::InvalidConfig(
                    "either payload_binary or payload_config_path must be set".into(),
                ));
            }
            _ => {}
        }

        if self.payload_config_path.is_some() && !self.extra_archives.is_empty() {
            return Err(VmError::InvalidConfig(
                "extra archives must be listed in the payload config file".into(),
            ));
        }

        let Some(protected) = self.protected else {
            return Err(VmError::InvalidConfig(
                "protected must be chosen explicitly".into(),
            ));
        };

        if self.output_captured && self.debug_level != DebugLevel::Full {
            return Err(VmError::InvalidConfig(
                "debug level must be Full to capture output".into(),
            ));
        }

        Ok(VmConfig {
            owner: self.owner,
            payload_archive: self.payload_archive,
            extra_archives: self.extra_archives,
            payload_binary: self.payload_binary,
            payload_config_path: self.payload_config_path,
            debug_level: self.debug_level,
            protected,
            encrypted_storage_bytes: self.encrypted_storage_bytes,
            output_captured: self.output_captured,
            memory_bytes: self.memory_bytes,
            cpu_topology: self.cpu_topology,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> VmConfigBuilder {
        VmConfig::builder()
            .payload_archive("/opt/payloads/app.bundle")
            .payload_binary("payload.so")
            .protected(false)
    }

    #[test]
    fn builder_requires_exactly_one_payload_location() {
        let err = VmConfig::builder()
            .payload_binary("payload.so")
            .protected(false)
            .build()
            .unwrap_err();
        assert!(matches!(err, VmError::InvalidConfig(_)));

        let err = base().owner("com.example.app").build().unwrap_err();
        assert!(matches!(err, VmError::InvalidConfig(_)));
    }

    #[test]
    fn builder_requires_exactly_one_entry_point() {
        let err = VmConfig::builder()
            .payload_archive("/a.bundle")
            .protected(false)
            .build()
            .unwrap_err();
        assert!(matches!(err, VmError::InvalidConfig(_)));

        let err = base().payload_config_path("assets/vm.json").build().unwrap_err();
        assert!(matches!(err, VmError::InvalidConfig(_)));
    }

    #[test]
    fn builder_requires_explicit_protection_choice() {
        let err = VmConfig::builder()
            .payload_archive("/a.bundle")
            .payload_binary("payload.so")
            .build()
            .unwrap_err();
        assert!(matches!(err, VmError::InvalidConfig(_)));
    }

    #[test]
    fn output_capture_needs_full_debug() {
        let err = base().capture_output(true).build().unwrap_err();
        assert!(matches!(err, VmError::InvalidConfig(_)));

        base()
            .debug_level(DebugLevel::Full)
            .capture_output(true)
            .build()
            .unwrap();
    }

    #[test]
    fn extra_archives_conflict_with_config_file_entry_point() {
        let err = VmConfig::builder()
            .payload_archive("/a.bundle")
            .payload_config_path("assets/vm.json")
            .extra_archive("/b.bundle")
            .protected(false)
            .build()
            .unwrap_err();
        assert!(matches!(err, VmError::InvalidConfig(_)));
    }

    #[test]
    fn compatibility_ignores_resources_and_is_symmetric() {
        let a = base().memory_bytes(64 << 20).build().unwrap();
        let b = base()
            .memory_bytes(256 << 20)
            .cpu_topology(CpuTopology::MatchHost)
            .build()
            .unwrap();
        assert!(a.is_compatible_with(&b));
        assert!(b.is_compatible_with(&a));

        let c = base().protected(true).build().unwrap();
        assert!(!a.is_compatible_with(&c));
        assert!(!c.is_compatible_with(&a));

        let d = base().encrypted_storage_bytes(8 << 20).build().unwrap();
        assert!(!a.is_compatible_with(&d));
    }

    #[test]
    fn persisted_round_trip() {
        let config = base()
            .debug_level(DebugLevel::Full)
            .capture_output(true)
            .encrypted_storage_bytes(4 << 20)
            .build()
            .unwrap();
        let bytes = config.to_bytes().unwrap();
        let back = VmConfig::from_bytes(&bytes).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn rejects_newer_version() {
        let config = base().build().unwrap();
        let mut value: serde_json::Value =
            serde_json::from_slice(&config.to_bytes().unwrap()).unwrap();
        value["version"] = serde_json::json!(CONFIG_VERSION + 1);
        let bytes = serde_json::to_vec(&value).unwrap();

        let err = VmConfig::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, VmError::ConfigVersionTooNew { .. }));
    }

    #[test]
    fn tolerates_missing_optional_fields() {
        // A minimal older record: only version plus the required fields.
        let bytes = serde_json::to_vec(&serde_json::json!({
            "version": 1,
            "payload_archive": "/a.bundle",
            "payload_binary": "payload.so",
            "protected": true,
        }))
        .unwrap();

        let config = VmConfig::from_bytes(&bytes).unwrap();
        assert!(config.is_protected());
        assert_eq!(config.debug_level(), DebugLevel::None);
        assert_eq!(config.encrypted_storage_bytes(), 0);
        assert_eq!(config.memory_bytes(), None);
    }
}
