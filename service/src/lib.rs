//! Boundary to the privileged virtualization service.
//!
//! The service is the process that actually talks to the hypervisor: it
//! formats writable partitions, computes payload signatures, instantiates VMs
//! and delivers their lifecycle events. This crate only defines the contract;
//! `haven-vm` consumes it and tests substitute scripted fakes.

use std::fmt::Debug;
use std::fs::File;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw event codes as delivered on the privileged channel.
///
/// These are wire values; clients are expected to translate them into their
/// own closed taxonomy and treat unrecognized values as unknown.
pub mod codes {
    pub const DEATH_INFRASTRUCTURE_ERROR: i32 = 0;
    pub const DEATH_KILLED: i32 = 1;
    pub const DEATH_UNKNOWN: i32 = 2;
    pub const DEATH_SHUTDOWN: i32 = 3;
    pub const DEATH_START_FAILED: i32 = 4;
    pub const DEATH_REBOOT: i32 = 5;
    pub const DEATH_CRASH: i32 = 6;
    pub const DEATH_FIRMWARE_KEY_MISMATCH: i32 = 7;
    pub const DEATH_FIRMWARE_INSTANCE_CHANGED: i32 = 8;
    pub const DEATH_FAILED_TO_CONNECT_TO_SERVICE: i32 = 9;
    pub const DEATH_PAYLOAD_CHANGED: i32 = 10;
    pub const DEATH_PAYLOAD_VERIFICATION_FAILED: i32 = 11;
    pub const DEATH_INVALID_PAYLOAD_CONFIG: i32 = 12;
    pub const DEATH_UNKNOWN_RUNTIME_ERROR: i32 = 13;
    pub const DEATH_HANGUP: i32 = 14;

    pub const ERROR_UNKNOWN: i32 = 0;
    pub const ERROR_PAYLOAD_VERIFICATION_FAILED: i32 = 1;
    pub const ERROR_PAYLOAD_CHANGED: i32 = 2;
    pub const ERROR_INVALID_PAYLOAD_CONFIG: i32 = 3;
}

#[derive(Debug, Error, Display)]
pub enum ServiceError {
    /// Virtualization service is unavailable: {0}
    Unavailable(String),

    /// Request rejected by virtualization service: {0}
    Rejected(String),

    /// Transport failure on the privileged channel
    Transport(#[from] std::io::Error),
}

/// Isolation modes the hypervisor can offer, independently of any VM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Memory is opaque to the host.
    pub protected_vm: bool,
    pub non_protected_vm: bool,
}

/// Kind of writable partition the service is asked to format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Instance,
    EncryptedStore,
}

/// Fine-grained run state as reported by the service for a live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmRunState {
    NotStarted,
    Starting,
    Started,
    PayloadReady,
    PayloadFinished,
    Dead,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuTopology {
    /// A single vCPU.
    #[default]
    OneCpu,
    /// Mirror the host's CPU topology.
    MatchHost,
}

/// Everything the service needs to instantiate one VM.
///
/// File handles are passed already opened with the access the service needs:
/// the images read-write, the signatures read-only.
pub struct VmLaunchConfig {
    pub name: String,
    pub protected: bool,
    pub debug: bool,
    pub memory_bytes: Option<u64>,
    pub cpu_topology: CpuTopology,
    pub payload_archive: PathBuf,
    pub payload_binary: Option<String>,
    pub payload_config_path: Option<String>,
    pub instance_image: File,
    pub encrypted_storage_image: Option<File>,
    pub signature: File,
    pub extra_signatures: Vec<File>,
}

impl Debug for VmLaunchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmLaunchConfig")
            .field("name", &self.name)
            .field("protected", &self.protected)
            .field("debug", &self.debug)
            .field("memory_bytes", &self.memory_bytes)
            .field("cpu_topology", &self.cpu_topology)
            .field("payload_archive", &self.payload_archive)
            .field("payload_binary", &self.payload_binary)
            .field("payload_config_path", &self.payload_config_path)
            .finish_non_exhaustive()
    }
}

/// Asynchronous lifecycle events, delivered on the service's own thread.
pub trait VmEventListener: Send + Sync + 'static {
    fn on_payload_started(&self);
    fn on_payload_ready(&self);
    fn on_payload_finished(&self, exit_code: i32);
    fn on_error(&self, code: i32, message: String);
    fn on_died(&self, reason: i32);
    /// The service process itself went away; distinct from the VM dying.
    fn on_service_died(&self);
}

/// Handle to one live VM instance held by the service.
#[async_trait]
pub trait RunningVm: Send + Sync {
    fn register_listener(&self, listener: Arc<dyn VmEventListener>);

    async fn start(&self) -> Result<(), ServiceError>;

    async fn stop(&self) -> Result<(), ServiceError>;

    async fn state(&self) -> Result<VmRunState, ServiceError>;

    /// Open a channel to the guest on the given vsock port. The port has
    /// already been range-checked by the caller.
    async fn connect_vsock(&self, port: u32) -> Result<UnixStream, ServiceError>;
}

/// One connection to the virtualization service.
#[async_trait]
pub trait VirtualizationService: Send + Sync {
    /// Cheap liveness probe for the cached connection.
    fn is_healthy(&self) -> bool;

    async fn capabilities(&self) -> Result<Capabilities, ServiceError>;

    /// Format `image` as a partition of the given kind and size. The service
    /// owns the format; the client only hands over a writable handle.
    async fn initialize_writable_partition(
        &self,
        image: File,
        size_bytes: u64,
        kind: PartitionKind,
    ) -> Result<(), ServiceError>;

    /// Compute (or refresh) the integrity signature of `source` into
    /// `signature`.
    async fn create_or_update_signature(
        &self,
        source: File,
        signature: File,
    ) -> Result<(), ServiceError>;

    async fn create_vm(
        &self,
        config: VmLaunchConfig,
        console_out: Option<File>,
        os_log: Option<File>,
    ) -> Result<Arc<dyn RunningVm>, ServiceError>;
}
