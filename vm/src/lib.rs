//! Lifecycle and persistence of named, isolated virtual machines.
//!
//! A [`VirtualMachineManager`] owns a data-root directory and a connection to
//! the privileged virtualization service; it creates, loads, imports and
//! deletes [`VirtualMachine`] instances, each backed by its own on-disk
//! directory. Lifecycle operations may block on file I/O and on the service,
//! so they are async; lifecycle events come back through a [`VmCallback`]
//! registered on the machine.

mod client;
mod config;
mod descriptor;
mod error;
mod events;
mod fs;
mod manager;
mod name;
mod paths;
mod vm;

pub use client::{ServiceClient, ServiceConnector};
pub use config::{DebugLevel, VmConfig, VmConfigBuilder, CONFIG_VERSION};
pub use descriptor::VmDescriptor;
pub use error::VmError;
pub use events::{ErrorCode, StopReason, VmCallback};
pub use manager::VirtualMachineManager;
pub use vm::{VirtualMachine, VmStatus, MAX_VSOCK_PORT, MIN_VSOCK_PORT};

pub use haven_service::{Capabilities, CpuTopology};
