use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::debug;

use haven_service::Capabilities;

use crate::client::{ServiceClient, ServiceConnector};
use crate::config::VmConfig;
use crate::descriptor::VmDescriptor;
use crate::error::VmError;
use crate::fs;
use crate::name::check_name;
use crate::paths;
use crate::vm::{VirtualMachine, VmStatus};

/// Factory and registry for the [`VirtualMachine`]s under one data root.
///
/// The registry holds weak references, so a machine nobody else holds is
/// dropped and later reloaded from disk on demand. Within one manager there
/// is at most one live [`VirtualMachine`] per name: callers asking for the
/// same name get the same object, and its internal lock is what serializes
/// their lifecycle operations.
pub struct VirtualMachineManager {
    data_root: PathBuf,
    client: ServiceClient,
    /// Doubles as the creation lock: every operation that creates, loads or
    /// deletes a VM directory runs with this lock held, so a name can never
    /// be created twice concurrently.
    registry: Mutex<HashMap<String, Weak<VirtualMachine>>>,
}

impl VirtualMachineManager {
    pub fn new(data_root: impl Into<PathBuf>, connector: Arc<dyn ServiceConnector>) -> Self {
        Self {
            data_root: data_root.into(),
            client: ServiceClient::new(connector),
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a new VM under `name`. Fails with [`VmError::AlreadyExists`]
    /// if a VM of that name exists, live or on disk; on any other failure
    /// nothing of the VM remains on disk.
    pub async fn create(&self, name: &str, config: VmConfig) -> Result<Arc<VirtualMachine>, VmError> {
        check_name(name)?;
        let mut registry = self.registry.lock().await;
        if occupied(&mut registry, name).await? {
            return Err(VmError::AlreadyExists(name.to_owned()));
        }
        let vm =
            VirtualMachine::create(&self.data_root, name, config, self.client.clone()).await?;
        registry.insert(name.to_owned(), Arc::downgrade(&vm));
        Ok(vm)
    }

    /// Returns the VM named `name`, or `None` if it does not exist. Repeated
    /// calls for the same name return the same object for as long as anyone
    /// holds it.
    pub async fn get(&self, name: &str) -> Result<Option<Arc<VirtualMachine>>, VmError> {
        check_name(name)?;
        let mut registry = self.registry.lock().await;
        self.get_locked(&mut registry, name).await
    }

    /// [`get`] falling back to [`create`], as one atomic operation: two
    /// concurrent callers cannot both end up creating.
    ///
    /// [`get`]: VirtualMachineManager::get
    /// [`create`]: VirtualMachineManager::create
    pub async fn get_or_create(
        &self,
        name: &str,
        config: VmConfig,
    ) -> Result<Arc<VirtualMachine>, VmError> {
        check_name(name)?;
        let mut registry = self.registry.lock().await;
        if let Some(vm) = self.get_locked(&mut registry, name).await? {
            return Ok(vm);
        }
        let vm =
            VirtualMachine::create(&self.data_root, name, config, self.client.clone()).await?;
        registry.insert(name.to_owned(), Arc::downgrade(&vm));
        Ok(vm)
    }

    /// Materializes a new VM under `name` from a descriptor, consuming it.
    /// The imported machine carries over the snapshot's identity and secrets;
    /// it is a continuation of the exported one, not a fresh instance.
    pub async fn import_from_descriptor(
        &self,
        name: &str,
        descriptor: &VmDescriptor,
    ) -> Result<Arc<VirtualMachine>, VmError> {
        check_name(name)?;
        let mut registry = self.registry.lock().await;
        if occupied(&mut registry, name).await? {
            return Err(VmError::AlreadyExists(name.to_owned()));
        }
        let vm =
            VirtualMachine::from_descriptor(&self.data_root, name, descriptor, self.client.clone())
                .await?;
        registry.insert(name.to_owned(), Arc::downgrade(&vm));
        Ok(vm)
    }

    /// Permanently deletes the VM named `name` and everything it stored. The
    /// VM must exist and be stopped.
    pub async fn delete(&self, name: &str) -> Result<(), VmError> {
        check_name(name)?;
        let mut registry = self.registry.lock().await;
        if let Some(vm) = lookup(&mut registry, name) {
            vm.delete().await?;
        } else {
            let vm_dir = paths::vm_dir(&self.data_root, name);
            if !tokio::fs::try_exists(&vm_dir).await.unwrap_or(false) {
                return Err(VmError::NotFound(name.to_owned()));
            }
            fs::remove_dir_all(&vm_dir).await?;
            debug!(name, "deleted virtual machine with no live handle");
        }
        registry.remove(name);
        Ok(())
    }

    /// What the hypervisor on this device can do, independently of any VM.
    pub async fn capabilities(&self) -> Result<Capabilities, VmError> {
        Ok(self.client.get().await?.capabilities().await?)
    }

    async fn get_locked(
        &self,
        registry: &mut HashMap<String, Weak<VirtualMachine>>,
        name: &str,
    ) -> Result<Option<Arc<VirtualMachine>>, VmError> {
        if let Some(vm) = lookup(registry, name) {
            // A deleted machine stays in memory while someone holds it, but
            // its name is free again.
            if vm.status().await? != VmStatus::Deleted {
                return Ok(Some(vm));
            }
            registry.remove(name);
        }
        match VirtualMachine::load(&self.data_root, name, self.client.clone()).await? {
            Some(vm) => {
                registry.insert(name.to_owned(), Arc::downgrade(&vm));
                Ok(Some(vm))
            }
            None => Ok(None),
        }
    }
}

/// Whether a live, non-deleted machine still occupies `name`. A deleted
/// machine that someone still holds does not block reuse of its name.
async fn occupied(
    registry: &mut HashMap<String, Weak<VirtualMachine>>,
    name: &str,
) -> Result<bool, VmError> {
    let Some(vm) = lookup(registry, name) else {
        return Ok(false);
    };
    if vm.status().await? == VmStatus::Deleted {
        registry.remove(name);
        return Ok(false);
    }
    Ok(true)
}

/// Upgrades the registry entry for `name`, pruning it if the object is gone.
fn lookup(
    registry: &mut HashMap<String, Weak<VirtualMachine>>,
    name: &str,
) -> Option<Arc<VirtualMachine>> {
    match registry.get(name).and_then(Weak::upgrade) {
        Some(vm) => Some(vm),
        None => {
            registry.remove(name);
            None
        }
    }
}
