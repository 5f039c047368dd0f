use std::fmt;
use std::io::{PipeReader, PipeWriter};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use haven_service::{PartitionKind, RunningVm, VmLaunchConfig, VmRunState};

use crate::client::ServiceClient;
use crate::config::{DebugLevel, VmConfig};
use crate::descriptor::VmDescriptor;
use crate::error::VmError;
use crate::events::{CallbackSlot, CallbackTranslator, StopReason, VmCallback};
use crate::fs::{self, DirScope, FsError};
use crate::paths::{self, VmPaths};

/// Lowest vsock port the payload can listen on; lower ports are privileged.
pub const MIN_VSOCK_PORT: u64 = 1024;
/// Highest vsock port; ports are 32-bit unsigned at the transport level.
pub const MAX_VSOCK_PORT: u64 = (1 << 32) - 1;

/// Size of the instance-state image handed to the service for formatting.
const INSTANCE_IMAGE_SIZE: u64 = 10 * 1024 * 1024;

/// Coarse lifecycle status of a [`VirtualMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    /// Freshly created, loaded, imported, or stopped after running.
    Stopped,
    Running,
    /// Terminal. The backing files and the VM's secrets are gone; a new VM
    /// under the same name is a wholly distinct entity.
    Deleted,
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmStatus::Stopped => "stopped",
            VmStatus::Running => "running",
            VmStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

struct Running {
    vm: Arc<dyn RunningVm>,
    translator: Arc<CallbackTranslator>,
}

/// Mutable state behind the per-VM state lock.
///
/// Lock ordering: this lock may be taken while the manager's registry lock
/// is held, never the reverse. The callback slot has its own lock which is
/// never held across any other lock or across callback invocation.
struct State {
    config: VmConfig,
    running: Option<Running>,
    console: Option<(PipeReader, PipeWriter)>,
    log: Option<(PipeReader, PipeWriter)>,
    deleted: bool,
}

/// One named, persistent VM instance.
///
/// Obtained from [`VirtualMachineManager`]; the manager guarantees at most
/// one live object per name. All lifecycle operations may block on file I/O
/// and on the virtualization service, so they must not be driven from a
/// latency-sensitive context.
///
/// [`VirtualMachineManager`]: crate::VirtualMachineManager
pub struct VirtualMachine {
    name: String,
    data_root: PathBuf,
    vm_dir: PathBuf,
    client: ServiceClient,
    state: Mutex<State>,
    callback: Arc<CallbackSlot>,
}

impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("name", &self.name)
            .field("vm_dir", &self.vm_dir)
            .finish_non_exhaustive()
    }
}

impl VirtualMachine {
    fn from_parts(
        data_root: &Path,
        name: &str,
        config: VmConfig,
        client: ServiceClient,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            data_root: data_root.to_owned(),
            vm_dir: paths::vm_dir(data_root, name),
            client,
            state: Mutex::new(State {
                config,
                running: None,
                console: None,
                log: None,
                deleted: false,
            }),
            callback: Arc::new(CallbackSlot::default()),
        })
    }

    /// Creates the backing directory and asks the service to format the
    /// writable partitions. Any failure rolls the directory back.
    ///
    /// Caller holds the manager's registry lock.
    pub(crate) async fn create(
        data_root: &Path,
        name: &str,
        config: VmConfig,
        client: ServiceClient,
    ) -> Result<Arc<Self>, VmError> {
        let vm_dir = make_vm_dir(data_root, name).await?;
        let scope = DirScope::new(vm_dir.clone());
        let p = VmPaths::new(&vm_dir);

        config.save(&p.config()).await?;
        fs::ensure_file(p.instance_image()).await?;
        if config.is_encrypted_storage_enabled() {
            fs::ensure_file(p.storage_image()).await?;
        }

        let service = client.get().await?;
        service
            .initialize_writable_partition(
                fs::open_rw(p.instance_image()).await?,
                INSTANCE_IMAGE_SIZE,
                PartitionKind::Instance,
            )
            .await?;
        if config.is_encrypted_storage_enabled() {
            service
                .initialize_writable_partition(
                    fs::open_rw(p.storage_image()).await?,
                    config.encrypted_storage_bytes(),
                    PartitionKind::EncryptedStore,
                )
                .await?;
        }

        scope.commit();
        info!(name, "created virtual machine");
        Ok(Self::from_parts(data_root, name, config, client))
    }

    /// Loads persisted state from disk; `None` if no such VM exists.
    ///
    /// Caller holds the manager's registry lock.
    pub(crate) async fn load(
        data_root: &Path,
        name: &str,
        client: ServiceClient,
    ) -> Result<Option<Arc<Self>>, VmError> {
        let vm_dir = paths::vm_dir(data_root, name);
        if !path_exists(&vm_dir).await {
            return Ok(None);
        }
        let p = VmPaths::new(&vm_dir);
        let config = VmConfig::load(&p.config()).await?;
        if !path_exists(&p.instance_image()).await {
            return Err(VmError::CorruptState("instance image missing".into()));
        }
        if config.is_encrypted_storage_enabled() && !path_exists(&p.storage_image()).await {
            return Err(VmError::CorruptState("storage image missing".into()));
        }
        Ok(Some(Self::from_parts(data_root, name, config, client)))
    }

    /// Creates a VM from a descriptor, byte-copying the snapshot contents
    /// instead of initializing fresh partitions. Consumes (and thereby
    /// closes) the descriptor; any failure rolls the directory back.
    ///
    /// Caller holds the manager's registry lock.
    pub(crate) async fn from_descriptor(
        data_root: &Path,
        name: &str,
        descriptor: &VmDescriptor,
        client: ServiceClient,
    ) -> Result<Arc<Self>, VmError> {
        let vm_dir = make_vm_dir(data_root, name).await?;
        let scope = DirScope::new(vm_dir.clone());
        let p = VmPaths::new(&vm_dir);

        let snapshot = descriptor.consume()?;
        let mut config_bytes = Vec::new();
        tokio::fs::File::from_std(snapshot.config)
            .read_to_end(&mut config_bytes)
            .await
            .map_err(VmError::DescriptorHandle)?;
        let config = VmConfig::from_bytes(&config_bytes)?;

        config.save(&p.config()).await?;
        fs::copy_into(snapshot.instance_image, p.instance_image()).await?;
        match snapshot.storage_image {
            Some(image) if config.is_encrypted_storage_enabled() => {
                fs::copy_into(image, p.storage_image()).await?;
            }
            Some(_) => {
                return Err(VmError::CorruptState(
                    "descriptor carries a storage image its config does not declare".into(),
                ));
            }
            None if config.is_encrypted_storage_enabled() => {
                return Err(VmError::CorruptState(
                    "descriptor is missing the storage image its config declares".into(),
                ));
            }
            None => {}
        }

        scope.commit();
        info!(name, "imported virtual machine");
        Ok(Self::from_parts(data_root, name, config, client))
    }

    /// Permanently deletes the VM: requires STOPPED, marks the in-memory
    /// object DELETED and removes the backing directory.
    ///
    /// Caller holds the manager's registry lock.
    pub(crate) async fn delete(&self) -> Result<(), VmError> {
        let mut state = self.state.lock().await;
        self.check_stopped(&mut state).await?;
        // Permanent: a later VM created under the same name is unrelated.
        state.deleted = true;
        drop(state);
        fs::remove_dir_all(&self.vm_dir).await?;
        info!(name = %self.name, "deleted virtual machine");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The directory holding all files backing this VM.
    pub fn vm_dir(&self) -> &Path {
        &self.vm_dir
    }

    pub async fn config(&self) -> VmConfig {
        self.state.lock().await.config.clone()
    }

    /// Resolves the current status, consulting the service for a live run
    /// and overriding with DELETED once the backing directory is gone.
    ///
    /// A running VM whose directory was removed out-of-band keeps running
    /// until it stops; from then on it is DELETED.
    pub async fn status(&self) -> Result<VmStatus, VmError> {
        let mut state = self.state.lock().await;
        if state.deleted {
            return Ok(VmStatus::Deleted);
        }
        let status = match &state.running {
            Some(running) => run_state_to_status(running.vm.state().await?),
            None => VmStatus::Stopped,
        };
        if status == VmStatus::Stopped && !path_exists(&self.vm_dir).await {
            state.running = None;
            return Ok(VmStatus::Deleted);
        }
        Ok(status)
    }

    /// Starts the VM. Materializes the signature files, hands the service
    /// the backing images, installs the event translator and starts the
    /// instance. Local file errors abort before any remote call is made.
    pub async fn run(&self) -> Result<(), VmError> {
        let mut state = self.state.lock().await;
        self.check_stopped(&mut state).await?;

        let p = VmPaths::new(&self.vm_dir);
        fs::ensure_file(p.signature()).await?;
        for index in 0..state.config.extra_archives().len() {
            fs::ensure_file(p.extra_signature(index)).await?;
        }

        let (console_out, os_log) = if state.config.is_output_captured() {
            let console = writer_handle(ensure_pipe(&mut state.console)?)?;
            let log = writer_handle(ensure_pipe(&mut state.log)?)?;
            (Some(console), Some(log))
        } else {
            (None, None)
        };

        let config = state.config.clone();
        let archive = self.resolve_archive(&config)?;
        let service = self.client.get().await?;

        service
            .create_or_update_signature(
                fs::open_ro(&archive).await?,
                fs::open_rw(p.signature()).await?,
            )
            .await?;
        for (index, extra) in config.extra_archives().iter().enumerate() {
            service
                .create_or_update_signature(
                    fs::open_ro(extra).await?,
                    fs::open_rw(p.extra_signature(index)).await?,
                )
                .await?;
        }

        let launch = VmLaunchConfig {
            name: self.name.clone(),
            protected: config.is_protected(),
            debug: config.debug_level() == DebugLevel::Full,
            memory_bytes: config.memory_bytes(),
            cpu_topology: config.cpu_topology(),
            payload_archive: archive,
            payload_binary: config.payload_binary().map(str::to_owned),
            payload_config_path: config.payload_config_path().map(str::to_owned),
            instance_image: fs::open_rw(p.instance_image()).await?,
            encrypted_storage_image: if config.is_encrypted_storage_enabled() {
                Some(fs::open_rw(p.storage_image()).await?)
            } else {
                None
            },
            signature: fs::open_ro(p.signature()).await?,
            extra_signatures: {
                let mut handles = Vec::with_capacity(config.extra_archives().len());
                for index in 0..config.extra_archives().len() {
                    handles.push(fs::open_ro(p.extra_signature(index)).await?);
                }
                handles
            },
        };

        let vm = service.create_vm(launch, console_out, os_log).await?;
        let (translator, _dispatcher) = CallbackTranslator::spawn(self.callback.clone());
        vm.register_listener(translator.clone());
        vm.start().await?;
        state.running = Some(Running { vm, translator });
        info!(name = %self.name, "virtual machine started");
        Ok(())
    }

    /// Stops the running VM immediately, like pulling the plug: the payload
    /// is not notified and encrypted-storage writes may be lost.
    pub async fn stop(&self) -> Result<(), VmError> {
        let mut state = self.state.lock().await;
        let Some(running) = &state.running else {
            return Err(VmError::NotRunning);
        };
        running.vm.stop().await?;
        running.translator.report_stopped(StopReason::Killed);
        state.running = None;
        info!(name = %self.name, "virtual machine stopped");
        Ok(())
    }

    /// Best-effort stop for teardown paths. Failures are logged and
    /// swallowed; a VM that exited just as we tried to stop it is not an
    /// error anyone can act on.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        let Some(running) = state.running.take() else {
            return;
        };
        match running.vm.state().await {
            Ok(run_state) if run_state_to_status(run_state) == VmStatus::Running => {
                match running.vm.stop().await {
                    Ok(()) => {
                        running.translator.report_stopped(StopReason::Killed);
                        debug!(name = %self.name, "virtual machine closed");
                    }
                    Err(err) => {
                        info!(name = %self.name, error = %err, "ignoring stop failure on close");
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(name = %self.name, error = %err, "ignoring state query failure on close");
            }
        }
    }

    /// Replaces the configuration of a stopped VM with a compatible one,
    /// returning the previous configuration.
    pub async fn set_config(&self, new_config: VmConfig) -> Result<VmConfig, VmError> {
        let mut state = self.state.lock().await;
        if !state.config.is_compatible_with(&new_config) {
            return Err(VmError::IncompatibleConfig);
        }
        self.check_stopped(&mut state).await?;
        if state.config == new_config {
            return Ok(state.config.clone());
        }
        let p = VmPaths::new(&self.vm_dir);
        // Remove before rewriting so a descriptor holding the old file keeps
        // seeing the old record.
        fs::remove_file(p.config()).await?;
        new_config.save(&p.config()).await?;
        Ok(std::mem::replace(&mut state.config, new_config))
    }

    /// Captures the persisted state of a stopped VM as a single-use
    /// [`VmDescriptor`]. The files themselves are not copied until the
    /// descriptor is imported; the VM should stay stopped until then.
    pub async fn to_descriptor(&self) -> Result<VmDescriptor, VmError> {
        let mut state = self.state.lock().await;
        self.check_stopped(&mut state).await?;
        let p = VmPaths::new(&self.vm_dir);
        let storage = if state.config.is_encrypted_storage_enabled() {
            Some(fs::open_ro(p.storage_image()).await?)
        } else {
            None
        };
        Ok(VmDescriptor::new(
            fs::open_ro(p.config()).await?,
            fs::open_ro(p.instance_image()).await?,
            storage,
        ))
    }

    /// Opens a channel to the payload on the given vsock port. The port is
    /// range-checked before any remote call.
    pub async fn connect_vsock(&self, port: u64) -> Result<UnixStream, VmError> {
        if !(MIN_VSOCK_PORT..=MAX_VSOCK_PORT).contains(&port) {
            return Err(VmError::InvalidVsockPort(port));
        }
        let state = self.state.lock().await;
        let vm = self.running_vm(&state).await?;
        Ok(vm.connect_vsock(port as u32).await?)
    }

    /// Registers the lifecycle callback, replacing any previous one.
    pub fn set_callback(&self, callback: Arc<dyn VmCallback>) {
        self.callback.set(callback);
    }

    pub fn clear_callback(&self) {
        self.callback.clear();
    }

    /// Read end of the console-output pipe. Only available when the config
    /// enables output capture; the caller must keep draining it or the
    /// payload blocks once the pipe buffer fills.
    pub async fn console_output(&self) -> Result<PipeReader, VmError> {
        let mut state = self.state.lock().await;
        if !state.config.is_output_captured() {
            return Err(VmError::OutputNotCaptured);
        }
        let (reader, _) = ensure_pipe(&mut state.console)?;
        reader.try_clone().map_err(VmError::Pipe)
    }

    /// Read end of the OS log pipe; same conditions as [`console_output`].
    ///
    /// [`console_output`]: VirtualMachine::console_output
    pub async fn log_output(&self) -> Result<PipeReader, VmError> {
        let mut state = self.state.lock().await;
        if !state.config.is_output_captured() {
            return Err(VmError::OutputNotCaptured);
        }
        let (reader, _) = ensure_pipe(&mut state.log)?;
        reader.try_clone().map_err(VmError::Pipe)
    }

    /// Fails unless the VM is stopped and not deleted; drops a stale running
    /// handle if the service reports the instance already stopped.
    async fn check_stopped(&self, state: &mut State) -> Result<(), VmError> {
        if state.deleted || !path_exists(&self.vm_dir).await {
            return Err(VmError::Deleted);
        }
        if let Some(running) = &state.running {
            if run_state_to_status(running.vm.state().await?) != VmStatus::Stopped {
                return Err(VmError::NotStopped);
            }
            state.running = None;
        }
        Ok(())
    }

    async fn running_vm(&self, state: &State) -> Result<Arc<dyn RunningVm>, VmError> {
        if let Some(running) = &state.running {
            if run_state_to_status(running.vm.state().await?) == VmStatus::Running {
                return Ok(running.vm.clone());
            }
        }
        if state.deleted || !path_exists(&self.vm_dir).await {
            Err(VmError::Deleted)
        } else {
            Err(VmError::NotRunning)
        }
    }

    fn resolve_archive(&self, config: &VmConfig) -> Result<PathBuf, VmError> {
        match (config.payload_archive(), config.owner()) {
            (Some(path), _) => Ok(path.to_path_buf()),
            (None, Some(owner)) => Ok(paths::owner_bundle(&self.data_root, owner)),
            (None, None) => Err(VmError::CorruptState(
                "config has no payload location".into(),
            )),
        }
    }
}

impl fmt::Display for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualMachine({})", self.name)
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Creates the parent root idempotently, then the leaf atomically; an
/// existing leaf means a VM of that name already exists.
async fn make_vm_dir(data_root: &Path, name: &str) -> Result<PathBuf, VmError> {
    fs::create_dir_all(paths::vm_root(data_root)).await?;
    let vm_dir = paths::vm_dir(data_root, name);
    match fs::create_new_dir(&vm_dir).await {
        Ok(()) => Ok(vm_dir),
        Err(FsError::DirExists { .. }) => Err(VmError::AlreadyExists(name.to_owned())),
        Err(err) => Err(err.into()),
    }
}

fn run_state_to_status(state: VmRunState) -> VmStatus {
    match state {
        VmRunState::Starting
        | VmRunState::Started
        | VmRunState::PayloadReady
        | VmRunState::PayloadFinished => VmStatus::Running,
        VmRunState::NotStarted | VmRunState::Dead => VmStatus::Stopped,
    }
}

fn ensure_pipe(
    slot: &mut Option<(PipeReader, PipeWriter)>,
) -> Result<&(PipeReader, PipeWriter), VmError> {
    if slot.is_none() {
        *slot = Some(std::io::pipe().map_err(VmError::Pipe)?);
    }
    match slot {
        Some(pair) => Ok(pair),
        None => Err(VmError::Pipe(std::io::Error::other("pipe slot empty"))),
    }
}

/// Duplicates the write end of a pipe as a plain file handle for the
/// service.
fn writer_handle(pipe: &(PipeReader, PipeWriter)) -> Result<std::fs::File, VmError> {
    let writer = pipe.1.try_clone().map_err(VmError::Pipe)?;
    Ok(std::fs::File::from(OwnedFd::from(writer)))
}
