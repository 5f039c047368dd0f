use std::fs::File;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use haven_service::{
    Capabilities, PartitionKind, RunningVm, ServiceError, VirtualizationService, VmEventListener,
    VmLaunchConfig, VmRunState,
};
use haven_vm::{ServiceConnector, VirtualMachineManager, VmConfig};

// In-process stand-in for the privileged virtualization service, just enough
// to walk the lifecycle without a hypervisor.
struct DemoVm {
    state: Mutex<VmRunState>,
}

#[async_trait]
impl RunningVm for DemoVm {
    fn register_listener(&self, _listener: Arc<dyn VmEventListener>) {}

    async fn start(&self) -> Result<(), ServiceError> {
        *self.state.lock().unwrap() = VmRunState::Started;
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        *self.state.lock().unwrap() = VmRunState::Dead;
        Ok(())
    }

    async fn state(&self) -> Result<VmRunState, ServiceError> {
        Ok(*self.state.lock().unwrap())
    }

    async fn connect_vsock(&self, _port: u32) -> Result<UnixStream, ServiceError> {
        let (_ours, theirs) = UnixStream::pair()?;
        Ok(theirs)
    }
}

struct DemoService;

#[async_trait]
impl VirtualizationService for DemoService {
    fn is_healthy(&self) -> bool {
        true
    }

    async fn capabilities(&self) -> Result<Capabilities, ServiceError> {
        Ok(Capabilities {
            protected_vm: false,
            non_protected_vm: true,
        })
    }

    async fn initialize_writable_partition(
        &self,
        _image: File,
        _size_bytes: u64,
        _kind: PartitionKind,
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn create_or_update_signature(
        &self,
        _source: File,
        _signature: File,
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn create_vm(
        &self,
        _config: VmLaunchConfig,
        _console_out: Option<File>,
        _os_log: Option<File>,
    ) -> Result<Arc<dyn RunningVm>, ServiceError> {
        Ok(Arc::new(DemoVm {
            state: Mutex::new(VmRunState::NotStarted),
        }))
    }
}

struct DemoConnector;

#[async_trait]
impl ServiceConnector for DemoConnector {
    async fn connect(&self) -> Result<Arc<dyn VirtualizationService>, ServiceError> {
        Ok(Arc::new(DemoService))
    }
}

#[tokio::main]
async fn main() {
    let root = tempfile::tempdir().unwrap();
    let archive = root.path().join("app.bundle");
    std::fs::write(&archive, b"demo payload").unwrap();

    let manager = VirtualMachineManager::new(root.path(), Arc::new(DemoConnector));
    println!("capabilities: {:?}", manager.capabilities().await.unwrap());

    let config = VmConfig::builder()
        .payload_archive(&archive)
        .payload_binary("payload.so")
        .protected(false)
        .build()
        .unwrap();

    let vm = manager.get_or_create("demo", config).await.unwrap();
    println!("{vm}: {}", vm.status().await.unwrap());

    vm.run().await.unwrap();
    println!("{vm}: {}", vm.status().await.unwrap());

    vm.stop().await.unwrap();
    println!("{vm}: {}", vm.status().await.unwrap());

    manager.delete("demo").await.unwrap();
    println!("{vm}: {}", vm.status().await.unwrap());
}
