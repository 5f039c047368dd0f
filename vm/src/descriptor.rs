use std::fs::File;
use std::sync::Mutex;

use crate::error::VmError;

pub(crate) struct DescriptorInner {
    pub config: File,
    pub instance_image: File,
    pub storage_image: Option<File>,
}

/// A portable, single-use snapshot of a stopped VM's persisted state: three
/// read-only handles bundled for one transfer into another trust domain.
///
/// Consuming the descriptor via
/// [`VirtualMachineManager::import_from_descriptor`], or calling [`close`],
/// invalidates it permanently; every later access fails with
/// [`VmError::DescriptorClosed`].
///
/// The snapshot is only consistent if the source VM stays stopped until the
/// descriptor is consumed; that is the caller's obligation, not an enforced
/// lock.
///
/// [`VirtualMachineManager::import_from_descriptor`]:
///     crate::VirtualMachineManager::import_from_descriptor
/// [`close`]: VmDescriptor::close
pub struct VmDescriptor {
    inner: Mutex<Option<DescriptorInner>>,
}

impl VmDescriptor {
    pub(crate) fn new(config: File, instance_image: File, storage_image: Option<File>) -> Self {
        Self {
            inner: Mutex::new(Some(DescriptorInner {
                config,
                instance_image,
                storage_image,
            })),
        }
    }

    /// Read-only handle to the serialized configuration.
    pub fn config_file(&self) -> Result<File, VmError> {
        self.with_inner(|inner| inner.config.try_clone())
    }

    /// Read-only handle to the instance-state image.
    pub fn instance_image_file(&self) -> Result<File, VmError> {
        self.with_inner(|inner| inner.instance_image.try_clone())
    }

    /// Read-only handle to the encrypted storage image, if the VM has one.
    pub fn storage_image_file(&self) -> Result<Option<File>, VmError> {
        self.with_inner(|inner| inner.storage_image.as_ref().map(File::try_clone).transpose())
    }

    /// Invalidates the descriptor. Idempotent.
    pub fn close(&self) {
        self.inner.lock().expect("descriptor lock poisoned").take();
    }

    /// Takes ownership of the handles, closing the descriptor.
    pub(crate) fn consume(&self) -> Result<DescriptorInner, VmError> {
        self.inner
            .lock()
            .expect("descriptor lock poisoned")
            .take()
            .ok_or(VmError::DescriptorClosed)
    }

    fn with_inner<T>(
        &self,
        f: impl FnOnce(&DescriptorInner) -> std::io::Result<T>,
    ) -> Result<T, VmError> {
        let guard = self.inner.lock().expect("descriptor lock poisoned");
        let inner = guard.as_ref().ok_or(VmError::DescriptorClosed)?;
        f(inner).map_err(VmError::DescriptorHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> VmDescriptor {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let open = || File::open(&path).unwrap();
        VmDescriptor::new(open(), open(), None)
    }

    #[test]
    fn accessors_fail_after_close() {
        let desc = descriptor();
        desc.config_file().unwrap();
        desc.close();
        assert!(matches!(desc.config_file(), Err(VmError::DescriptorClosed)));
        assert!(matches!(
            desc.instance_image_file(),
            Err(VmError::DescriptorClosed)
        ));
        assert!(matches!(
            desc.storage_image_file(),
            Err(VmError::DescriptorClosed)
        ));
    }

    #[test]
    fn consume_is_single_use() {
        let desc = descriptor();
        desc.consume().unwrap();
        assert!(matches!(desc.consume(), Err(VmError::DescriptorClosed)));
        assert!(matches!(desc.config_file(), Err(VmError::DescriptorClosed)));
    }
}
