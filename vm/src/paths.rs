use std::path::{Path, PathBuf};

/// Directory names under the data root.
const VM_DIR: &str = "vm";
const BUNDLE_DIR: &str = "bundles";

/// Layout of one VM's backing directory.
pub struct VmPaths<'a> {
    vm_dir: &'a Path,
}

impl<'a> VmPaths<'a> {
    pub fn new(vm_dir: &'a Path) -> Self {
        Self { vm_dir }
    }

    /// The persisted, versioned configuration record.
    pub fn config(&self) -> PathBuf {
        self.vm_dir.join("config")
    }

    /// The instance-state image the service formats and the VM mutates.
    pub fn instance_image(&self) -> PathBuf {
        self.vm_dir.join("instance-image")
    }

    /// Integrity signature of the payload archive.
    pub fn signature(&self) -> PathBuf {
        self.vm_dir.join("signature")
    }

    pub fn extra_signature(&self, index: usize) -> PathBuf {
        self.vm_dir.join(format!("extra-signature-{index}"))
    }

    /// Encrypted storage image; present only when the config enables it.
    pub fn storage_image(&self) -> PathBuf {
        self.vm_dir.join("storage-image")
    }
}

/// Root directory holding all VM directories for one data root.
pub fn vm_root(data_root: &Path) -> PathBuf {
    data_root.join(VM_DIR)
}

pub fn vm_dir(data_root: &Path, name: &str) -> PathBuf {
    vm_root(data_root).join(name)
}

/// Conventional location of the payload archive for an owner-derived config.
pub fn owner_bundle(data_root: &Path, owner: &str) -> PathBuf {
    data_root.join(BUNDLE_DIR).join(format!("{owner}.bundle"))
}
