//! On-disk locations of a single VM; pure functions of the VM id and the host config.

use std::path::{Path, PathBuf};

use virt_types::Vm;

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    name: String,
    dir: PathBuf,
    lower: PathBuf,
    device: PathBuf,
}

impl Layout {
    pub fn new(config: &Config, vm: &Vm) -> Self {
        let name = vm.container_name();
        Self {
            dir: config.lxc_root.join(&name),
            lower: config.base_rootfs.clone(),
            device: config.rbd_device_dir.join(&name),
            name,
        }
    }

    /// Container name; also the block image name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self, rel: &str) -> PathBuf {
        self.dir.join(rel.trim_start_matches('/'))
    }

    pub fn config_file(&self) -> PathBuf {
        self.file("config")
    }

    pub fn fstab(&self) -> PathBuf {
        self.file("fstab")
    }

    pub fn rootfs(&self) -> PathBuf {
        self.file("rootfs")
    }

    pub fn pts_dir(&self) -> PathBuf {
        self.file("rootfs/dev/pts")
    }

    /// Mount point of the VM's block device; upper layer of the root union.
    pub fn overlay(&self) -> PathBuf {
        self.file("overlay")
    }

    pub fn overlay_file(&self, rel: &str) -> PathBuf {
        self.overlay().join(rel.trim_start_matches('/'))
    }

    pub fn lower_file(&self, rel: &str) -> PathBuf {
        self.lower.join(rel.trim_start_matches('/'))
    }

    pub fn lower(&self) -> &Path {
        &self.lower
    }

    pub fn device(&self) -> &Path {
        &self.device
    }
}
