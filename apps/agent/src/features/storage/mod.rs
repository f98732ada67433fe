//! RBD block images backing each VM's writable layer.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::Config;
use crate::core::exec::{self, Host};
use crate::error::{Result, VirtError};
use crate::layout::Layout;

/// `rbd map` exits with this status when the image does not exist yet.
const RBD_IMAGE_NOT_FOUND: i32 = 1;

/// Maps the VM's image to a local device, creating and formatting it on first use.
pub fn map_image(host: &dyn Host, config: &Config, layout: &Layout) -> Result<PathBuf> {
    let pool = config.rbd_pool.as_str();
    let image = layout.name();
    let map_args = ["map", "--pool", pool, "--image", image];

    let mut make_filesystem = false;
    let out = exec::run(host, "rbd", &map_args)?;
    match out.status {
        Some(0) => {}
        Some(RBD_IMAGE_NOT_FOUND) => {
            info!(image, size_mb = config.image_size_mb, "creating image");
            let size = config.image_size_mb.to_string();
            exec::run_checked(
                host,
                "rbd create failed",
                "rbd",
                &["create", "--pool", pool, "--size", &size, "--image", image],
            )?;
            exec::run_checked(host, "rbd map failed", "rbd", &map_args)?;
            make_filesystem = true;
        }
        _ => return Err(exec::command_error("rbd map failed", "rbd", &map_args, &out)),
    }

    wait_for_device(
        layout.device(),
        config.device_timeout,
        config.device_poll_interval,
    )?;

    if make_filesystem {
        let device = layout.device().to_string_lossy();
        exec::run_checked(host, "mkfs.ext4 failed", "mkfs.ext4", &[&device])?;
        info!(image, device = %device, "formatted new image");
    }
    Ok(layout.device().to_path_buf())
}

/// Polls until `path` exists or `timeout` elapses.
pub fn wait_for_device(path: &Path, timeout: Duration, interval: Duration) -> Result<()> {
    let started = Instant::now();
    loop {
        match path.try_exists() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) => return Err(VirtError::io("checking device", path, err)),
        }
        let waited = started.elapsed();
        if waited >= timeout {
            return Err(VirtError::DeviceNotReady {
                path: path.to_path_buf(),
                waited,
            });
        }
        debug!(device = %path.display(), ?waited, "waiting for device");
        thread::sleep(interval.min(timeout - waited));
    }
}

/// Unmaps the VM's device. A device node that is already gone is not an error.
pub fn unmap_image(host: &dyn Host, layout: &Layout) -> Result<()> {
    let device = layout.device();
    if !device.exists() {
        debug!(device = %device.display(), "device not mapped");
        return Ok(());
    }
    let device = device.to_string_lossy();
    exec::run_checked(host, "rbd unmap failed", "rbd", &["unmap", &device])?;
    Ok(())
}

/// Storage-layer snapshot of the VM's image.
pub fn create_snapshot(
    host: &dyn Host,
    config: &Config,
    layout: &Layout,
    snapshot: &str,
) -> Result<()> {
    exec::run_checked(
        host,
        "creating snapshot failed",
        "rbd",
        &[
            "snap",
            "create",
            "--pool",
            &config.rbd_pool,
            "--image",
            layout.name(),
            "--snap",
            snapshot,
        ],
    )?;
    Ok(())
}
