//! Crash-consistent snapshots: freeze the overlay filesystem, snapshot the image, thaw.

use tracing::{error, info};

use crate::config::Config;
use crate::core::exec::{FsControl, Host};
use crate::error::{Result, VirtError};
use crate::features::storage;
use crate::layout::Layout;

pub fn freeze(host: &dyn Host, layout: &Layout) -> Result<()> {
    control(host, layout, FsControl::Freeze)
}

pub fn thaw(host: &dyn Host, layout: &Layout) -> Result<()> {
    control(host, layout, FsControl::Thaw)
}

fn control(host: &dyn Host, layout: &Layout, op: FsControl) -> Result<()> {
    let overlay = layout.overlay();
    host.fs_control(&overlay, op).map_err(|err| {
        let context = match op {
            FsControl::Freeze => "freezing",
            FsControl::Thaw => "thawing",
        };
        VirtError::io(context, &overlay, err)
    })
}

/// The thaw runs whether or not the snapshot succeeded. A snapshot failure wins over a
/// thaw failure; a thaw failure after a good snapshot is still reported.
pub fn create_consistent_snapshot(
    host: &dyn Host,
    config: &Config,
    layout: &Layout,
    name: &str,
) -> Result<()> {
    freeze(host, layout)?;
    let snapshot = storage::create_snapshot(host, config, layout, name);
    let thawed = thaw(host, layout);
    if let Err(err) = &thawed {
        error!(vm = %layout.name(), error = %err, "overlay left frozen");
    }
    snapshot?;
    thawed?;
    info!(vm = %layout.name(), snapshot = name, "consistent snapshot created");
    Ok(())
}
