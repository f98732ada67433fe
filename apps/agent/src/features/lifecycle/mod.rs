//! Prepare and unprepare: the full host-side setup and teardown of one VM.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};
use virt_types::{User, Vm, VmRecordError};

use crate::config::Config;
use crate::core::exec::{self, Host, System};
use crate::core::fsutil;
use crate::error::{FirstError, Result, VirtError};
use crate::features::network;
use crate::features::overlay::{self, Assembler};
use crate::features::snapshot;
use crate::features::storage;
use crate::features::templates::TemplateStore;
use crate::layout::Layout;

/// Container state as reported by `lxc-info -s`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Aborting,
    Freezing,
    Frozen,
    Thawed,
    Unknown(String),
}

impl ContainerState {
    fn parse(value: &str) -> Self {
        match value.trim() {
            "STOPPED" => ContainerState::Stopped,
            "STARTING" => ContainerState::Starting,
            "RUNNING" => ContainerState::Running,
            "STOPPING" => ContainerState::Stopping,
            "ABORTING" => ContainerState::Aborting,
            "FREEZING" => ContainerState::Freezing,
            "FROZEN" => ContainerState::Frozen,
            "THAWED" => ContainerState::Thawed,
            other => ContainerState::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::Stopped => "STOPPED",
            ContainerState::Starting => "STARTING",
            ContainerState::Running => "RUNNING",
            ContainerState::Stopping => "STOPPING",
            ContainerState::Aborting => "ABORTING",
            ContainerState::Freezing => "FREEZING",
            ContainerState::Frozen => "FROZEN",
            ContainerState::Thawed => "THAWED",
            ContainerState::Unknown(raw) => raw,
        };
        f.write_str(name)
    }
}

/// `lxc-info` output for a container that has no definition.
const NOT_DEFINED: [&str; 2] = ["doesn't exist", "does not exist"];

fn parse_state(output: &str) -> Option<ContainerState> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("State:")
            .map(ContainerState::parse)
    })
}

/// Host-side VM engine. One value serves any number of VMs; operations on the same VM
/// must not overlap.
pub struct Engine<H: Host = System> {
    host: H,
    config: Config,
    templates: TemplateStore,
}

impl Engine<System> {
    /// Loads templates from the configured directory, resolving the bridge address.
    pub fn load(config: Config) -> Result<Self> {
        let templates = TemplateStore::load(&System, &config)?;
        Ok(Self::new(System, config, templates))
    }
}

impl<H: Host> Engine<H> {
    pub fn new(host: H, config: Config, templates: TemplateStore) -> Self {
        Self {
            host,
            config,
            templates,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn layout(&self, vm: &Vm) -> Layout {
        Layout::new(&self.config, vm)
    }

    /// Brings the VM to the prepared state: files rendered, image mapped, root
    /// assembled and network isolation installed. Any stale state is torn down first.
    ///
    /// With `reinitialize` everything in the writable layer except `home` is discarded
    /// before the layer is rebuilt. Every failure comes back as [`VirtError::Setup`].
    pub fn prepare(&self, vm: &Vm, users: &[User], reinitialize: bool) -> Result<()> {
        step("validate", validate(vm, users))?;
        let layout = self.layout(vm);
        info!(vm = %layout.name(), users = users.len(), reinitialize, "preparing");

        match self.unprepare(vm) {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(VirtError::setup("unprepare", err)),
            Err(err) => warn!(vm = %layout.name(), error = %err, "stale teardown incomplete"),
        }

        let host: &dyn Host = &self.host;
        let assembler = Assembler::new(host, &self.config, &self.templates, &layout, vm, users);
        step("write container files", assembler.write_container_files())?;
        let device = step("map image", storage::map_image(host, &self.config, &layout))?;
        step("mount overlay", assembler.mount_overlay(&device))?;
        if reinitialize {
            step("reinitialize", assembler.reinitialize())?;
        }
        step("prepare skeleton", assembler.prepare_skeleton())?;
        step("prepare homes", assembler.prepare_homes())?;
        step("write etc", assembler.write_etc())?;
        step("mount root", assembler.mount_root())?;
        step("isolate", network::isolate(host, &self.config, vm))?;

        info!(vm = %layout.name(), "prepared");
        Ok(())
    }

    /// Reverses [`Engine::prepare`]. The container must stop; every later step runs even
    /// when an earlier one fails and the first failure is returned. Steps whose target
    /// is already gone count as done, so repeated calls are safe.
    pub fn unprepare(&self, vm: &Vm) -> Result<()> {
        let layout = self.layout(vm);
        self.stop_container(&layout)?;
        self.backup_dpkg_status(&layout);

        let host: &dyn Host = &self.host;
        let mut errors = FirstError::default();
        errors.record("deisolate", network::deisolate(host, &self.config, vm));
        errors.record(
            "unmount devpts",
            overlay::unmount(host, "umount devpts failed", &layout.pts_dir()),
        );
        errors.record(
            "unmount root",
            overlay::unmount(host, "umount overlay failed", &layout.rootfs()),
        );
        errors.record(
            "unmount overlay",
            overlay::unmount(host, "umount rbd failed", &layout.overlay()),
        );
        errors.record("unmap image", storage::unmap_image(host, &layout));
        remove_container_files(&layout);

        let failed = errors.failed();
        if failed == 0 {
            info!(vm = %layout.name(), "unprepared");
        } else {
            warn!(vm = %layout.name(), failed, "unprepare incomplete");
        }
        errors.finish()
    }

    pub fn container_state(&self, vm: &Vm) -> Result<ContainerState> {
        self.state_of(self.layout(vm).name())
    }

    fn state_of(&self, name: &str) -> Result<ContainerState> {
        let args = ["-n", name, "-s"];
        let out = exec::run(&self.host, "lxc-info", &args)?;
        if let Some(state) = parse_state(&out.output) {
            return Ok(state);
        }
        if NOT_DEFINED.iter().any(|needle| out.output.contains(needle)) {
            return Ok(ContainerState::Stopped);
        }
        Err(exec::command_error(
            "lxc-info failed",
            "lxc-info",
            &args,
            &out,
        ))
    }

    /// Stops the container unless it already reports `STOPPED`, then insists on `STOPPED`.
    /// A state that cannot be read counts as not stopped.
    fn stop_container(&self, layout: &Layout) -> Result<()> {
        let name = layout.name();
        let not_stopped = |state: &str, output: String| VirtError::NotStopped {
            name: name.to_string(),
            state: state.to_string(),
            output,
        };

        match self.state_of(name) {
            Ok(ContainerState::Stopped) => return Ok(()),
            Ok(state) => debug!(vm = name, %state, "stopping container"),
            Err(err) => warn!(vm = name, error = %err, "container state unreadable, stopping"),
        }
        let stop = exec::run(&self.host, "lxc-stop", &["-n", name])
            .map_err(|err| not_stopped("UNKNOWN", err.to_string()))?;
        match self.state_of(name) {
            Ok(ContainerState::Stopped) => {}
            Ok(state) => return Err(not_stopped(&state.to_string(), stop.output)),
            Err(err) => return Err(not_stopped("UNKNOWN", err.to_string())),
        }
        info!(vm = name, "container stopped");
        Ok(())
    }

    /// Keeps a copy of the container's package database next to the lxc root.
    fn backup_dpkg_status(&self, layout: &Layout) {
        let source = layout.overlay_file("/var/lib/dpkg/status");
        if !source.is_file() {
            return;
        }
        let dir = &self.config.dpkg_backup_dir;
        if let Err(err) = fs::create_dir_all(dir) {
            debug!(dir = %dir.display(), error = %err, "dpkg backup skipped");
            return;
        }
        let target = dir.join(layout.name());
        if let Err(err) = fsutil::copy_file(&self.host, &source, &target, 0) {
            debug!(vm = %layout.name(), error = %err, "dpkg backup failed");
        }
    }

    /// Snapshots the VM's image with its filesystem frozen for the duration.
    pub fn create_consistent_snapshot(&self, vm: &Vm, name: &str) -> Result<()> {
        let layout = self.layout(vm);
        snapshot::create_consistent_snapshot(&self.host, &self.config, &layout, name)
    }

    pub fn freeze_filesystem(&self, vm: &Vm) -> Result<()> {
        snapshot::freeze(&self.host, &self.layout(vm))
    }

    pub fn thaw_filesystem(&self, vm: &Vm) -> Result<()> {
        snapshot::thaw(&self.host, &self.layout(vm))
    }
}

fn step<T>(name: &'static str, result: Result<T>) -> Result<T> {
    result.map_err(|err| VirtError::setup(name, err))
}

fn validate(vm: &Vm, users: &[User]) -> Result<()> {
    vm.validate()?;
    for user in users {
        user.validate()?;
    }
    let mut seen = HashSet::new();
    for user in users {
        if !seen.insert(&user.id) {
            return Err(VmRecordError::DuplicateUser(user.id.clone()).into());
        }
    }
    Ok(())
}

/// Removes what prepare created outside the block device. Directories are removed
/// only when empty so nothing still mounted or holding data is touched.
fn remove_container_files(layout: &Layout) {
    let files = [layout.config_file(), layout.fstab(), layout.file("rootfs.hold")];
    for file in &files {
        ignore_missing(file, fs::remove_file(file));
    }
    for dir in [layout.rootfs(), layout.overlay(), layout.dir().to_path_buf()] {
        ignore_missing(&dir, fs::remove_dir(&dir));
    }
}

fn ignore_missing(path: &Path, result: io::Result<()>) {
    match result {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => debug!(path = %path.display(), error = %err, "left in place"),
    }
}
