//! Container root assembly: per-VM writable layer on the block device, union-mounted
//! over the shared read-only base.

pub mod accounts;

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;

use tracing::{debug, info};
use virt_types::{User, Vm};

use crate::config::Config;
use crate::core::exec::{self, Host};
use crate::core::fsutil::{self, prepare_dir};
use crate::error::{Result, VirtError};
use crate::features::templates::{self, TemplateStore, VmContext};
use crate::layout::Layout;

use self::accounts::Account;

/// Overlay entry that survives a reinitialize.
pub const HOME: &str = "home";
/// Web root inside the container, pointed at the primary user's website.
pub const WEB_ROOT: &str = "/var/www";

const SKELETON: [&str; 4] = ["/", "/lost+found", "/etc", "/home"];

/// Output fragments of `umount` meaning nothing is mounted there.
const NOT_MOUNTED: [&str; 4] = [
    "not mounted",
    "not found",
    "no mount point specified",
    "No such file or directory",
];

/// Builds one VM's root filesystem. Every step aborts on the first failure.
pub struct Assembler<'a> {
    host: &'a dyn Host,
    config: &'a Config,
    templates: &'a TemplateStore,
    layout: &'a Layout,
    vm: &'a Vm,
    users: &'a [User],
    context: VmContext,
}

impl<'a> Assembler<'a> {
    pub fn new(
        host: &'a dyn Host,
        config: &'a Config,
        templates: &'a TemplateStore,
        layout: &'a Layout,
        vm: &'a Vm,
        users: &'a [User],
    ) -> Self {
        Self {
            context: VmContext::new(config, layout, vm, users),
            host,
            config,
            templates,
            layout,
            vm,
            users,
        }
    }

    fn root(&self) -> u32 {
        self.config.id_map.root()
    }

    fn generate(&self, path: &Path, template: &str, id: u32) -> Result<()> {
        let rendered = self.templates.render(template, &self.context)?;
        fsutil::write_file(self.host, path, rendered.as_bytes(), id)
    }

    /// VM directory plus the lxc `config` and `fstab`, owned by host root.
    pub fn write_container_files(&self) -> Result<()> {
        prepare_dir(self.host, self.layout.dir(), 0)?;
        self.generate(&self.layout.config_file(), templates::CONFIG, 0)?;
        self.generate(&self.layout.fstab(), templates::FSTAB, 0)?;
        Ok(())
    }

    pub fn mount_overlay(&self, device: &Path) -> Result<()> {
        let overlay = self.layout.overlay();
        prepare_dir(self.host, &overlay, self.root())?;
        let device = device.to_string_lossy();
        let target = overlay.to_string_lossy();
        exec::run_checked(
            self.host,
            "mount rbd failed",
            "mount",
            &["-t", "ext4", &device, &target],
        )?;
        debug!(vm = %self.layout.name(), %device, "overlay mounted");
        Ok(())
    }

    /// Removes every top-level overlay entry except `home`.
    pub fn reinitialize(&self) -> Result<()> {
        let overlay = self.layout.overlay();
        let entries =
            fs::read_dir(&overlay).map_err(|err| VirtError::io("reading", &overlay, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| VirtError::io("reading", &overlay, err))?;
            if entry.file_name() == HOME {
                continue;
            }
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|err| VirtError::io("stat", &path, err))?;
            let removed = if file_type.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|err| VirtError::io("removing", &path, err))?;
        }
        info!(vm = %self.layout.name(), "overlay reinitialized");
        Ok(())
    }

    pub fn prepare_skeleton(&self) -> Result<()> {
        for dir in SKELETON {
            prepare_dir(self.host, &self.layout.overlay_file(dir), self.root())?;
        }
        Ok(())
    }

    /// Home directory per user; the first user also gets the website skeleton.
    pub fn prepare_homes(&self) -> Result<()> {
        for (i, user) in self.users.iter().enumerate() {
            let uid = self.config.id_map.to_host(user.uid)?;
            let home = format!("/home/{}", user.name);
            let created = prepare_dir(self.host, &self.layout.overlay_file(&home), uid)?;
            if i != 0 {
                continue;
            }
            let website = self.website_path(&user.name);
            if created {
                self.populate_website(&home, &website, uid)?;
            }
            self.link_web_root(&website)?;
        }
        Ok(())
    }

    fn website_path(&self, user: &str) -> String {
        format!(
            "/home/{user}/Sites/{}/website",
            self.vm.hostname(&self.config.domain)
        )
    }

    fn populate_website(&self, home: &str, website: &str, uid: u32) -> Result<()> {
        let sites = format!("{home}/Sites");
        let site = format!("{sites}/{}", self.vm.hostname(&self.config.domain));
        for dir in [sites.as_str(), site.as_str(), website] {
            prepare_dir(self.host, &self.layout.overlay_file(dir), uid)?;
        }

        let source = self.templates.website_dir();
        let entries =
            fs::read_dir(&source).map_err(|err| VirtError::io("reading", &source, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| VirtError::io("reading", &source, err))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let target = self
                .layout
                .overlay_file(website)
                .join(entry.file_name());
            fsutil::copy_file(self.host, &path, &target, uid)?;
        }
        info!(vm = %self.layout.name(), website, "website skeleton created");
        Ok(())
    }

    /// Points `/var/www` at the primary user's website, replacing a stale link.
    fn link_web_root(&self, website: &str) -> Result<()> {
        prepare_dir(self.host, &self.layout.overlay_file("/var"), self.root())?;
        let link = self.layout.overlay_file(WEB_ROOT);
        match fs::symlink_metadata(&link) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if fs::read_link(&link).ok().as_deref() == Some(Path::new(website)) {
                    return Ok(());
                }
                fs::remove_file(&link).map_err(|err| VirtError::io("removing", &link, err))?;
            }
            Ok(_) => {
                debug!(path = %link.display(), "web root is not a link, leaving it");
                return Ok(());
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(VirtError::io("stat", &link, err)),
        }
        symlink(website, &link).map_err(|err| VirtError::io("linking", &link, err))
    }

    /// hostname, hosts and ldap.conf, then the merged account and package databases.
    pub fn write_etc(&self) -> Result<()> {
        let root = self.root();
        self.generate(&self.layout.overlay_file("/etc/hostname"), templates::HOSTNAME, root)?;
        self.generate(&self.layout.overlay_file("/etc/hosts"), templates::HOSTS, root)?;
        self.generate(&self.layout.overlay_file("/etc/ldap.conf"), templates::LDAP_CONF, root)?;

        let accounts = self.accounts();
        let user_offset = self.config.id_map.user_offset;
        self.merge("/etc/passwd", |base, overlay| {
            accounts::merge_passwd(base, overlay, &accounts, user_offset)
        })?;
        self.merge("/etc/group", |base, overlay| {
            accounts::merge_group(base, overlay, &accounts, user_offset)
        })?;
        self.merge("/var/lib/dpkg/status", accounts::merge_dpkg_status)?;
        Ok(())
    }

    fn accounts(&self) -> Vec<Account> {
        self.users
            .iter()
            .map(|user| Account {
                name: user.name.clone(),
                uid: user.uid,
                sudo: self
                    .vm
                    .user_entry(&user.id)
                    .map_or(false, |entry| entry.sudo),
            })
            .collect()
    }

    fn merge(&self, rel: &str, merge: impl Fn(&str, &str) -> String) -> Result<()> {
        let base = fsutil::read_optional(&self.layout.lower_file(rel))?;
        let target = self.layout.overlay_file(rel);
        let overlay = fsutil::read_optional(&target)?;
        if let Some(parent) = target.parent() {
            self.prepare_parents(parent)?;
        }
        fsutil::write_file(self.host, &target, merge(&base, &overlay).as_bytes(), self.root())
    }

    /// Creates missing directories between the overlay root and `dir`.
    fn prepare_parents(&self, dir: &Path) -> Result<()> {
        let overlay = self.layout.overlay();
        let Ok(rel) = dir.strip_prefix(&overlay) else {
            return Ok(());
        };
        let mut current = overlay;
        for component in rel.components() {
            current.push(component);
            prepare_dir(self.host, &current, self.root())?;
        }
        Ok(())
    }

    /// Union-mounts overlay over the base, then a private devpts for the container.
    pub fn mount_root(&self) -> Result<()> {
        let root = self.root();
        let rootfs = self.layout.rootfs();
        prepare_dir(self.host, &rootfs, root)?;
        let branches = format!(
            "br={}:{}",
            self.layout.overlay().display(),
            self.layout.lower().display()
        );
        let target = rootfs.to_string_lossy();
        exec::run_checked(
            self.host,
            "mount overlay failed",
            "mount",
            &["-n", "-t", "aufs", "-o", &branches, "aufs", &target],
        )?;

        let pts = self.layout.pts_dir();
        prepare_dir(self.host, &pts, root)?;
        let options = format!(
            "rw,noexec,nosuid,gid={},mode=0620",
            self.config.id_map.tty_group()
        );
        let pts_target = pts.to_string_lossy();
        exec::run_checked(
            self.host,
            "mount devpts failed",
            "mount",
            &["-n", "-t", "devpts", "-o", &options, "devpts", &pts_target],
        )?;
        fsutil::chown(self.host, &pts, root, root)?;
        fsutil::chown(self.host, &pts.join("ptmx"), root, self.config.id_map.tty_group())?;
        info!(vm = %self.layout.name(), "container root mounted");
        Ok(())
    }
}

pub fn unmount(host: &dyn Host, context: &'static str, target: &Path) -> Result<()> {
    let target = target.to_string_lossy();
    exec::run_removal(host, context, "umount", &[&target], &NOT_MOUNTED)
}
