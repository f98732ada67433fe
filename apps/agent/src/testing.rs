//! Recording [`Host`] and a throwaway host tree used by the unit tests.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use virt_types::{RecordId, User, UserEntry, Vm};

use crate::config::Config;
use crate::core::exec::{command_line, CommandOutput, FsControl, Host};
use crate::features::templates::{shipped_dir, TemplateStore};
use crate::layout::Layout;

struct Rule {
    prefix: String,
    status: i32,
    output: String,
    remaining: Option<usize>,
}

struct Touch {
    prefix: String,
    path: PathBuf,
    dir: bool,
}

/// Answers every command with exit 0 unless a rule says otherwise.
///
/// `lxc-info` reports `STOPPED` by default. Files registered with [`FakeHost::touch_on`]
/// are created when a matching command succeeds, which is how tests make device nodes
/// appear after `rbd map`. Mounts never change the filesystem, so "mounted" trees stay
/// in place across unmounts and behave like data persisted on the block device.
pub struct FakeHost {
    calls: Mutex<Vec<String>>,
    rules: Mutex<Vec<Rule>>,
    touches: Mutex<Vec<Touch>>,
    chowns: Mutex<Vec<(PathBuf, u32, u32)>>,
    controls: Mutex<Vec<(PathBuf, FsControl)>>,
    failing_control: Mutex<Option<FsControl>>,
}

impl FakeHost {
    pub fn new() -> Self {
        let host = Self {
            calls: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            touches: Mutex::new(Vec::new()),
            chowns: Mutex::new(Vec::new()),
            controls: Mutex::new(Vec::new()),
            failing_control: Mutex::new(None),
        };
        host.respond("lxc-info", 0, "State:          STOPPED\n");
        host
    }

    /// Every command starting with `prefix` exits with `status` and prints `output`.
    /// Later rules take precedence over earlier ones.
    pub fn respond(&self, prefix: &str, status: i32, output: &str) {
        self.push_rule(prefix, status, output, None);
    }

    pub fn respond_once(&self, prefix: &str, status: i32, output: &str) {
        self.push_rule(prefix, status, output, Some(1));
    }

    fn push_rule(&self, prefix: &str, status: i32, output: &str, remaining: Option<usize>) {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.into(),
            status,
            output: output.into(),
            remaining,
        });
    }

    pub fn touch_on(&self, prefix: &str, path: impl Into<PathBuf>) {
        self.touches.lock().unwrap().push(Touch {
            prefix: prefix.into(),
            path: path.into(),
            dir: false,
        });
    }

    /// Like [`FakeHost::touch_on`] but creates a directory, standing in for what a real
    /// mount would expose.
    pub fn mkdir_on(&self, prefix: &str, path: impl Into<PathBuf>) {
        self.touches.lock().unwrap().push(Touch {
            prefix: prefix.into(),
            path: path.into(),
            dir: true,
        });
    }

    pub fn fail_control(&self, op: FsControl) {
        *self.failing_control.lock().unwrap() = Some(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|line| line.starts_with(prefix))
            .collect()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|line| line.starts_with(prefix))
    }

    pub fn chowns(&self) -> Vec<(PathBuf, u32, u32)> {
        self.chowns.lock().unwrap().clone()
    }

    pub fn owner_of(&self, path: &Path) -> Option<(u32, u32)> {
        self.chowns()
            .into_iter()
            .rev()
            .find(|(p, _, _)| p == path)
            .map(|(_, uid, gid)| (uid, gid))
    }

    pub fn controls(&self) -> Vec<(PathBuf, FsControl)> {
        self.controls.lock().unwrap().clone()
    }
}

impl Host for FakeHost {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let line = command_line(program, args);
        self.calls.lock().unwrap().push(line.clone());

        let mut status = 0;
        let mut output = String::new();
        {
            let mut rules = self.rules.lock().unwrap();
            let matched = rules.iter_mut().rev().find(|rule| {
                line.starts_with(&rule.prefix) && rule.remaining.map_or(true, |n| n > 0)
            });
            if let Some(rule) = matched {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                status = rule.status;
                output = rule.output.clone();
            }
        }

        if status == 0 {
            for touch in self.touches.lock().unwrap().iter() {
                if !line.starts_with(&touch.prefix) {
                    continue;
                }
                if touch.dir {
                    std::fs::create_dir_all(&touch.path)?;
                    continue;
                }
                if let Some(parent) = touch.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&touch.path, b"")?;
            }
        }

        Ok(CommandOutput {
            status: Some(status),
            output,
        })
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
        self.chowns
            .lock()
            .unwrap()
            .push((path.to_path_buf(), uid, gid));
        Ok(())
    }

    fn fs_control(&self, path: &Path, op: FsControl) -> std::io::Result<()> {
        self.controls
            .lock()
            .unwrap()
            .push((path.to_path_buf(), op));
        if *self.failing_control.lock().unwrap() == Some(op) {
            return Err(std::io::Error::from_raw_os_error(libc::EBUSY));
        }
        Ok(())
    }
}

/// Temporary lxc root with a small base image, the shipped templates and a VM at
/// 10.0.5.7 whose primary user is `alice` (sudo) followed by `bob`.
pub struct Sandbox {
    _tmp: tempfile::TempDir,
    pub config: Config,
    pub templates: TemplateStore,
    pub vm: Vm,
    pub users: Vec<User>,
}

impl Sandbox {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("vmroot/rootfs");
        fs::create_dir_all(base.join("etc")).unwrap();
        fs::create_dir_all(base.join("var/lib/dpkg")).unwrap();
        fs::write(base.join("etc/passwd"), "root:x:0:0:root:/root:/bin/bash\n").unwrap();
        fs::write(base.join("etc/group"), "root:x:0:\nsudo:x:27:\n").unwrap();
        fs::write(
            base.join("var/lib/dpkg/status"),
            "Package: bash\nStatus: install ok installed\n",
        )
        .unwrap();
        let config = Config {
            lxc_root: tmp.path().join("lxc"),
            base_rootfs: base,
            dpkg_backup_dir: tmp.path().join("dpkg-statuses"),
            rbd_device_dir: tmp.path().join("dev"),
            device_timeout: Duration::from_millis(200),
            device_poll_interval: Duration::from_millis(10),
            ..Config::default()
        };
        fs::create_dir_all(&config.lxc_root).unwrap();
        let templates =
            TemplateStore::from_dir(&shipped_dir(), Ipv4Addr::new(10, 0, 3, 1)).unwrap();
        let vm = Vm {
            id: RecordId::new(vec![0x10, 0x20]),
            name: "alice-vm".into(),
            users: vec![
                UserEntry {
                    id: RecordId::new(vec![1]),
                    sudo: true,
                },
                UserEntry {
                    id: RecordId::new(vec![2]),
                    sudo: false,
                },
            ],
            ldap_password: "pw".into(),
            ip: Some(Ipv4Addr::new(10, 0, 5, 7)),
            host_kite: String::new(),
        };
        let users = vec![
            User {
                id: RecordId::new(vec![1]),
                name: "alice".into(),
                uid: 1_000_001,
            },
            User {
                id: RecordId::new(vec![2]),
                name: "bob".into(),
                uid: 1_000_002,
            },
        ];
        Self {
            _tmp: tmp,
            config,
            templates,
            vm,
            users,
        }
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.config, &self.vm)
    }

    /// A host whose `rbd map` brings up the device node and whose root mount exposes
    /// `rootfs/dev`, the way the real mounts would.
    pub fn host(&self) -> FakeHost {
        let layout = self.layout();
        let host = FakeHost::new();
        host.touch_on("rbd map", layout.device());
        host.mkdir_on("mount -n -t aufs", layout.file("rootfs/dev"));
        host
    }
}
