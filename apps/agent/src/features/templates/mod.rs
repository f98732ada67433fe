//! Host-specific config templates, compiled once at startup.
//!
//! `<template_dir>/lxc/*` are Tera templates rendered with a `vm` object (see
//! [`VmContext`]) and a `host_ip()` function returning the bridge address.
//! `<template_dir>/website/*` is copied verbatim into the primary user's site.

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tera::{Context, Tera, Value};
use tracing::{debug, info};
use virt_types::{User, Vm};

use crate::config::Config;
use crate::core::exec::Host;
use crate::core::net;
use crate::error::{Result, VirtError};
use crate::layout::Layout;

pub const CONFIG: &str = "config";
pub const FSTAB: &str = "fstab";
pub const HOSTNAME: &str = "hostname";
pub const HOSTS: &str = "hosts";
pub const LDAP_CONF: &str = "ldap.conf";

const REQUIRED: [&str; 5] = [CONFIG, FSTAB, HOSTNAME, HOSTS, LDAP_CONF];

/// Compiled templates. Read-only after construction and shared freely across VMs.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    tera: Tera,
    dir: PathBuf,
    host_ip: Ipv4Addr,
}

impl TemplateStore {
    /// Resolves the bridge address and compiles every template under `template_dir/lxc`.
    pub fn load(host: &dyn Host, config: &Config) -> Result<Self> {
        let host_ip = net::bridge_address(host, &config.bridge)?;
        info!(bridge = %config.bridge, %host_ip, "resolved bridge address");
        Self::from_dir(&config.template_dir, host_ip)
    }

    pub fn from_dir(dir: &Path, host_ip: Ipv4Addr) -> Result<Self> {
        let lxc_dir = dir.join("lxc");
        let entries =
            fs::read_dir(&lxc_dir).map_err(|err| VirtError::io("reading", &lxc_dir, err))?;

        let mut sources = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| VirtError::io("reading", &lxc_dir, err))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let source =
                fs::read_to_string(&path).map_err(|err| VirtError::io("reading", &path, err))?;
            debug!(template = %name, "loaded template");
            sources.push((name, source));
        }

        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.add_raw_templates(sources)
            .map_err(|source| VirtError::Template {
                name: lxc_dir.display().to_string(),
                source,
            })?;

        for name in REQUIRED {
            if !tera.get_template_names().any(|loaded| loaded == name) {
                return Err(VirtError::Template {
                    name: name.into(),
                    source: tera::Error::msg(format!("missing from {}", lxc_dir.display())),
                });
            }
        }

        let rendered_ip = host_ip.to_string();
        tera.register_function("host_ip", move |_: &HashMap<String, Value>| {
            Ok(Value::String(rendered_ip.clone()))
        });

        let count = tera.get_template_names().count();
        info!(dir = %dir.display(), templates = count, "templates compiled");
        Ok(Self {
            tera,
            dir: dir.to_path_buf(),
            host_ip,
        })
    }

    pub fn host_ip(&self) -> Ipv4Addr {
        self.host_ip
    }

    pub fn website_dir(&self) -> PathBuf {
        self.dir.join("website")
    }

    pub fn render(&self, name: &str, vm: &VmContext) -> Result<String> {
        let mut context = Context::new();
        context.insert("vm", vm);
        self.tera
            .render(name, &context)
            .map_err(|source| VirtError::Template {
                name: name.into(),
                source,
            })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserContext {
    pub name: String,
    pub uid: u32,
    pub sudo: bool,
}

/// The `vm` object templates see.
#[derive(Debug, Clone, Serialize)]
pub struct VmContext {
    pub id: String,
    pub name: String,
    pub container: String,
    pub hostname: String,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub veth: Option<String>,
    pub ldap_password: String,
    pub host_kite: String,
    pub bridge: String,
    pub rootfs: String,
    pub fstab: String,
    pub root_id_offset: u32,
    pub user_id_offset: u32,
    pub shifted_ids: u32,
    pub users: Vec<UserContext>,
}

impl VmContext {
    pub fn new(config: &Config, layout: &Layout, vm: &Vm, users: &[User]) -> Self {
        Self {
            id: vm.id.to_hex(),
            name: vm.name.clone(),
            container: layout.name().to_string(),
            hostname: vm.hostname(&config.domain),
            ip: vm.ip.map(|ip| ip.to_string()),
            mac: vm.mac().map(|mac| mac.to_string()),
            veth: vm.veth(),
            ldap_password: vm.ldap_password.clone(),
            host_kite: vm.host_kite.clone(),
            bridge: config.bridge.clone(),
            rootfs: layout.rootfs().display().to_string(),
            fstab: layout.fstab().display().to_string(),
            root_id_offset: config.id_map.root_offset,
            user_id_offset: config.id_map.user_offset,
            shifted_ids: config.id_map.shifted_range(),
            users: users
                .iter()
                .map(|user| UserContext {
                    name: user.name.clone(),
                    uid: user.uid,
                    sudo: vm.user_entry(&user.id).map_or(false, |entry| entry.sudo),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
pub(crate) fn shipped_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("templates")
}
