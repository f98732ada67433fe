use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::core::idmap::IdMap;

/// Host conventions shared by the engine and the surrounding tooling.
#[derive(Debug, Clone)]
pub struct Config {
    pub lxc_root: PathBuf,
    /// Read-only lower layer shared by every container.
    pub base_rootfs: PathBuf,
    /// Holds `lxc/` (config templates) and `website/` (primary user skeleton).
    pub template_dir: PathBuf,
    pub dpkg_backup_dir: PathBuf,
    pub bridge: String,
    pub domain: String,
    pub rbd_pool: String,
    pub rbd_device_dir: PathBuf,
    pub image_size_mb: u64,
    pub device_timeout: Duration,
    pub device_poll_interval: Duration,
    pub acl_chain: String,
    pub id_map: IdMap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lxc_root: "/var/lib/lxc".into(),
            base_rootfs: "/var/lib/lxc/vmroot/rootfs".into(),
            template_dir: "/opt/virt/templates".into(),
            dpkg_backup_dir: "/var/lib/lxc/dpkg-statuses".into(),
            bridge: "lxcbr0".into(),
            domain: "koding.com".into(),
            rbd_pool: "vms".into(),
            rbd_device_dir: "/dev/rbd/vms".into(),
            image_size_mb: 1200,
            device_timeout: Duration::from_secs(60),
            device_poll_interval: Duration::from_millis(500),
            acl_chain: "VMS".into(),
            id_map: IdMap::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        Ok(Self {
            lxc_root: env_path("VIRT_LXC_ROOT", defaults.lxc_root),
            base_rootfs: env_path("VIRT_BASE_ROOTFS", defaults.base_rootfs),
            template_dir: env_path("VIRT_TEMPLATE_DIR", defaults.template_dir),
            dpkg_backup_dir: env_path("VIRT_DPKG_BACKUP_DIR", defaults.dpkg_backup_dir),
            bridge: std::env::var("VIRT_BRIDGE").unwrap_or(defaults.bridge),
            domain: std::env::var("VIRT_DOMAIN").unwrap_or(defaults.domain),
            rbd_pool: std::env::var("VIRT_RBD_POOL").unwrap_or(defaults.rbd_pool),
            rbd_device_dir: env_path("VIRT_RBD_DEVICE_DIR", defaults.rbd_device_dir),
            image_size_mb: env_parse("VIRT_IMAGE_SIZE_MB", defaults.image_size_mb)?,
            device_timeout: env_parse_opt("VIRT_DEVICE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.device_timeout),
            device_poll_interval: env_parse_opt("VIRT_DEVICE_POLL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.device_poll_interval),
            acl_chain: std::env::var("VIRT_ACL_CHAIN").unwrap_or(defaults.acl_chain),
            id_map: IdMap::new(
                env_parse("VIRT_ROOT_ID_OFFSET", defaults.id_map.root_offset)?,
                env_parse("VIRT_USER_ID_OFFSET", defaults.id_map.user_offset)?,
            )?,
        })
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var_os(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(env_parse_opt(key)?.unwrap_or(default))
}

fn env_parse_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("{key} has invalid value {raw:?}")),
        Err(_) => Ok(None),
    }
}
