//! Shared VM record types and the identifiers derived from them.
//!
//! Every host-global resource name the engine touches (container directory, block image,
//! veth interface, ACL entry) is a pure function of a [`Vm`]'s id or address, so two live
//! VMs can only collide if their ids or addresses collide.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Prefix of every container name, image name and VM directory.
pub const CONTAINER_PREFIX: &str = "vm-";
/// Prefix of the host-side virtual interface of a container.
pub const VETH_PREFIX: &str = "veth-";
/// Leading bytes of every derived link-layer address.
pub const MAC_PREFIX: [u8; 2] = [0x00, 0x00];

/// Opaque, externally assigned record identity, carried as hex on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(Vec<u8>);

impl RecordId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Err(serde::de::Error::custom("record id must not be empty"));
        }
        RecordId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A user assigned to a VM. The first entry of [`Vm::users`] is the owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserEntry {
    pub id: RecordId,
    #[serde(default)]
    pub sudo: bool,
}

/// Account data the caller resolves for each [`UserEntry`] before `Prepare`.
///
/// `uid` is the id inside the container; the engine maps it to a host id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: RecordId,
    pub name: String,
    pub uid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vm {
    pub id: RecordId,
    pub name: String,
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub ldap_password: String,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub host_kite: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmRecordError {
    #[error("user {0} is assigned twice")]
    DuplicateUser(RecordId),
    #[error("vm name must not be empty")]
    EmptyName,
    #[error("{0:?} is not usable as a vm name")]
    InvalidVmName(String),
    #[error("{0:?} is not usable as a user name")]
    InvalidUserName(String),
}

/// A name that ends up as a single path component or an `/etc/passwd` field.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name
            .chars()
            .any(|c| c == '/' || c == ':' || c.is_whitespace() || c.is_control())
}

impl User {
    pub fn validate(&self) -> Result<(), VmRecordError> {
        if !is_plain_name(&self.name) {
            return Err(VmRecordError::InvalidUserName(self.name.clone()));
        }
        Ok(())
    }
}

impl Vm {
    /// `vm-<hex id>`; used for the container, its directory and its block image.
    pub fn container_name(&self) -> String {
        format!("{CONTAINER_PREFIX}{}", self.id.to_hex())
    }

    pub fn hostname(&self, domain: &str) -> String {
        format!("{}.{}", self.name, domain)
    }

    pub fn mac(&self) -> Option<MacAddr> {
        self.ip.map(MacAddr::for_ip)
    }

    pub fn veth(&self) -> Option<String> {
        self.ip.map(veth_name)
    }

    pub fn user_entry(&self, user_id: &RecordId) -> Option<&UserEntry> {
        self.users.iter().find(|entry| &entry.id == user_id)
    }

    pub fn primary_entry(&self) -> Option<&UserEntry> {
        self.users.first()
    }

    pub fn validate(&self) -> Result<(), VmRecordError> {
        if self.name.is_empty() {
            return Err(VmRecordError::EmptyName);
        }
        if !is_plain_name(&self.name) {
            return Err(VmRecordError::InvalidVmName(self.name.clone()));
        }
        for (i, entry) in self.users.iter().enumerate() {
            if self.users[..i].iter().any(|other| other.id == entry.id) {
                return Err(VmRecordError::DuplicateUser(entry.id.clone()));
            }
        }
        Ok(())
    }
}

/// Six-byte link-layer address, rendered `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn for_ip(ip: Ipv4Addr) -> Self {
        let [a, b, c, d] = ip.octets();
        Self([MAC_PREFIX[0], MAC_PREFIX[1], a, b, c, d])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

pub fn veth_name(ip: Ipv4Addr) -> String {
    format!("{VETH_PREFIX}{}", hex::encode(ip.octets()))
}
