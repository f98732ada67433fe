//! Per-VM link isolation (ebtables) and the host route that advertises the VM address.

use std::net::Ipv4Addr;

use tracing::info;
use virt_types::{MacAddr, Vm};

use crate::config::Config;
use crate::core::exec::{self, Host};
use crate::error::{FirstError, Result, VirtError};

/// Output fragments meaning the ACL rule is not installed.
const RULE_ABSENT: [&str; 4] = [
    "rule does not exist",
    "Bad rule",
    "doesn't exist",
    "does not exist",
];
/// Output fragments meaning the route is not installed.
const ROUTE_ABSENT: [&str; 2] = ["No such process", "Cannot find device"];

/// The (MAC, IP, interface) triple the ACL admits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub veth: String,
}

impl Binding {
    pub fn for_vm(vm: &Vm) -> Option<Self> {
        let ip = vm.ip?;
        Some(Self {
            ip,
            mac: MacAddr::for_ip(ip),
            veth: virt_types::veth_name(ip),
        })
    }

    fn acl(&self, host: &dyn Host, config: &Config, action: Action) -> Result<()> {
        let mac = self.mac.to_string();
        let ip = self.ip.to_string();
        let flag = match action {
            Action::Install => "--append",
            Action::Remove => "--delete",
        };
        let args = [
            flag,
            config.acl_chain.as_str(),
            "--protocol",
            "IPv4",
            "--source",
            mac.as_str(),
            "--ip-src",
            ip.as_str(),
            "--in-interface",
            self.veth.as_str(),
            "--jump",
            "ACCEPT",
        ];
        match action {
            Action::Install => {
                exec::run_checked(host, "ebtables rule addition failed", "ebtables", &args)?;
                Ok(())
            }
            Action::Remove => exec::run_removal(
                host,
                "ebtables rule deletion failed",
                "ebtables",
                &args,
                &RULE_ABSENT,
            ),
        }
    }

    fn route(&self, host: &dyn Host, config: &Config, action: Action) -> Result<()> {
        let ip = self.ip.to_string();
        match action {
            Action::Install => {
                let args = ["route", "add", ip.as_str(), "dev", config.bridge.as_str()];
                exec::run_checked(host, "adding route failed", "ip", &args)?;
                Ok(())
            }
            Action::Remove => {
                let args = ["route", "del", ip.as_str(), "dev", config.bridge.as_str()];
                exec::run_removal(host, "removing route failed", "ip", &args, &ROUTE_ABSENT)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Install,
    Remove,
}

/// Installs the ACL rule and the host route for the VM's address.
pub fn isolate(host: &dyn Host, config: &Config, vm: &Vm) -> Result<()> {
    let binding = Binding::for_vm(vm).ok_or_else(|| VirtError::NoAddress(vm.name.clone()))?;
    binding.acl(host, config, Action::Install)?;
    binding.route(host, config, Action::Install)?;
    info!(vm = %vm.name, ip = %binding.ip, veth = %binding.veth, "network isolation installed");
    Ok(())
}

/// Removes the ACL rule and the route. Both are attempted; absence is not an error.
pub fn deisolate(host: &dyn Host, config: &Config, vm: &Vm) -> Result<()> {
    let Some(binding) = Binding::for_vm(vm) else {
        return Ok(());
    };
    let mut errors = FirstError::default();
    errors.record("remove acl", binding.acl(host, config, Action::Remove));
    errors.record("remove route", binding.route(host, config, Action::Remove));
    errors.finish()
}
