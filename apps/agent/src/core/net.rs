use std::net::Ipv4Addr;

use crate::core::exec::{self, Host};
use crate::error::{Result, VirtError};

/// IPv4 address configured on `bridge`, read from `ip -4 -o addr show`.
pub fn bridge_address(host: &dyn Host, bridge: &str) -> Result<Ipv4Addr> {
    let out = exec::run(host, "ip", &["-4", "-o", "addr", "show", "dev", bridge])?;
    if !out.success() {
        return Err(VirtError::Bridge {
            bridge: bridge.into(),
            reason: out.output.trim().to_string(),
        });
    }
    parse_inet(&out.output).ok_or_else(|| VirtError::Bridge {
        bridge: bridge.into(),
        reason: "no IPv4 address configured".into(),
    })
}

fn parse_inet(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        words.find(|word| *word == "inet")?;
        let cidr = words.next()?;
        cidr.split('/').next()?.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    #[test]
    fn parses_first_inet_address() {
        let output = "3: lxcbr0    inet 10.0.3.1/24 brd 10.0.3.255 scope global lxcbr0\\       \
valid_lft forever preferred_lft forever\n";
        assert_eq!(parse_inet(output), Some(Ipv4Addr::new(10, 0, 3, 1)));
        assert_eq!(parse_inet(""), None);
    }

    #[test]
    fn missing_bridge_is_an_error() {
        let host = FakeHost::new();
        host.respond("ip -4", 1, "Device \"lxcbr0\" does not exist.\n");
        match bridge_address(&host, "lxcbr0") {
            Err(VirtError::Bridge { bridge, reason }) => {
                assert_eq!(bridge, "lxcbr0");
                assert!(reason.contains("does not exist"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unaddressed_bridge_is_an_error() {
        let host = FakeHost::new();
        host.respond("ip -4", 0, "");
        assert!(matches!(
            bridge_address(&host, "lxcbr0"),
            Err(VirtError::Bridge { .. })
        ));
    }
}
