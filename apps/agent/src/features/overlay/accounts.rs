//! Merging of the system databases the base image and the overlay both carry.
//!
//! Entries keep base order, overlay-only entries are appended, and an overlay entry
//! replaces the base entry with the same key. VM users are applied last; entries in the
//! VM user id range that no longer belong to a VM user are dropped.

use std::collections::HashMap;

/// Group that grants sudo inside the container.
pub const SUDO_GROUP: &str = "sudo";
const SUDO_GID: u32 = 27;

/// A VM user as it appears in the container's account files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub sudo: bool,
}

#[derive(Debug, Default)]
struct Keyed {
    order: Vec<String>,
    entries: HashMap<String, String>,
}

impl Keyed {
    fn upsert(&mut self, key: String, entry: String) {
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    fn get(&self, key: &str) -> Option<&String> {
        self.entries.get(key)
    }

    fn iter(&self) -> impl Iterator<Item = &String> {
        self.order.iter().filter_map(|key| self.entries.get(key))
    }
}

fn colon_entries(text: &str) -> impl Iterator<Item = (String, String)> + '_ {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let key = line.split(':').next()?;
            Some((key.to_string(), line.to_string()))
        })
}

fn merge_colon_files(base: &str, overlay: &str) -> Keyed {
    let mut merged = Keyed::default();
    for (key, line) in colon_entries(base).chain(colon_entries(overlay)) {
        merged.upsert(key, line);
    }
    merged
}

fn render_lines<'a>(lines: impl Iterator<Item = &'a String>) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Third field of a passwd or group line: the uid or gid.
fn id_field(line: &str) -> Option<u32> {
    line.split(':').nth(2)?.parse().ok()
}

/// Removes entries in the VM user id range whose user is no longer assigned.
fn drop_stale(merged: &mut Keyed, accounts: &[Account], user_offset: u32) -> Vec<String> {
    let stale: Vec<String> = merged
        .order
        .iter()
        .filter(|key| !accounts.iter().any(|account| &account.name == *key))
        .filter(|key| {
            merged
                .get(key)
                .and_then(|line| id_field(line))
                .map_or(false, |id| id >= user_offset)
        })
        .cloned()
        .collect();
    for key in &stale {
        merged.remove(key);
    }
    stale
}

pub fn merge_passwd(base: &str, overlay: &str, accounts: &[Account], user_offset: u32) -> String {
    let mut merged = merge_colon_files(base, overlay);
    drop_stale(&mut merged, accounts, user_offset);
    for account in accounts {
        merged.upsert(
            account.name.clone(),
            format!(
                "{name}:x:{uid}:{uid}:,,,:/home/{name}:/bin/bash",
                name = account.name,
                uid = account.uid
            ),
        );
    }
    render_lines(merged.iter())
}

/// Sudo membership of VM users is rebuilt from `accounts` on every merge; members that
/// are not VM users are kept.
pub fn merge_group(base: &str, overlay: &str, accounts: &[Account], user_offset: u32) -> String {
    let mut merged = merge_colon_files(base, overlay);
    let mut managed = drop_stale(&mut merged, accounts, user_offset);
    for account in accounts {
        managed.push(account.name.clone());
        merged.upsert(
            account.name.clone(),
            format!("{}:x:{}:", account.name, account.uid),
        );
    }

    let admins: Vec<&str> = accounts
        .iter()
        .filter(|account| account.sudo)
        .map(|account| account.name.as_str())
        .collect();
    let line = match merged.get(SUDO_GROUP) {
        Some(line) => Some(line.clone()),
        None if !admins.is_empty() => Some(format!("{SUDO_GROUP}:x:{SUDO_GID}:")),
        None => None,
    };
    if let Some(line) = line {
        merged.upsert(SUDO_GROUP.into(), with_members(&line, &managed, &admins));
    }
    render_lines(merged.iter())
}

fn with_members(group_line: &str, managed: &[String], admins: &[&str]) -> String {
    let mut fields: Vec<&str> = group_line.splitn(4, ':').collect();
    fields.resize(4, "");
    let mut members: Vec<&str> = fields[3]
        .split(',')
        .filter(|member| !member.is_empty())
        .filter(|member| !managed.iter().any(|name| name.as_str() == *member))
        .collect();
    members.extend_from_slice(admins);
    let joined = members.join(",");
    format!("{}:{}:{}:{}", fields[0], fields[1], fields[2], joined)
}

/// Paragraphs without a `Package:` field are keyed by `source` and position so they
/// never replace each other across files.
fn dpkg_paragraphs<'a>(
    source: &'a str,
    text: &'a str,
) -> impl Iterator<Item = (String, String)> + 'a {
    text.split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .enumerate()
        .map(move |(i, paragraph)| {
            let key = paragraph
                .lines()
                .find_map(|line| line.strip_prefix("Package:"))
                .map(|name| name.trim().to_string())
                .unwrap_or_else(|| format!("#{source}{i}"));
            (key, paragraph.to_string())
        })
}

/// Merges two `/var/lib/dpkg/status` files, keyed by `Package:`.
pub fn merge_dpkg_status(base: &str, overlay: &str) -> String {
    let mut merged = Keyed::default();
    let paragraphs = dpkg_paragraphs("base", base).chain(dpkg_paragraphs("overlay", overlay));
    for (key, paragraph) in paragraphs {
        merged.upsert(key, paragraph);
    }
    let mut out = String::new();
    for paragraph in merged.iter() {
        out.push_str(paragraph);
        out.push_str("\n\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER_OFFSET: u32 = 1_000_000;
    const BASE_PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n\
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
www-data:x:33:33:www-data:/var/www:/usr/sbin/nologin\n";

    fn alice(sudo: bool) -> Account {
        Account {
            name: "alice".into(),
            uid: 1_000_001,
            sudo,
        }
    }

    #[test]
    fn passwd_keeps_base_order_and_applies_overrides() {
        let overlay = "daemon:x:1:1:daemon:/usr/sbin:/bin/sh\n\
postgres:x:105:110::/var/lib/postgresql:/bin/bash\n";
        let merged = merge_passwd(BASE_PASSWD, overlay, &[alice(false)], USER_OFFSET);
        let lines: Vec<&str> = merged.lines().collect();
        assert_eq!(
            lines,
            vec![
                "root:x:0:0:root:/root:/bin/bash",
                "daemon:x:1:1:daemon:/usr/sbin:/bin/sh",
                "www-data:x:33:33:www-data:/var/www:/usr/sbin/nologin",
                "postgres:x:105:110::/var/lib/postgresql:/bin/bash",
                "alice:x:1000001:1000001:,,,:/home/alice:/bin/bash",
            ]
        );
    }

    #[test]
    fn merging_is_idempotent() {
        let once = merge_passwd(BASE_PASSWD, "", &[alice(false)], USER_OFFSET);
        let twice = merge_passwd(BASE_PASSWD, &once, &[alice(false)], USER_OFFSET);
        assert_eq!(once, twice);
    }

    #[test]
    fn removed_vm_users_are_dropped_but_local_accounts_stay() {
        let overlay = "postgres:x:105:110::/var/lib/postgresql:/bin/bash\n\
bob:x:1000002:1000002:,,,:/home/bob:/bin/bash\n";
        let merged = merge_passwd(BASE_PASSWD, overlay, &[alice(false)], USER_OFFSET);
        assert!(merged.contains("postgres:x:105:"));
        assert!(!merged.contains("bob"));

        let group = merge_group("root:x:0:\nbob:x:1000002:\n", "", &[alice(false)], USER_OFFSET);
        assert_eq!(group, "root:x:0:\nalice:x:1000001:\n");
    }

    #[test]
    fn sudo_users_join_the_sudo_group() {
        let base = "root:x:0:\nsudo:x:27:ubuntu\n";
        let merged = merge_group(base, "", &[alice(true)], USER_OFFSET);
        assert!(merged.contains("sudo:x:27:ubuntu,alice\n"));
        assert!(merged.contains("alice:x:1000001:\n"));

        let again = merge_group(base, &merged, &[alice(true)], USER_OFFSET);
        assert_eq!(merged, again);
    }

    #[test]
    fn clearing_the_flag_revokes_sudo() {
        let base = "root:x:0:\nsudo:x:27:ubuntu\n";
        let granted = merge_group(base, "", &[alice(true)], USER_OFFSET);
        assert!(granted.contains("sudo:x:27:ubuntu,alice\n"));

        let revoked = merge_group(base, &granted, &[alice(false)], USER_OFFSET);
        assert!(revoked.contains("sudo:x:27:ubuntu\n"));

        let emptied = merge_group(base, &granted, &[], USER_OFFSET);
        assert_eq!(emptied, "root:x:0:\nsudo:x:27:ubuntu\n");
    }

    #[test]
    fn sudo_group_is_created_when_missing() {
        let merged = merge_group("root:x:0:\n", "", &[alice(true)], USER_OFFSET);
        assert!(merged.ends_with("sudo:x:27:alice\n"));
        let merged = merge_group("root:x:0:\n", "", &[alice(false)], USER_OFFSET);
        assert!(!merged.contains("sudo"));
    }

    #[test]
    fn dpkg_status_merges_by_package() {
        let base = "Package: bash\nStatus: install ok installed\nVersion: 4.2\n\n\
Package: coreutils\nStatus: install ok installed\nVersion: 8.13\n";
        let overlay = "Package: bash\nStatus: install ok installed\nVersion: 4.3\n\n\
Package: vim\nStatus: install ok installed\nVersion: 7.3\n";
        let merged = merge_dpkg_status(base, overlay);
        assert_eq!(
            merged,
            "Package: bash\nStatus: install ok installed\nVersion: 4.3\n\n\
Package: coreutils\nStatus: install ok installed\nVersion: 8.13\n\n\
Package: vim\nStatus: install ok installed\nVersion: 7.3\n\n"
        );
    }

    #[test]
    fn unnamed_dpkg_paragraphs_do_not_replace_each_other() {
        let base = "Comment: from base\n\nPackage: bash\nVersion: 4.2\n";
        let overlay = "Comment: from overlay\n";
        let merged = merge_dpkg_status(base, overlay);
        assert!(merged.contains("Comment: from base\n\n"));
        assert!(merged.contains("Comment: from overlay\n\n"));
    }
}
