use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;

use crate::core::exec::Host;
use crate::error::{Result, VirtError};

/// Creates `path` (mode 0755) if missing and chowns it to `id:id`.
/// Returns whether the directory was newly created.
pub fn prepare_dir(host: &dyn Host, path: &Path, id: u32) -> Result<bool> {
    let created = match DirBuilder::new().mode(0o755).create(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => false,
        Err(err) => return Err(VirtError::io("creating directory", path, err)),
    };
    chown(host, path, id, id)?;
    Ok(created)
}

pub fn chown(host: &dyn Host, path: &Path, uid: u32, gid: u32) -> Result<()> {
    host.chown(path, uid, gid)
        .map_err(|err| VirtError::io("chown", path, err))
}

/// Replaces `path` with `contents` (mode 0644) owned by `id:id`.
pub fn write_file(host: &dyn Host, path: &Path, contents: &[u8], id: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
        .map_err(|err| VirtError::io("opening", path, err))?;
    file.write_all(contents)
        .map_err(|err| VirtError::io("writing", path, err))?;
    chown(host, path, id, id)
}

/// Copies a regular file keeping its permission bits, then chowns the copy to `id:id`.
pub fn copy_file(host: &dyn Host, src: &Path, dst: &Path, id: u32) -> Result<()> {
    let mut source = File::open(src).map_err(|err| VirtError::io("opening", src, err))?;
    let mode = source
        .metadata()
        .map_err(|err| VirtError::io("stat", src, err))?
        .permissions();
    let mut target = File::create(dst).map_err(|err| VirtError::io("creating", dst, err))?;
    io::copy(&mut source, &mut target).map_err(|err| VirtError::io("copying to", dst, err))?;
    fs::set_permissions(dst, mode).map_err(|err| VirtError::io("chmod", dst, err))?;
    chown(host, dst, id, id)
}

/// Reads a file, treating a missing file as empty.
pub fn read_optional(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(VirtError::io("reading", path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn prepare_dir_reports_creation_once_and_always_chowns() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new();
        let dir = tmp.path().join("home");

        assert!(prepare_dir(&host, &dir, 7).unwrap());
        assert!(!prepare_dir(&host, &dir, 7).unwrap());
        assert_eq!(host.owner_of(&dir), Some((7, 7)));
        assert_eq!(host.chowns().len(), 2);
    }

    #[test]
    fn prepare_dir_fails_without_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let err = prepare_dir(&FakeHost::new(), &tmp.path().join("a/b"), 0).unwrap_err();
        assert!(matches!(err, VirtError::Io { .. }));
    }

    #[test]
    fn copy_keeps_mode_and_sets_owner() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new();
        let src = tmp.path().join("run.sh");
        let dst = tmp.path().join("copy.sh");
        fs::write(&src, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o750)).unwrap();

        copy_file(&host, &src, &dst, 1_000_001).unwrap();

        assert_eq!(fs::read(&dst).unwrap(), b"#!/bin/sh\n");
        assert_eq!(fs::metadata(&dst).unwrap().permissions().mode() & 0o777, 0o750);
        assert_eq!(host.owner_of(&dst), Some((1_000_001, 1_000_001)));
    }

    #[test]
    fn missing_files_read_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(read_optional(&tmp.path().join("nope")).unwrap(), "");
    }
}
