use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::{Result, VirtError};

/// `_IOWR('X', 119, int)`: block new writes until thawed.
pub const FIFREEZE: u32 = 0xC004_5877;
/// `_IOWR('X', 120, int)`
pub const FITHAW: u32 = 0xC004_5878;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsControl {
    Freeze,
    Thaw,
}

impl FsControl {
    fn request(self) -> u32 {
        match self {
            FsControl::Freeze => FIFREEZE,
            FsControl::Thaw => FITHAW,
        }
    }
}

/// Exit status plus stdout and stderr of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    fn status_text(&self) -> String {
        match self.status {
            Some(code) => format!("exit status {code}"),
            None => "signal".into(),
        }
    }
}

/// Every privileged side effect of the engine goes through this trait.
pub trait Host: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput>;

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> std::io::Result<()>;

    fn fs_control(&self, path: &Path, op: FsControl) -> std::io::Result<()>;
}

/// The real host: spawns processes and issues syscalls directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct System;

impl Host for System {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let out = Command::new(program).args(args).output()?;
        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(CommandOutput {
            status: out.status.code(),
            output,
        })
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .map_err(std::io::Error::from)
    }

    fn fs_control(&self, path: &Path, op: FsControl) -> std::io::Result<()> {
        let dir = File::open(path)?;
        // SAFETY: the descriptor stays open for the duration of the call and both
        // requests take no argument buffer.
        let rc = unsafe { libc::ioctl(dir.as_raw_fd(), op.request() as _, 0) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Runs a command and only reports spawn failures; the caller inspects the status.
pub fn run(host: &dyn Host, program: &str, args: &[&str]) -> Result<CommandOutput> {
    let line = command_line(program, args);
    debug!(command = %line, "running");
    host.run(program, args)
        .map_err(|err| VirtError::io("spawning", program, err))
}

/// Runs a command and turns a non-zero exit into [`VirtError::Command`].
pub fn run_checked(
    host: &dyn Host,
    context: &'static str,
    program: &str,
    args: &[&str],
) -> Result<CommandOutput> {
    let out = run(host, program, args)?;
    if out.success() {
        Ok(out)
    } else {
        Err(command_error(context, program, args, &out))
    }
}

pub fn command_error(
    context: &'static str,
    program: &str,
    args: &[&str],
    out: &CommandOutput,
) -> VirtError {
    VirtError::Command {
        context,
        command: command_line(program, args),
        status: out.status_text(),
        output: out.output.trim_end().to_string(),
    }
}

/// Like [`run_checked`], but a failure whose output matches one of `absent` means the
/// thing being removed is already gone and counts as success.
pub fn run_removal(
    host: &dyn Host,
    context: &'static str,
    program: &str,
    args: &[&str],
    absent: &[&str],
) -> Result<()> {
    let out = run(host, program, args)?;
    if out.success() {
        return Ok(());
    }
    if absent.iter().any(|needle| out.output.contains(needle)) {
        debug!(command = %command_line(program, args), "already absent");
        return Ok(());
    }
    Err(command_error(context, program, args, &out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_captures_stdout_and_stderr() {
        let out = System
            .run("sh", &["-c", "echo out; echo err >&2; exit 3"])
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[test]
    fn command_errors_embed_command_and_output() {
        let out = CommandOutput {
            status: Some(2),
            output: "mount: bad superblock\n".into(),
        };
        let err = command_error("mount rbd failed", "mount", &["-t", "ext4"], &out);
        let text = err.to_string();
        assert!(text.contains("mount rbd failed"));
        assert!(text.contains("`mount -t ext4`"));
        assert!(text.contains("exit status 2"));
        assert!(text.contains("bad superblock"));
    }

    #[test]
    fn removal_tolerates_absent_targets() {
        let absent = ["No such process"];
        let gone = ["-c", "echo 'No such process' >&2; exit 2"];
        assert!(run_removal(&System, "rm", "sh", &gone, &absent).is_ok());
        let broken = ["-c", "echo boom; exit 2"];
        assert!(run_removal(&System, "rm", "sh", &broken, &absent).is_err());
    }
}
