use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum VirtError {
    #[error("{context}: `{command}` exited with {status}\n{output}")]
    Command {
        context: &'static str,
        command: String,
        status: String,
        output: String,
    },
    #[error("block device {} not ready after {waited:?}", .path.display())]
    DeviceNotReady { path: PathBuf, waited: Duration },
    #[error("container {name} did not stop (state {state})\n{output}")]
    NotStopped {
        name: String,
        state: String,
        output: String,
    },
    #[error("template {name}: {source}")]
    Template {
        name: String,
        #[source]
        source: tera::Error,
    },
    #[error("{context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bridge {bridge}: {reason}")]
    Bridge { bridge: String, reason: String },
    #[error("vm {0} has no network address")]
    NoAddress(String),
    #[error("id {0} has no host mapping")]
    UnmappedId(u32),
    #[error("invalid id offsets (root {root_offset}, user {user_offset})")]
    InvalidIdMap { root_offset: u32, user_offset: u32 },
    #[error(transparent)]
    InvalidRecord(#[from] virt_types::VmRecordError),
    #[error("prepare failed at {step}: {source}")]
    Setup {
        step: &'static str,
        #[source]
        source: Box<VirtError>,
    },
}

impl VirtError {
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VirtError::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// Wraps a failure inside `prepare`; the VM must be unprepared before a retry.
    pub fn setup(step: &'static str, source: VirtError) -> Self {
        match source {
            already @ VirtError::Setup { .. } => already,
            other => VirtError::Setup {
                step,
                source: Box::new(other),
            },
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, VirtError::Setup { .. } | VirtError::NotStopped { .. })
    }
}

pub type Result<T, E = VirtError> = std::result::Result<T, E>;

/// Runs teardown steps to completion and keeps only the first failure.
#[derive(Debug, Default)]
pub struct FirstError {
    first: Option<VirtError>,
    failed: usize,
}

impl FirstError {
    pub fn record(&mut self, step: &'static str, result: Result<()>) {
        if let Err(err) = result {
            warn!(step, error = %err, "teardown step failed");
            self.failed += 1;
            if self.first.is_none() {
                self.first = Some(err);
            }
        }
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn finish(self) -> Result<()> {
        match self.first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_error(context: &'static str) -> VirtError {
        VirtError::Command {
            context,
            command: "true".into(),
            status: "exit status: 1".into(),
            output: String::new(),
        }
    }

    #[test]
    fn first_error_keeps_earliest_failure() {
        let mut errors = FirstError::default();
        errors.record("a", Ok(()));
        errors.record("b", Err(command_error("first")));
        errors.record("c", Err(command_error("second")));
        assert_eq!(errors.failed(), 2);
        match errors.finish() {
            Err(VirtError::Command { context, .. }) => assert_eq!(context, "first"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn setup_errors_are_fatal_and_not_nested() {
        let err = VirtError::setup("mount", command_error("mount failed"));
        assert!(err.is_fatal());
        let err = VirtError::setup("outer", err);
        match err {
            VirtError::Setup { step, .. } => assert_eq!(step, "mount"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!command_error("x").is_fatal());
    }
}
