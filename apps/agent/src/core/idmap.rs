use crate::error::{Result, VirtError};

/// Group id of `tty` inside the container; owns the pty multiplexer.
pub const TTY_GID: u32 = 5;

/// Maps container uids/gids to host ids.
///
/// Container ids below `user_offset - root_offset` are shifted by `root_offset`, so
/// container root is host `root_offset`. Ids at or above `user_offset` are global user ids
/// and pass through unchanged. Anything in between has no mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub root_offset: u32,
    pub user_offset: u32,
}

impl Default for IdMap {
    fn default() -> Self {
        Self {
            root_offset: 500_000,
            user_offset: 1_000_000,
        }
    }
}

impl IdMap {
    pub fn new(root_offset: u32, user_offset: u32) -> Result<Self> {
        if root_offset == 0 || user_offset <= root_offset {
            return Err(VirtError::InvalidIdMap {
                root_offset,
                user_offset,
            });
        }
        Ok(Self {
            root_offset,
            user_offset,
        })
    }

    /// Size of the shifted system range starting at container id 0.
    pub fn shifted_range(&self) -> u32 {
        self.user_offset - self.root_offset
    }

    pub fn to_host(&self, container_id: u32) -> Result<u32> {
        if container_id < self.shifted_range() {
            Ok(container_id + self.root_offset)
        } else if container_id >= self.user_offset {
            Ok(container_id)
        } else {
            Err(VirtError::UnmappedId(container_id))
        }
    }

    pub fn root(&self) -> u32 {
        self.root_offset
    }

    pub fn tty_group(&self) -> u32 {
        self.root_offset + TTY_GID
    }
}
