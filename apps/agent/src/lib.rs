//! Host-side provisioning of LXC containers backed by RBD block images.

pub mod config;
pub mod core;
pub mod error;
pub mod features;
pub mod layout;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{Result, VirtError};
pub use features::lifecycle::{ContainerState, Engine};
