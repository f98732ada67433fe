pub mod lifecycle;
pub mod network;
pub mod overlay;
pub mod snapshot;
pub mod storage;
pub mod templates;
