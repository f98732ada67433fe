pub mod exec;
pub mod fsutil;
pub mod idmap;
pub mod net;
