//! Exchanging event and data files with peers through a shared location.

mod file_system;
mod local;
mod manager;
mod memory;

pub use file_system::{join_remote, CloudFileSystem, CloudItem};
pub use local::LocalCloudFileSystem;
pub use manager::CloudManager;
pub use memory::MemoryCloudFileSystem;
