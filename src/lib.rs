//! tlfs library
//!
//! Core of a filesystem backed by a robotic tape library: changer and drive
//! control, drive scheduling, and file streams that span tape volumes.

pub mod catalog;
pub mod cli;
pub mod command;
pub mod config;
pub mod device;
pub mod drive;
pub mod error;
pub mod filesystem;
pub mod logger;
pub mod model;
pub mod open_file;
pub mod robot;
pub mod scheduler;
pub mod tape_fs;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;


// Re-export key types for easier use
pub use catalog::{Catalog, MetadataStore};
pub use error::{Result, TlfsError};
pub use filesystem::FileSystemManager;
pub use scheduler::LibraryManager;
pub use tape_fs::TapeFs;
