//! Local filesystem backends for sitesync.
//!
//! - `folder` source: a directory used in place as the single workspace `source`
//! - `mirror` source: working copies of an upstream directory, one per branch
//! - `folder` publisher: staged, manifest-checked deployment into a directory

pub mod backends;
pub mod config;
pub mod folder;
pub mod mirror;
pub mod provider;
pub mod publisher;
pub mod tree;

pub use backends::{builtin_registries, register_builtins};
pub use folder::FolderSource;
pub use mirror::MirrorSource;
pub use provider::JsonFileConfigProvider;
pub use publisher::FolderPublisher;
