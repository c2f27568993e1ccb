//! Async file-system helpers.
//!
//! The disk tiers (staging and persistent stores) only ever touch the file
//! system through these re-exports.

pub use tokio::fs::{
    copy, create_dir_all, metadata, read, read_dir, remove_dir_all, remove_file, rename, write,
    DirEntry, File, OpenOptions, ReadDir,
};
