//! Cross-platform utilities
//!
//! - [`fs`] - Atomic writes, tree copies and sibling staging paths
//! - [`progress`] - Progress bars for download and install feedback

pub mod fs;
pub mod progress;

pub use fs::{atomic_write, copy_dir, ensure_dir, list_files};
pub use progress::ProgressBar;
