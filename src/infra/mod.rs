//! Usage: Filesystem-facing helpers (paths, settings, atomic writes).

pub mod app_paths;
pub(crate) mod atomic_file;
pub mod settings;
