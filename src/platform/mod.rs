use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Ask the process identified by `pid` to shut down gracefully
    /// (SIGTERM on Unix, `taskkill` without `/F` on Windows).
    fn terminate_process(pid: u32) -> std::io::Result<()>;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Default `PATH` value handed to execution processes.
    fn sandboxed_path() -> String;

    /// Root data directory for conductor.
    /// Unix: `~/.conductor`, Windows: `%APPDATA%\conductor`.
    fn data_dir() -> PathBuf;
}

/// `CONDUCTOR_DATA_DIR` wins over the platform default.
pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var("CONDUCTOR_DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
