use std::path::{Path, PathBuf};

use super::{Platform, resolve_data_dir};

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn terminate_process(pid: u32) -> std::io::Result<()> {
        let status = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!(
                "taskkill /PID {} exited with {}",
                pid, status
            )))
        }
    }

    fn restrict_dir_permissions(_path: &Path) {}

    fn restrict_file_permissions(_path: &Path) {}

    fn sandboxed_path() -> String {
        r"C:\Windows\System32;C:\Windows".to_string()
    }

    fn data_dir() -> PathBuf {
        resolve_data_dir(
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("conductor"),
        )
    }
}
