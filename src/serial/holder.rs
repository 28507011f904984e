//! Best-effort diagnostics identifying which process holds a serial device.
//!
//! Grounded on `flashtool.py::validate_device`/`_lookup_proc_name`: walk
//! `/proc/*/fd`, compare `(dev, inode)` against the target device, and for
//! a match try `systemctl status <pid>` first, then `/proc/<pid>/cmdline`,
//! then `/proc/<pid>/exe`. This never blocks flashing on its own failure;
//! any error here degrades to "Name Unknown".

use crate::error::KatapultError;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// If another process already holds `device` open, return a description of
/// that process. `Ok(None)` means the device is free.
pub async fn find_holder(device: &Path) -> Result<Option<String>, KatapultError> {
    let meta = fs::metadata(device)
        .map_err(|e| KatapultError::transport_io(device.to_string_lossy(), e))?;
    let target = (meta.dev(), meta.ino());

    let Ok(proc_entries) = fs::read_dir("/proc") else {
        return Ok(None);
    };
    for proc_entry in proc_entries.flatten() {
        let pid = proc_entry.file_name();
        let pid_str = pid.to_string_lossy();
        if !pid_str.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let fd_dir = proc_entry.path().join("fd");
        let Ok(fds) = fs::read_dir(&fd_dir) else {
            continue;
        };
        for fd_entry in fds.flatten() {
            let Ok(fd_meta) = fs::metadata(fd_entry.path()) else {
                continue;
            };
            if (fd_meta.dev(), fd_meta.ino()) == target {
                return Ok(Some(describe_process(&pid_str).await));
            }
        }
    }
    Ok(None)
}

async fn describe_process(pid: &str) -> String {
    if let Some(unit) = systemd_unit_name(pid).await {
        return format!("Systemd Unit Name: {unit}");
    }
    let cmdline_path = format!("/proc/{pid}/cmdline");
    if let Ok(raw) = fs::read_to_string(&cmdline_path) {
        let cmdline = raw.replace('\0', " ").trim().to_string();
        if !cmdline.is_empty() {
            return format!("Command Line: {cmdline}");
        }
    }
    let exe_path = format!("/proc/{pid}/exe");
    if let Ok(target) = fs::read_link(&exe_path) {
        return format!("Executable: {}", target.display());
    }
    "Name Unknown".to_string()
}

fn on_path(program: &str) -> bool {
    let Ok(path_var) = std::env::var("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(program).is_file())
}

async fn systemd_unit_name(pid: &str) -> Option<String> {
    if !on_path("systemctl") {
        return None;
    }
    let output = tokio::process::Command::new("systemctl")
        .args(["status", pid])
        .output()
        .await
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first_line = stdout.lines().next()?.trim();
    let fields: Vec<&str> = first_line.splitn(3, char::is_whitespace).collect();
    if fields.len() == 3 {
        Some(fields[1].to_string())
    } else {
        None
    }
}
