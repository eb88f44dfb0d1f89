//! Shared helpers for the integration suite.
#![allow(dead_code)]

use sluice::{cmd, Expression};

/// A shell one-liner, for the places where a plain argv gets awkward.
pub fn sh(script: &str) -> Expression {
    cmd("sh", ["-c", script])
}

/// A command that exits with the given code and does nothing else.
pub fn exit_with(code: i32) -> Expression {
    sh(&format!("exit {}", code))
}

#[cfg(unix)]
pub fn make_executable(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}
