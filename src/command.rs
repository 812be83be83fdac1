//! External device-control program execution (`mt`, `mtx`, `lsscsi`).

use crate::error::{Result, TlfsError};
use serde::{Deserialize, Serialize};
use std::process::Command;
use tracing::debug;

/// Runs a control program and returns its captured stdout.
///
/// A non-zero exit is reported as [`TlfsError::Process`] carrying the
/// program's stderr and exit code.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<String>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("Executing: {} {}", program, args.join(" "));

        let output = Command::new(program).args(args).output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TlfsError::Process {
                program: program.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Paths of the control programs, taken from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub mt: String,
    pub mtx: String,
    pub lsscsi: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            mt: "/usr/bin/mt".to_string(),
            mtx: "/usr/sbin/mtx".to_string(),
            lsscsi: "/usr/bin/lsscsi".to_string(),
        }
    }
}
