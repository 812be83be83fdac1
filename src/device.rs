//! Raw block streams on tape device nodes.

use crate::error::TlfsError;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};

/// Opens sequential byte streams on a device node.
///
/// On a non-rewinding tape node, dropping a write stream writes a filemark
/// and a read positioned on a filemark returns zero bytes once and moves past it.
pub trait DeviceIo: Send + Sync {
    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;
    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + Send>>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemDeviceIo;

impl SystemDeviceIo {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceIo for SystemDeviceIo {
    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new().write(true).open(path)?;
        Ok(Box::new(file))
    }
}

/// Converts a device write failure into a structured error.
///
/// `ENOSPC` from a tape node means the drive hit early warning / end of medium.
pub fn classify_write_error(device: &str, err: io::Error) -> TlfsError {
    if err.raw_os_error() == Some(libc::ENOSPC) {
        TlfsError::EndOfVolume {
            device: device.to_string(),
        }
    } else {
        TlfsError::Io(err)
    }
}
