use thiserror::Error;

pub type Result<T> = std::result::Result<T, TlfsError>;

#[derive(Error, Debug)]
pub enum TlfsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("End of volume reached on {device}")]
    EndOfVolume { device: String },

    #[error("Process error: {program} exited with code {code}: {stderr}")]
    Process {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Tape not found: {0}")]
    TapeNotFound(String),

    #[error("Position error: {0}")]
    Position(String),

    #[error("Drive load error: {0}")]
    DriveLoad(String),

    #[error("Out of order write: expected offset {expected}, got {actual}")]
    OutOfOrderWrite { expected: u64, actual: u64 },

    #[error("Out of order read: cursor is at {cursor}, requested {requested}")]
    OutOfOrderRead { cursor: u64, requested: u64 },

    #[error("No such entry: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Read-only operation: {0}")]
    ReadOnly(String),

    #[error("Unknown file handle: {0}")]
    BadHandle(u64),

    #[error("Metadata store error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tape library is unmounted")]
    Unmounted,

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl TlfsError {
    pub fn parse<T: Into<String>>(msg: T) -> Self {
        Self::Parse(msg.into())
    }

    pub fn position<T: Into<String>>(msg: T) -> Self {
        Self::Position(msg.into())
    }

    pub fn drive_load<T: Into<String>>(msg: T) -> Self {
        Self::DriveLoad(msg.into())
    }

    pub fn catalog<T: Into<String>>(msg: T) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found<T: Into<String>>(path: T) -> Self {
        Self::NotFound(path.into())
    }

    /// Failures the write path recovers from by continuing on another volume.
    pub fn is_write_fault(&self) -> bool {
        matches!(self, Self::EndOfVolume { .. } | Self::Io(_))
    }

    pub fn is_end_of_volume(&self) -> bool {
        matches!(self, Self::EndOfVolume { .. })
    }

    /// POSIX error code reported to the filesystem caller.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) | Self::TapeNotFound(_) => libc::ENOENT,
            Self::IsDirectory(_) => libc::EISDIR,
            Self::NotDirectory(_) => libc::ENOTDIR,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::NotEmpty(_) => libc::ENOTEMPTY,
            Self::InvalidArgument(_)
            | Self::OutOfOrderWrite { .. }
            | Self::OutOfOrderRead { .. } => libc::EINVAL,
            Self::ReadOnly(_) => libc::EROFS,
            Self::BadHandle(_) => libc::EBADF,
            _ => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TlfsError::parse("bad slot line");
        assert!(matches!(err, TlfsError::Parse(_)));

        let err = TlfsError::position("file number 3, expected 4");
        assert!(matches!(err, TlfsError::Position(_)));
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(TlfsError::not_found("/a").errno(), libc::ENOENT);
        assert_eq!(TlfsError::IsDirectory("/d".into()).errno(), libc::EISDIR);
        assert_eq!(TlfsError::NotEmpty("/d".into()).errno(), libc::ENOTEMPTY);
        assert_eq!(
            TlfsError::OutOfOrderWrite {
                expected: 50,
                actual: 100
            }
            .errno(),
            libc::EINVAL
        );
        assert_eq!(TlfsError::ReadOnly("O_TRUNC".into()).errno(), libc::EROFS);
        assert_eq!(TlfsError::drive_load("no drive").errno(), libc::EIO);
    }

    #[test]
    fn test_write_fault_classification() {
        let eov = TlfsError::EndOfVolume {
            device: "/dev/nst0".into(),
        };
        assert!(eov.is_write_fault());
        assert!(eov.is_end_of_volume());

        let io = TlfsError::Io(std::io::Error::from_raw_os_error(libc::EIO));
        assert!(io.is_write_fault());
        assert!(!io.is_end_of_volume());

        assert!(!TlfsError::position("mismatch").is_write_fault());
    }
}
