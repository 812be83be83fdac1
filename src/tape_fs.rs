//! POSIX-style verbs over the file coordinator.
//!
//! Every call returns either its result or an errno code, ready for a
//! filesystem protocol adapter to hand back to the kernel.

use crate::catalog::MetadataStore;
use crate::error::TlfsError;
use crate::filesystem::FileSystemManager;
use crate::model::{Entry, NewEntry};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error};

/// Inode numbers are entry ids shifted so the root gets the conventional 1.
pub const ROOT_INODE: u64 = 1;

const NAME_MAX: u32 = 255;
const STATFS_BLOCK_SIZE: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub kind: FileKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: FileKind,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub bsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namelen: u32,
}

/// A timestamp argument to `utimens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    Now,
    Omit,
    At(DateTime<Utc>),
}

impl TimeSpec {
    fn resolve(self) -> Option<DateTime<Utc>> {
        match self {
            Self::Now => Some(Utc::now()),
            Self::Omit => None,
            Self::At(at) => Some(at),
        }
    }
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub struct TapeFs {
    fs: Arc<FileSystemManager>,
}

impl TapeFs {
    pub fn new(fs: Arc<FileSystemManager>) -> Self {
        Self { fs }
    }

    fn store(&self) -> &Arc<dyn MetadataStore> {
        self.fs.store()
    }

    /// Logs a failed call and converts it to its errno.
    fn errno(&self, op: &str, target: &str, err: TlfsError) -> i32 {
        let code = err.errno();
        if code == libc::EIO {
            error!("{} {} failed: {}", op, target, err);
        } else {
            debug!("{} {}: {}", op, target, err);
        }
        code
    }

    fn lookup(&self, path: &str) -> Result<Entry, TlfsError> {
        self.fs
            .get_entry(path)?
            .ok_or_else(|| TlfsError::not_found(path))
    }

    fn attr(&self, entry: &Entry) -> FileAttr {
        let block_size = self.fs.library().block_size() as u64;
        FileAttr {
            ino: entry.id + ROOT_INODE,
            size: entry.size,
            blocks: entry.size.div_ceil(512),
            atime: entry.accessed,
            mtime: entry.modified,
            kind: if entry.is_directory {
                FileKind::Directory
            } else {
                FileKind::File
            },
            perm: (entry.mode & 0o7777) as u16,
            nlink: if entry.is_directory { 2 } else { 1 },
            uid: entry.uid,
            gid: entry.gid,
            blksize: block_size.min(u32::MAX as u64) as u32,
        }
    }

    /// Validates the new name and returns the id of its parent directory.
    fn parent_for(&self, path: &str) -> Result<u64, TlfsError> {
        if !path.starts_with('/') || path == "/" {
            return Err(TlfsError::InvalidArgument(path.to_string()));
        }
        if file_name(path).len() > NAME_MAX as usize {
            return Err(TlfsError::InvalidArgument(format!("name too long: {}", path)));
        }
        let parent = self.lookup(parent_path(path))?;
        if !parent.is_directory {
            return Err(TlfsError::NotDirectory(parent.path));
        }
        Ok(parent.id)
    }

    fn new_entry(&self, path: &str, mode: u32, uid: u32, gid: u32, dir: bool) -> Result<Entry, TlfsError> {
        let parent_id = self.parent_for(path)?;
        self.store().create_entry(NewEntry {
            path: path.to_string(),
            mode,
            is_directory: dir,
            uid,
            gid,
            parent_id,
        })
    }

    pub fn getattr(&self, path: &str) -> Result<FileAttr, i32> {
        self.lookup(path)
            .map(|entry| self.attr(&entry))
            .map_err(|e| self.errno("getattr", path, e))
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, i32> {
        let run = || -> Result<Vec<DirEntry>, TlfsError> {
            let dir = self.lookup(path)?;
            if !dir.is_directory {
                return Err(TlfsError::NotDirectory(path.to_string()));
            }
            let parent_ino = match path {
                "/" => ROOT_INODE,
                _ => self.lookup(parent_path(path))?.id + ROOT_INODE,
            };
            let mut entries = vec![
                DirEntry {
                    ino: dir.id + ROOT_INODE,
                    kind: FileKind::Directory,
                    name: ".".to_string(),
                },
                DirEntry {
                    ino: parent_ino,
                    kind: FileKind::Directory,
                    name: "..".to_string(),
                },
            ];
            for child in self.store().list_children(dir.id)? {
                entries.push(DirEntry {
                    ino: child.id + ROOT_INODE,
                    kind: self.attr(&child).kind,
                    name: file_name(&child.path).to_string(),
                });
            }
            Ok(entries)
        };
        run().map_err(|e| self.errno("readdir", path, e))
    }

    /// Creates an empty file and opens it for writing.
    pub fn create(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<u64, i32> {
        self.new_entry(path, mode, uid, gid, false)
            .and_then(|_| self.fs.open(path, false))
            .map_err(|e| self.errno("create", path, e))
    }

    pub fn mkdir(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<FileAttr, i32> {
        self.new_entry(path, mode, uid, gid, true)
            .map(|entry| self.attr(&entry))
            .map_err(|e| self.errno("mkdir", path, e))
    }

    pub fn open(&self, path: &str, flags: i32) -> Result<u64, i32> {
        if flags & libc::O_TRUNC != 0 {
            return Err(self.errno(
                "open",
                path,
                TlfsError::ReadOnly(format!("truncating {}", path)),
            ));
        }
        self.fs
            .open(path, false)
            .map_err(|e| self.errno("open", path, e))
    }

    pub fn release(&self, fh: u64) -> Result<(), i32> {
        self.fs
            .release(fh)
            .map_err(|e| self.errno("release", &format!("handle {}", fh), e))
    }

    pub fn read(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        let target = format!("handle {} at {}", fh, offset);
        let offset = u64::try_from(offset)
            .map_err(|_| self.errno("read", &target, TlfsError::InvalidArgument(target.clone())))?;
        let mut buf = vec![0u8; size as usize];
        let n = self
            .fs
            .read(fh, offset, &mut buf)
            .map_err(|e| self.errno("read", &target, e))?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write(&self, fh: u64, offset: i64, data: &[u8]) -> Result<usize, i32> {
        let target = format!("handle {} at {}", fh, offset);
        let offset = u64::try_from(offset)
            .map_err(|_| self.errno("write", &target, TlfsError::InvalidArgument(target.clone())))?;
        self.fs
            .write(fh, offset, data)
            .map_err(|e| self.errno("write", &target, e))
    }

    /// Renames `from` to `to`, replacing an existing file at `to`.
    pub fn rename(&self, from: &str, to: &str, flags: u32) -> Result<(), i32> {
        let run = || -> Result<(), TlfsError> {
            if flags != 0 {
                return Err(TlfsError::InvalidArgument(format!("rename flags {:#x}", flags)));
            }
            let source = self.lookup(from)?;
            if source.id == crate::model::ROOT_ENTRY_ID {
                return Err(TlfsError::InvalidArgument(from.to_string()));
            }
            if from == to {
                return Ok(());
            }
            if source.is_directory && to.starts_with(&format!("{}/", from)) {
                return Err(TlfsError::InvalidArgument(format!(
                    "cannot move {} into itself",
                    from
                )));
            }
            if let Some(target) = self.fs.get_entry(to)? {
                if target.id == source.id {
                    return Ok(());
                }
                if target.is_directory {
                    return Err(TlfsError::IsDirectory(to.to_string()));
                }
                self.fs.delete(to)?;
            }
            let parent_id = self.parent_for(to)?;
            self.store().rename_entry(source.id, to, parent_id)
        };
        run().map_err(|e| self.errno("rename", &format!("{} -> {}", from, to), e))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<(), i32> {
        self.lookup(path)
            .and_then(|entry| self.store().set_mode(entry.id, mode))
            .map_err(|e| self.errno("chmod", path, e))
    }

    /// `None` leaves the corresponding id unchanged.
    pub fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<(), i32> {
        self.lookup(path)
            .and_then(|entry| {
                self.store().set_owner(
                    entry.id,
                    uid.unwrap_or(entry.uid),
                    gid.unwrap_or(entry.gid),
                )
            })
            .map_err(|e| self.errno("chown", path, e))
    }

    pub fn utimens(&self, path: &str, atime: TimeSpec, mtime: TimeSpec) -> Result<(), i32> {
        self.lookup(path)
            .and_then(|entry| {
                self.store()
                    .set_times(entry.id, atime.resolve(), mtime.resolve())
            })
            .map_err(|e| self.errno("utimens", path, e))
    }

    pub fn unlink(&self, path: &str) -> Result<(), i32> {
        self.fs
            .delete(path)
            .map_err(|e| self.errno("unlink", path, e))
    }

    pub fn rmdir(&self, path: &str) -> Result<(), i32> {
        let run = || -> Result<(), TlfsError> {
            let dir = self.lookup(path)?;
            if !dir.is_directory {
                return Err(TlfsError::NotDirectory(path.to_string()));
            }
            if dir.id == crate::model::ROOT_ENTRY_ID {
                return Err(TlfsError::InvalidArgument(path.to_string()));
            }
            if !self.store().list_children(dir.id)?.is_empty() {
                return Err(TlfsError::NotEmpty(path.to_string()));
            }
            self.store().purge_entry(dir.id)
        };
        run().map_err(|e| self.errno("rmdir", path, e))
    }

    /// Capacity in 1 KiB blocks: free counts every byte not on tape, available
    /// counts every byte not held by a live file.
    pub fn statfs(&self) -> Result<StatFs, i32> {
        let run = || -> Result<StatFs, TlfsError> {
            let store = self.store();
            let total = store.total_capacity()?;
            let consumed = store.consumed_space()?;
            let useful = store.useful_space()?;
            let files = i64::MAX as u64;
            Ok(StatFs {
                bsize: STATFS_BLOCK_SIZE,
                blocks: total / STATFS_BLOCK_SIZE,
                bfree: total.saturating_sub(consumed) / STATFS_BLOCK_SIZE,
                bavail: total.saturating_sub(useful) / STATFS_BLOCK_SIZE,
                files,
                ffree: files - store.max_entry_id()?,
                namelen: NAME_MAX,
            })
        };
        run().map_err(|e| self.errno("statfs", "/", e))
    }
}
