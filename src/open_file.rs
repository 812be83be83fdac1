//! Streaming state for one open file: block buffering on write, block
//! prefetch on read, and the part map used to span volumes.

use crate::device::classify_write_error;
use crate::drive::Drive;
use crate::error::{Result, TlfsError};
use crate::model::{Entry, FilePart, MarkerKind};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

pub struct OpenFile {
    entry: Entry,
    mode: OpenMode,
    drive: Arc<Drive>,
    block_size: usize,
    parts: BTreeMap<u32, FilePart>,
    current_part: u32,
    /// 写入时为已接收的字节数，读取时为记录的文件大小
    size: u64,
    read_offset: u64,
    buffer: Vec<u8>,
    valid: usize,
    position: usize,
    writer: Option<Box<dyn Write + Send>>,
    reader: Option<Box<dyn Read + Send>>,
    blocks_in_part: u64,
    volume_exhausted: bool,
    closed: bool,
}

impl OpenFile {
    /// 写会话 - 该分段的起始标记已经写到磁带上
    pub fn for_write(entry: Entry, drive: Arc<Drive>, part: FilePart) -> Self {
        let block_size = drive.block_size();
        let current_part = part.part_number;
        Self {
            entry,
            mode: OpenMode::Write,
            drive,
            block_size,
            parts: BTreeMap::from([(current_part, part)]),
            current_part,
            size: 0,
            read_offset: 0,
            buffer: vec![0u8; block_size],
            valid: 0,
            position: 0,
            writer: None,
            reader: None,
            blocks_in_part: 0,
            volume_exhausted: false,
            closed: false,
        }
    }

    /// 读会话 - 驱动器必须已定位到第一个分段的数据
    pub fn for_read(entry: Entry, drive: Arc<Drive>, parts: Vec<FilePart>) -> Result<Self> {
        let block_size = drive.block_size();
        let parts: BTreeMap<u32, FilePart> =
            parts.into_iter().map(|p| (p.part_number, p)).collect();
        let current_part = *parts
            .keys()
            .next()
            .ok_or_else(|| TlfsError::catalog(format!("{} has no file parts", entry.path)))?;
        let size = entry.size;
        Ok(Self {
            entry,
            mode: OpenMode::Read,
            drive,
            block_size,
            parts,
            current_part,
            size,
            read_offset: 0,
            buffer: vec![0u8; block_size],
            valid: 0,
            position: 0,
            writer: None,
            reader: None,
            blocks_in_part: 0,
            volume_exhausted: false,
            closed: false,
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn drive(&self) -> &Arc<Drive> {
        &self.drive
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    pub fn current_part(&self) -> Option<&FilePart> {
        self.parts.get(&self.current_part)
    }

    pub fn blocks_in_part(&self) -> u64 {
        self.blocks_in_part
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn buffer_full(&self) -> bool {
        self.valid == self.block_size
    }

    /// Copies as much of `data` as fits in the block buffer and returns the
    /// count taken. The caller flushes and resubmits the rest.
    pub fn prepare_write(&mut self, data: &[u8]) -> usize {
        let n = (self.block_size - self.valid).min(data.len());
        self.buffer[self.valid..self.valid + n].copy_from_slice(&data[..n]);
        self.valid += n;
        self.size += n as u64;
        n
    }

    /// Writes the buffered block, zero-padded to the block size.
    ///
    /// 设备错误原样返回，缓冲区保留，以便在另一盘磁带上重写该块
    pub fn flush(&mut self) -> Result<()> {
        if self.valid == 0 {
            return Ok(());
        }
        let path = self.drive.device_path().to_string();
        if self.writer.is_none() {
            let writer = self
                .drive
                .devices()
                .open_write(&path)
                .map_err(|e| classify_write_error(&path, e))?;
            self.writer = Some(writer);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writer
            .write_all(&self.buffer)
            .and_then(|_| writer.flush())
            .map_err(|e| classify_write_error(&path, e))?;

        trace!("Flushed {} bytes to {}", self.valid, path);
        self.buffer.fill(0);
        self.valid = 0;
        self.blocks_in_part += 1;
        Ok(())
    }

    /// Ends the current data file on tape. Dropping the stream writes the filemark.
    pub fn close_tape_stream(&mut self) {
        if self.writer.take().is_some() {
            debug!(
                "Closed data stream of {} after {} blocks",
                self.entry.path, self.blocks_in_part
            );
        }
    }

    pub fn write_end_marker(&self) -> Result<()> {
        let part = self
            .current_part()
            .ok_or_else(|| TlfsError::catalog(format!("{} has no current part", self.entry.path)))?;
        self.drive.write_marker(MarkerKind::End, part.id)
    }

    /// Continues writing into a freshly opened part on another volume.
    pub fn begin_part(&mut self, part: FilePart) {
        self.current_part = part.part_number;
        self.parts.insert(part.part_number, part);
        self.blocks_in_part = 0;
        self.writer = None;
    }

    /// 丢弃没有写入数据的分段，分段号可以复用
    pub fn forget_part(&mut self, number: u32) {
        self.parts.remove(&number);
    }

    /// 预读第一个块，磁带不可读时在打开阶段就失败
    pub fn prefetch(&mut self) -> Result<()> {
        if self.size > 0 && self.valid == 0 && !self.fetch_block()? {
            self.volume_exhausted = true;
        }
        Ok(())
    }

    fn fetch_block(&mut self) -> Result<bool> {
        if self.reader.is_none() {
            self.reader = Some(self.drive.devices().open_read(self.drive.device_path())?);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(false);
        };
        let n = reader.read(&mut self.buffer)?;
        self.valid = n;
        self.position = 0;
        Ok(n > 0)
    }

    /// Fills `buf` from the read cursor, stopping at end of file or when the
    /// current volume has no more data for this file.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() && self.read_offset < self.size {
            if self.position == self.valid && !self.fetch_block()? {
                self.volume_exhausted = true;
                break;
            }
            let left_in_file = usize::try_from(self.size - self.read_offset).unwrap_or(usize::MAX);
            let n = (self.valid - self.position)
                .min(buf.len() - filled)
                .min(left_in_file);
            buf[filled..filled + n].copy_from_slice(&self.buffer[self.position..self.position + n]);
            self.position += n;
            self.read_offset += n as u64;
            filled += n;
        }
        Ok(filled)
    }

    pub fn volume_exhausted(&self) -> bool {
        self.volume_exhausted
    }

    pub fn next_part(&self) -> Option<FilePart> {
        self.parts
            .range(self.current_part + 1..)
            .next()
            .map(|(_, part)| part.clone())
    }

    /// Resumes on the next part; the drive has already been positioned on its data.
    pub fn continue_read(&mut self, part: &FilePart) {
        self.reader = None;
        self.current_part = part.part_number;
        self.valid = 0;
        self.position = 0;
        self.volume_exhausted = false;
        debug!(
            "Continuing {} on part {} (tape #{})",
            self.entry.path, part.part_number, part.tape_id
        );
    }

    pub fn close_read(&mut self) {
        self.reader = None;
    }
}
