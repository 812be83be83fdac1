//! Caller-side entry points: wait for a drive, then position it on tape.

use super::request::RequestKind;
use super::LibraryManager;
use crate::drive::{Drive, MarkerCheck};
use crate::error::{Result, TlfsError};
use crate::model::{FilePart, MarkerKind, Tape};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 连续非 EOV 写错误的最大重试次数
pub const MAX_WRITE_RETRIES: u32 = 3;

impl LibraryManager {
    pub fn load_for_new_write(&self, entry_id: u64) -> Result<(Arc<Drive>, FilePart)> {
        let drive = self.submit_and_wait(RequestKind::NewWrite, None, None)?;
        match self.open_part_for_write(entry_id, 0, drive.clone()) {
            Ok(loaded) => Ok(loaded),
            Err(e) => {
                self.release_drive(&drive);
                Err(e)
            }
        }
    }

    /// 更换为可写磁带并在其上打开分段 `part_number`
    pub fn load_to_continue_write(
        &self,
        entry_id: u64,
        part_number: u32,
        drive: &Arc<Drive>,
    ) -> Result<FilePart> {
        let drive = self.submit_and_wait(RequestKind::ContinueWrite, None, Some(drive.clone()))?;
        let (_, part) = self.open_part_for_write(entry_id, part_number, drive)?;
        Ok(part)
    }

    /// 定位到已加载磁带最后一个分段之后，记录新分段并写入起始标记；
    /// 写错误时换到另一盘磁带
    fn open_part_for_write(
        &self,
        entry_id: u64,
        part_number: u32,
        mut drive: Arc<Drive>,
    ) -> Result<(Arc<Drive>, FilePart)> {
        let mut faults = 0;
        loop {
            let tape = self.tape_in_drive(&drive)?;
            self.store.clear_deleted_parts_from_end_of_tape(tape.id)?;

            let index = match self.store.last_part_on_tape(tape.id)? {
                Some(last) => {
                    match drive.verify_marker(MarkerKind::End, last.id, last.end_marker_index()) {
                        Ok(MarkerCheck::Match) => {}
                        Ok(check) => warn!(
                            "End marker of part #{} on tape {} not confirmed ({:?}), appending anyway",
                            last.id, tape.barcode, check
                        ),
                        Err(e) => warn!(
                            "Could not verify end marker of part #{} on tape {}: {}",
                            last.id, tape.barcode, e
                        ),
                    }
                    last.next_part_index()
                }
                None => {
                    drive.rewind()?;
                    0
                }
            };

            let part = self.store.create_file_part(
                tape.id,
                entry_id,
                part_number,
                self.block_size as u32,
                index,
            )?;
            let written = drive
                .seek_to_block_index(index)
                .and_then(|_| drive.write_marker(MarkerKind::Start, part.id));

            match written {
                Ok(()) => {
                    info!(
                        "Opened part {} of entry #{} on tape {} at file {}",
                        part_number, entry_id, tape.barcode, index
                    );
                    return Ok((drive, part));
                }
                Err(e) if e.is_write_fault() => {
                    self.store.delete_file_part(part.id)?;
                    self.record_write_failure(&drive, &e)?;
                    if !e.is_end_of_volume() {
                        faults += 1;
                        if faults >= MAX_WRITE_RETRIES {
                            return Err(e);
                        }
                    }
                    warn!(
                        "Start marker write failed on tape {} ({}), moving to another tape",
                        tape.barcode, e
                    );
                    drive =
                        self.submit_and_wait(RequestKind::ContinueWrite, None, Some(drive.clone()))?;
                }
                Err(e) => {
                    self.store.delete_file_part(part.id)?;
                    return Err(e);
                }
            }
        }
    }

    /// 加载第一个分段所在的磁带并定位到数据
    pub fn load_for_new_read(&self, parts: &[FilePart]) -> Result<Arc<Drive>> {
        let first = parts
            .first()
            .ok_or_else(|| TlfsError::catalog("file has no parts to read"))?;
        let drive = self.submit_and_wait(RequestKind::NewRead, Some(first.tape_id), None)?;
        if let Err(e) = self.position_for_read(&drive, first) {
            self.release_drive(&drive);
            return Err(e);
        }
        Ok(drive)
    }

    pub fn load_to_continue_read(&self, part: &FilePart, drive: &Arc<Drive>) -> Result<()> {
        let drive =
            self.submit_and_wait(RequestKind::ContinueRead, Some(part.tape_id), Some(drive.clone()))?;
        self.position_for_read(&drive, part)
    }

    /// 读取时起始标记不匹配直接报错
    fn position_for_read(&self, drive: &Drive, part: &FilePart) -> Result<()> {
        let check = drive.verify_marker(MarkerKind::Start, part.id, part.tape_index)?;
        if !check.is_match() {
            return Err(TlfsError::position(format!(
                "start marker of part #{} at file {} on {}: {:?}",
                part.id,
                part.tape_index,
                drive.describe(),
                check
            )));
        }
        drive.seek_to_block_index(part.data_index())?;
        debug!("Positioned {} on data of part #{}", drive.describe(), part.id);
        Ok(())
    }

    /// EOV 标记磁带已满，其他错误计入写错误次数
    pub fn record_write_failure(&self, drive: &Drive, error: &TlfsError) -> Result<()> {
        let tape = self.tape_in_drive(drive)?;
        if error.is_end_of_volume() {
            info!("Tape {} is full", tape.barcode);
            self.store.mark_tape_full(tape.id)
        } else {
            warn!("Write error on tape {}: {}", tape.barcode, error);
            self.store.increment_write_errors(tape.id)
        }
    }

    pub fn tape_in_drive(&self, drive: &Drive) -> Result<Tape> {
        let barcode = drive
            .barcode()
            .ok_or_else(|| TlfsError::drive_load(format!("{} holds no tape", drive.device_path())))?;
        self.store
            .get_tape_by_barcode(&barcode)?
            .ok_or(TlfsError::TapeNotFound(barcode))
    }
}
