//! 单个顺序磁带设备 - 通过 `mt` 命令和原始块 I/O 控制

use crate::command::CommandRunner;
use crate::device::{classify_write_error, DeviceIo};
use crate::error::{Result, TlfsError};
use crate::model::{decode_marker, encode_marker, MarkerKind, TapePosition};
use parking_lot::Mutex;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct DriveState {
    /// 映射完成后该设备所在的机械手驱动器槽位
    pub slot: Option<u32>,
    pub barcode: Option<String>,
    pub busy: bool,
    pub has_tape: bool,
}

/// 标记块回读结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerCheck {
    Match,
    Mismatch {
        kind: Option<MarkerKind>,
        part_id: u64,
    },
    /// 该位置没有读到数据（或不足一个标记头）
    Missing,
    /// 标记文件中不止一个块
    TrailingData(usize),
}

impl MarkerCheck {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }
}

/// 解析 `mt status` 中的 `File number=F, block number=B, partition=P.` 行
pub fn parse_position(status: &str) -> Result<TapePosition> {
    for line in status.lines() {
        let line = line.trim();
        if !line.starts_with("File number=") {
            continue;
        }
        let mut position = TapePosition::default();
        let mut fields = 0;
        for field in line.trim_end_matches('.').split(',') {
            let Some((key, value)) = field.trim().split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key {
                "File number" => {
                    position.file_number = value.parse().map_err(|_| {
                        TlfsError::position(format!("bad file number in '{}'", line))
                    })?;
                    fields += 1;
                }
                "block number" => {
                    position.block_number = value.parse().map_err(|_| {
                        TlfsError::position(format!("bad block number in '{}'", line))
                    })?;
                    fields += 1;
                }
                "partition" => {
                    position.partition = value.parse().map_err(|_| {
                        TlfsError::position(format!("bad partition in '{}'", line))
                    })?;
                    fields += 1;
                }
                _ => {}
            }
        }
        if fields == 3 {
            return Ok(position);
        }
    }
    Err(TlfsError::position("no position line in device status"))
}

pub struct Drive {
    device_path: String,
    generic_path: Option<String>,
    mt: String,
    block_size: usize,
    runner: Arc<dyn CommandRunner>,
    devices: Arc<dyn DeviceIo>,
    state: Mutex<DriveState>,
}

impl fmt::Debug for Drive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drive")
            .field("device_path", &self.device_path)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Drive {
    /// 未映射的驱动器初始为忙碌状态，映射完成前调度器不会使用
    pub fn new(
        device_path: &str,
        generic_path: Option<String>,
        mt: &str,
        block_size: usize,
        runner: Arc<dyn CommandRunner>,
        devices: Arc<dyn DeviceIo>,
    ) -> Self {
        Self {
            device_path: device_path.to_string(),
            generic_path,
            mt: mt.to_string(),
            block_size,
            runner,
            devices,
            state: Mutex::new(DriveState {
                busy: true,
                ..DriveState::default()
            }),
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn generic_path(&self) -> Option<&str> {
        self.generic_path.as_deref()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn state(&self) -> DriveState {
        self.state.lock().clone()
    }

    pub fn slot(&self) -> Option<u32> {
        self.state.lock().slot
    }

    pub fn set_slot(&self, slot: Option<u32>) {
        self.state.lock().slot = slot;
    }

    pub fn barcode(&self) -> Option<String> {
        self.state.lock().barcode.clone()
    }

    /// 记录当前驱动器中的磁带并重新读取设备状态
    pub fn set_barcode(&self, barcode: Option<String>) -> Result<()> {
        self.state.lock().barcode = barcode;
        self.refresh_status()?;
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    pub fn set_busy(&self, busy: bool) {
        self.state.lock().busy = busy;
    }

    /// 已映射且没有被任何打开的文件占用
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        !state.busy && state.slot.is_some()
    }

    pub fn has_tape(&self) -> bool {
        self.state.lock().has_tape
    }

    fn mt(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["-f", self.device_path.as_str()];
        full.extend_from_slice(args);
        self.runner.run(&self.mt, &full)
    }

    /// 查询设备状态，状态中包含 ONLINE 即表示有磁带
    pub fn refresh_status(&self) -> Result<bool> {
        let online = match self.mt(&["status"]) {
            Ok(output) => output.split_whitespace().any(|t| t == "ONLINE"),
            Err(TlfsError::Process { stderr, .. }) => {
                debug!("{} status failed, treating as offline: {}", self.device_path, stderr);
                false
            }
            Err(e) => return Err(e),
        };
        self.state.lock().has_tape = online;
        Ok(online)
    }

    pub fn rewind(&self) -> Result<()> {
        if self.refresh_status()? {
            debug!("Rewinding {}", self.device_path);
            self.mt(&["rewind"])?;
        }
        Ok(())
    }

    pub fn read_current_position(&self) -> Result<TapePosition> {
        let output = self.mt(&["status"])?;
        parse_position(&output)
    }

    /// 定位到磁带文件 `index` 的第一个块
    pub fn seek_to_block_index(&self, index: u32) -> Result<()> {
        if index == 0 {
            return self.rewind();
        }

        let mut position = self.read_current_position()?;
        if position.block_number != 0 {
            // 读一个块以离开不完整的记录
            let mut reader = self.devices.open_read(&self.device_path)?;
            let mut block = vec![0u8; self.block_size];
            let _ = reader.read(&mut block)?;
            drop(reader);
            position = self.read_current_position()?;

            if position.block_number != 0 {
                self.rewind()?;
                position = self.read_current_position()?;
                if position.block_number != 0 {
                    return Err(TlfsError::position(format!(
                        "{} still at block {} of file {} after rewind",
                        self.device_path, position.block_number, position.file_number
                    )));
                }
            }
        }

        let target = index as i64;
        if position.file_number < 0 {
            self.rewind()?;
            position = self.read_current_position()?;
        }
        if position.file_number < target {
            let delta = (target - position.file_number).to_string();
            self.mt(&["fsf", &delta])?;
        } else if position.file_number > target {
            let delta = (position.file_number - target + 1).to_string();
            self.mt(&["bsfm", &delta])?;
        }

        let position = self.read_current_position()?;
        if position.file_number != target {
            return Err(TlfsError::position(format!(
                "{} at file {} after seeking to file {}",
                self.device_path, position.file_number, target
            )));
        }
        debug!("{} positioned at tape file {}", self.device_path, index);
        Ok(())
    }

    /// 在当前位置写入标记块，随后写文件标记
    pub fn write_marker(&self, kind: MarkerKind, part_id: u64) -> Result<()> {
        let position = self.read_current_position()?;
        let block = encode_marker(kind, part_id, self.block_size);
        debug!(
            "Writing {:?} marker for part #{} at file {} on {}: {}",
            kind,
            part_id,
            position.file_number,
            self.device_path,
            hex::encode(&block[..9])
        );

        let mut writer = self
            .devices
            .open_write(&self.device_path)
            .map_err(|e| classify_write_error(&self.device_path, e))?;
        writer
            .write_all(&block)
            .map_err(|e| classify_write_error(&self.device_path, e))?;
        writer
            .flush()
            .map_err(|e| classify_write_error(&self.device_path, e))?;
        Ok(())
    }

    /// 回读磁带文件 `index` 处的标记
    ///
    /// 完成后磁头位于文件 `index + 1` 的起始处
    pub fn verify_marker(&self, kind: MarkerKind, part_id: u64, index: u32) -> Result<MarkerCheck> {
        self.seek_to_block_index(index)?;

        let mut reader = self.devices.open_read(&self.device_path)?;
        let mut block = vec![0u8; self.block_size];
        let n = reader.read(&mut block)?;
        let mut probe = vec![0u8; self.block_size];
        let trailing = if n > 0 { reader.read(&mut probe)? } else { 0 };
        drop(reader);

        let check = match decode_marker(&block[..n]) {
            None => MarkerCheck::Missing,
            Some(_) if trailing > 0 => MarkerCheck::TrailingData(trailing),
            Some((found_kind, found_id)) if found_kind == Some(kind) && found_id == part_id => {
                MarkerCheck::Match
            }
            Some((found_kind, found_id)) => MarkerCheck::Mismatch {
                kind: found_kind,
                part_id: found_id,
            },
        };

        if check.is_match() {
            debug!(
                "{:?} marker for part #{} verified at file {} on {}",
                kind, part_id, index, self.device_path
            );
        } else {
            warn!(
                "Marker check failed on {} at file {}: expected {:?} #{}, found {:?} ({})",
                self.device_path,
                index,
                kind,
                part_id,
                check,
                hex::encode(&block[..n.min(9)])
            );
        }
        Ok(check)
    }

    pub fn describe(&self) -> String {
        let state = self.state();
        match (state.slot, state.barcode) {
            (Some(slot), Some(barcode)) => {
                format!("{} (slot {}, tape {})", self.device_path, slot, barcode)
            }
            (Some(slot), None) => format!("{} (slot {}, empty)", self.device_path, slot),
            (None, _) => format!("{} (unmapped)", self.device_path),
        }
    }

    pub(crate) fn log_mapped(&self) {
        info!("Mapped drive {}", self.describe());
    }

    pub(crate) fn devices(&self) -> &Arc<dyn DeviceIo> {
        &self.devices
    }
}
