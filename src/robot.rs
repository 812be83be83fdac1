//! Medium changer control through `mtx`.

use crate::command::CommandRunner;
use crate::error::{Result, TlfsError};
use crate::model::{LibrarySlot, SlotType};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 解析后的 `mtx status` 报告，每次刷新整体替换
#[derive(Debug, Clone, Default)]
pub struct ChangerStatus {
    pub slots: Vec<LibrarySlot>,
    pub drive_slots: BTreeMap<u32, LibrarySlot>,
    pub storage_slots: BTreeMap<u32, LibrarySlot>,
}

impl ChangerStatus {
    pub fn from_slots(slots: Vec<LibrarySlot>) -> Self {
        let mut drive_slots = BTreeMap::new();
        let mut storage_slots = BTreeMap::new();
        for slot in &slots {
            match slot.slot_type {
                SlotType::Drive => drive_slots.insert(slot.number, slot.clone()),
                SlotType::Storage => storage_slots.insert(slot.number, slot.clone()),
            };
        }
        Self {
            slots,
            drive_slots,
            storage_slots,
        }
    }

    pub fn is_in_drive_slot(&self, barcode: &str) -> bool {
        self.drive_slots
            .values()
            .any(|s| s.barcode.as_deref() == Some(barcode))
    }

    /// 磁带是否位于普通存储槽位（可直接加载）
    pub fn is_in_storage(&self, barcode: &str) -> bool {
        self.storage_slots
            .values()
            .any(|s| !s.import_export && s.barcode.as_deref() == Some(barcode))
    }

    pub fn drive_slot_occupied(&self, number: u32) -> bool {
        self.drive_slots
            .get(&number)
            .map(|s| s.occupied)
            .unwrap_or(false)
    }

    pub fn barcode_in_drive_slot(&self, number: u32) -> Option<String> {
        self.drive_slots.get(&number).and_then(|s| s.barcode.clone())
    }

    /// All barcodes the changer can see, drive slots included.
    pub fn barcodes(&self) -> Vec<String> {
        self.slots.iter().filter_map(|s| s.barcode.clone()).collect()
    }
}

/// Parses one `mtx status` line.
///
/// Returns `Ok(None)` for lines that are not element lines (headers, blanks).
pub fn parse_element_line(line: &str) -> Result<Option<LibrarySlot>> {
    let line = line.trim();
    let Some(element_at) = line.find(" Element ") else {
        return Ok(None);
    };
    let Some(colon) = line.find(':') else {
        return Ok(None);
    };
    if colon < element_at {
        return Ok(None);
    }

    let slot_type = match &line[..element_at] {
        "Data Transfer" => SlotType::Drive,
        "Storage" => SlotType::Storage,
        other => {
            return Err(TlfsError::parse(format!(
                "unknown element type '{}' in line: {}",
                other, line
            )))
        }
    };

    let address = &line[element_at + " Element ".len()..colon];
    let mut address_parts = address.split_whitespace();
    let number: u32 = address_parts
        .next()
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| TlfsError::parse(format!("bad slot number in line: {}", line)))?;
    let import_export = match address_parts.next() {
        None => false,
        Some("IMPORT/EXPORT") => true,
        Some(other) => {
            return Err(TlfsError::parse(format!(
                "unexpected slot qualifier '{}' in line: {}",
                other, line
            )))
        }
    };

    let rest = &line[colon + 1..];
    let state: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    let occupied = match state.as_str() {
        "Full" => true,
        "Empty" => false,
        other => {
            return Err(TlfsError::parse(format!(
                "unknown slot state '{}' in line: {}",
                other, line
            )))
        }
    };

    let barcode = rest.find("VolumeTag").and_then(|at| {
        let tag = &rest[at + "VolumeTag".len()..];
        let tag = tag.trim_start().strip_prefix('=')?;
        tag.split_whitespace().next().map(str::to_string)
    });

    Ok(Some(LibrarySlot {
        slot_type,
        number,
        occupied,
        barcode: if occupied { barcode } else { None },
        import_export,
    }))
}

pub fn parse_changer_status(output: &str) -> Result<ChangerStatus> {
    let mut slots = Vec::new();
    for line in output.lines() {
        if let Some(slot) = parse_element_line(line)? {
            slots.push(slot);
        }
    }
    Ok(ChangerStatus::from_slots(slots))
}

pub struct LibraryRobot {
    changer_path: String,
    mtx: String,
    runner: Arc<dyn CommandRunner>,
    status: RwLock<Arc<ChangerStatus>>,
    moves: Mutex<()>,
}

impl LibraryRobot {
    pub fn new(changer_path: &str, mtx: &str, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            changer_path: changer_path.to_string(),
            mtx: mtx.to_string(),
            runner,
            status: RwLock::new(Arc::new(ChangerStatus::default())),
            moves: Mutex::new(()),
        }
    }

    pub fn changer_path(&self) -> &str {
        &self.changer_path
    }

    /// Last status snapshot.
    pub fn status(&self) -> Arc<ChangerStatus> {
        self.status.read().clone()
    }

    pub fn refresh_status(&self) -> Result<Arc<ChangerStatus>> {
        let _guard = self.moves.lock();
        self.refresh_locked()
    }

    fn refresh_locked(&self) -> Result<Arc<ChangerStatus>> {
        let output = self
            .runner
            .run(&self.mtx, &["-f", &self.changer_path, "status"])?;
        let status = Arc::new(parse_changer_status(&output)?);
        *self.status.write() = status.clone();
        Ok(status)
    }

    fn load(&self, storage_slot: u32, drive_slot: u32) -> Result<()> {
        info!(
            "Loading tape from storage slot {} into drive slot {}",
            storage_slot, drive_slot
        );
        self.runner.run(
            &self.mtx,
            &[
                "-f",
                &self.changer_path,
                "load",
                &storage_slot.to_string(),
                &drive_slot.to_string(),
            ],
        )?;
        Ok(())
    }

    /// 加载第一个存储槽位中的磁带，没有磁带时返回 false
    pub fn move_any_tape_to_drive(&self, drive_slot: u32) -> Result<bool> {
        let _guard = self.moves.lock();
        let status = self.refresh_locked()?;
        let source = status.storage_slots.values().find(|s| {
            s.occupied
                && !s.import_export
                && !s
                    .barcode
                    .as_deref()
                    .map(|b| b.starts_with("CLN"))
                    .unwrap_or(false)
        });
        let Some(source) = source else {
            debug!("No loadable tape in storage for drive slot {}", drive_slot);
            return Ok(false);
        };
        self.load(source.number, drive_slot)?;
        self.refresh_locked()?;
        Ok(true)
    }

    pub fn move_tape_to_drive(&self, barcode: &str, drive_slot: u32) -> Result<()> {
        let _guard = self.moves.lock();
        let status = self.refresh_locked()?;
        let source = status
            .storage_slots
            .values()
            .find(|s| !s.import_export && s.barcode.as_deref() == Some(barcode))
            .ok_or_else(|| TlfsError::TapeNotFound(barcode.to_string()))?;
        self.load(source.number, drive_slot)?;
        self.refresh_locked()?;
        Ok(())
    }

    /// Unloads a drive slot into the first empty storage slot.
    ///
    /// 驱动器槽位为空或没有空闲存储槽位时不做任何操作，
    /// 调用方需要重新检查状态
    pub fn eject_tape(&self, drive_slot: u32) -> Result<()> {
        let _guard = self.moves.lock();
        let status = self.refresh_locked()?;
        if !status.drive_slot_occupied(drive_slot) {
            return Ok(());
        }
        let Some(target) = status
            .storage_slots
            .values()
            .find(|s| !s.occupied && !s.import_export)
        else {
            warn!(
                "No empty storage slot to eject drive slot {} into",
                drive_slot
            );
            return Ok(());
        };

        info!(
            "Unloading drive slot {} into storage slot {}",
            drive_slot, target.number
        );
        self.runner.run(
            &self.mtx,
            &[
                "-f",
                &self.changer_path,
                "unload",
                &target.number.to_string(),
                &drive_slot.to_string(),
            ],
        )?;
        self.refresh_locked()?;
        Ok(())
    }

    pub fn is_tape_in_drive_slot(&self, barcode: &str) -> bool {
        self.status().is_in_drive_slot(barcode)
    }
}
