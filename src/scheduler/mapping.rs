use super::LibraryManager;
use crate::drive::Drive;
use crate::error::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

impl LibraryManager {
    /// Finds which device sits in which changer drive slot.
    ///
    /// 对每个槽位加载（或弹出）一盘磁带，状态发生变化的设备即位于该槽位
    pub(super) fn map_drives(&self) -> Result<()> {
        let status = self.robot.refresh_status()?;
        let slots: Vec<u32> = status.drive_slots.keys().copied().collect();
        let mut unresolved = Vec::new();

        for slot in slots {
            if !self.is_mounted() {
                return Ok(());
            }
            let candidates = self.unmapped_drives();
            if candidates.is_empty() {
                break;
            }
            match self.probe_slot(slot, &candidates)? {
                Some(drive) => self.assign_slot(&drive, slot)?,
                None => unresolved.push(slot),
            }
        }

        let remaining = self.unmapped_drives();
        if remaining.len() == 1 && unresolved.len() == 1 {
            self.assign_slot(&remaining[0], unresolved[0])?;
        } else {
            for drive in &remaining {
                warn!(
                    "Drive {} could not be matched to a changer slot and will not be used",
                    drive.device_path()
                );
            }
        }

        self.mapping_complete.store(true, Ordering::SeqCst);
        self.wake();
        info!("Drive mapping complete");
        Ok(())
    }

    fn unmapped_drives(&self) -> Vec<Arc<Drive>> {
        self.drives
            .iter()
            .filter(|d| d.slot().is_none())
            .cloned()
            .collect()
    }

    fn probe_slot(&self, slot: u32, candidates: &[Arc<Drive>]) -> Result<Option<Arc<Drive>>> {
        let before = candidates
            .iter()
            .map(|d| d.refresh_status())
            .collect::<Result<Vec<bool>>>()?;

        if self.robot.status().drive_slot_occupied(slot) {
            self.robot.eject_tape(slot)?;
            if self.robot.status().drive_slot_occupied(slot) {
                return Ok(None);
            }
        } else if !self.robot.move_any_tape_to_drive(slot)? {
            return Ok(None);
        }

        for (drive, was_loaded) in candidates.iter().zip(before) {
            if drive.refresh_status()? != was_loaded {
                return Ok(Some(drive.clone()));
            }
        }
        warn!("No drive changed state when toggling slot {}", slot);
        Ok(None)
    }

    fn assign_slot(&self, drive: &Drive, slot: u32) -> Result<()> {
        let barcode = self.robot.status().barcode_in_drive_slot(slot);
        drive.set_slot(Some(slot));
        drive.set_barcode(barcode)?;
        drive.set_busy(false);
        drive.log_mapped();
        Ok(())
    }
}
