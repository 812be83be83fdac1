//! Request handlers run by the scheduler loop. Only this loop and the mapper
//! issue changer moves.

use super::request::{AllocationRequest, RequestKind};
use super::LibraryManager;
use crate::drive::Drive;
use crate::error::{Result, TlfsError};
use crate::model::Tape;
use crate::robot::ChangerStatus;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub(super) enum Resolution {
    Fulfilled(Arc<Drive>),
    /// The request cannot be served; the worker gets a drive-load error.
    Failed(String),
    /// Nothing to do this tick; retried on the next one.
    Deferred,
}

/// Picks the tape to append to: writable, sitting in a storage slot, fewest
/// deleted bytes, lowest id on ties.
pub fn pick_write_tape(
    tapes: &[Tape],
    deleted_bytes: &HashMap<u32, u64>,
    status: &ChangerStatus,
) -> Option<Tape> {
    tapes
        .iter()
        .filter(|t| {
            t.is_writable()
                && !status.is_in_drive_slot(&t.barcode)
                && status.is_in_storage(&t.barcode)
        })
        .min_by_key(|t| (deleted_bytes.get(&t.id).copied().unwrap_or(0), t.id))
        .cloned()
}

impl LibraryManager {
    pub(super) fn handle_request(&self, request: &AllocationRequest) -> Result<Resolution> {
        match (request.kind, request.tape_id, request.drive.clone()) {
            (RequestKind::NewWrite, _, _) => self.handle_new_write(),
            (RequestKind::NewRead, Some(tape_id), _) => self.handle_new_read(tape_id),
            (RequestKind::ContinueWrite, _, Some(drive)) => self.handle_continue_write(&drive),
            (RequestKind::ContinueRead, Some(tape_id), Some(drive)) => {
                self.handle_continue_read(&drive, tape_id)
            }
            (kind, _, _) => Ok(Resolution::Failed(format!(
                "{:?} request is missing its tape or drive",
                kind
            ))),
        }
    }

    pub fn select_tape_for_write(&self) -> Result<Option<Tape>> {
        let status = self.robot.status();
        let tapes = self.store.list_tapes()?;
        let mut deleted = HashMap::with_capacity(tapes.len());
        for tape in &tapes {
            deleted.insert(tape.id, self.store.deleted_bytes_on_tape(tape.id)?);
        }
        Ok(pick_write_tape(&tapes, &deleted, &status))
    }

    fn idle_drives(&self) -> Vec<Arc<Drive>> {
        self.drives.iter().filter(|d| d.is_idle()).cloned().collect()
    }

    fn drive_holding(&self, barcode: &str) -> Option<Arc<Drive>> {
        self.drives
            .iter()
            .find(|d| d.barcode().as_deref() == Some(barcode))
            .cloned()
    }

    fn tape_in(&self, drive: &Drive) -> Result<Option<Tape>> {
        match drive.barcode() {
            Some(barcode) => self.store.get_tape_by_barcode(&barcode),
            None => Ok(None),
        }
    }

    /// Marks a drive busy for the duration of `f`, releasing it again unless
    /// the request ends up fulfilled with it.
    fn with_claim(
        &self,
        drive: &Arc<Drive>,
        f: impl FnOnce() -> Result<Resolution>,
    ) -> Result<Resolution> {
        drive.set_busy(true);
        let result = f();
        if !matches!(result, Ok(Resolution::Fulfilled(_))) {
            drive.set_busy(false);
        }
        result
    }

    /// Empties a drive. Returns false if the changer could not take the tape back.
    fn eject(&self, drive: &Drive) -> Result<bool> {
        let Some(slot) = drive.slot() else {
            return Ok(false);
        };
        if drive.barcode().is_none() && !self.robot.status().drive_slot_occupied(slot) {
            return Ok(true);
        }
        self.robot.eject_tape(slot)?;
        if self.robot.status().drive_slot_occupied(slot) {
            warn!("Could not eject {}, no free storage slot", drive.describe());
            return Ok(false);
        }
        drive.set_barcode(None)?;
        Ok(true)
    }

    fn handle_new_write(&self) -> Result<Resolution> {
        let idle = self.idle_drives();
        for drive in &idle {
            if let Some(tape) = self.tape_in(drive)? {
                if tape.is_writable() {
                    drive.set_busy(true);
                    return Ok(Resolution::Fulfilled(drive.clone()));
                }
            }
        }
        let Some(drive) = idle.first() else {
            return Ok(Resolution::Deferred);
        };
        self.with_claim(drive, || self.load_write_tape(drive))
    }

    /// Swaps whatever the drive holds for the best tape to write on.
    fn load_write_tape(&self, drive: &Arc<Drive>) -> Result<Resolution> {
        if drive.barcode().is_some() {
            if let Some(tape) = self.tape_in(drive)? {
                if tape.is_writable() {
                    return Ok(Resolution::Fulfilled(drive.clone()));
                }
                debug!(
                    "Ejecting tape {} (full: {}, write errors: {})",
                    tape.barcode, tape.is_full, tape.write_errors
                );
            }
            if !self.eject(drive)? {
                return Ok(Resolution::Deferred);
            }
        }

        let Some(tape) = self.select_tape_for_write()? else {
            debug!("No writable tape available for {}", drive.device_path());
            return Ok(Resolution::Deferred);
        };
        let Some(slot) = drive.slot() else {
            return Ok(Resolution::Deferred);
        };
        match self.robot.move_tape_to_drive(&tape.barcode, slot) {
            Ok(()) => {}
            Err(TlfsError::TapeNotFound(barcode)) => {
                // 状态快照之后映射线程已加载该磁带，下一轮重新选择
                debug!("Tape {} left its storage slot, retrying", barcode);
                return Ok(Resolution::Deferred);
            }
            Err(e) => return Err(e),
        }
        drive.set_barcode(Some(tape.barcode.clone()))?;
        Ok(Resolution::Fulfilled(drive.clone()))
    }

    fn handle_new_read(&self, tape_id: u32) -> Result<Resolution> {
        let Some(tape) = self.store.get_tape(tape_id)? else {
            return Ok(Resolution::Failed(format!("tape #{} is not in the catalog", tape_id)));
        };
        if !self.is_mapping_complete() && self.robot.is_tape_in_drive_slot(&tape.barcode) {
            return Ok(Resolution::Deferred);
        }

        if let Some(holder) = self.drive_holding(&tape.barcode) {
            if holder.is_idle() {
                holder.set_busy(true);
                return Ok(Resolution::Fulfilled(holder));
            }
            return Ok(Resolution::Deferred);
        }

        let idle = self.idle_drives();
        let drive = idle
            .iter()
            .find(|d| d.barcode().is_none())
            .or_else(|| idle.first())
            .cloned();
        let Some(drive) = drive else {
            return Ok(Resolution::Deferred);
        };
        self.with_claim(&drive, || self.load_read_tape(&drive, &tape))
    }

    fn load_read_tape(&self, drive: &Arc<Drive>, tape: &Tape) -> Result<Resolution> {
        let current = drive.barcode();
        if current.as_deref() == Some(tape.barcode.as_str()) {
            return Ok(Resolution::Fulfilled(drive.clone()));
        }
        if current.is_some() && !self.eject(drive)? {
            return Ok(Resolution::Deferred);
        }
        let Some(slot) = drive.slot() else {
            return Ok(Resolution::Deferred);
        };
        match self.robot.move_tape_to_drive(&tape.barcode, slot) {
            Ok(()) => {}
            Err(TlfsError::TapeNotFound(barcode)) => {
                return Ok(Resolution::Failed(format!(
                    "tape {} is not in a storage slot",
                    barcode
                )))
            }
            Err(e) => return Err(e),
        }
        drive.set_barcode(Some(tape.barcode.clone()))?;
        Ok(Resolution::Fulfilled(drive.clone()))
    }

    fn handle_continue_write(&self, drive: &Arc<Drive>) -> Result<Resolution> {
        if drive.barcode().is_some() && !self.eject(drive)? {
            return Ok(Resolution::Deferred);
        }
        self.load_write_tape(drive)
    }

    fn handle_continue_read(&self, drive: &Arc<Drive>, tape_id: u32) -> Result<Resolution> {
        let Some(tape) = self.store.get_tape(tape_id)? else {
            return Ok(Resolution::Failed(format!("tape #{} is not in the catalog", tape_id)));
        };
        if drive.barcode().as_deref() == Some(tape.barcode.as_str()) {
            return Ok(Resolution::Fulfilled(drive.clone()));
        }
        if !self.is_mapping_complete() && self.robot.is_tape_in_drive_slot(&tape.barcode) {
            return Ok(Resolution::Deferred);
        }

        if let Some(holder) = self.drive_holding(&tape.barcode) {
            if !holder.is_idle() {
                return Ok(Resolution::Deferred);
            }
            holder.set_busy(true);
            let ejected = self.eject(&holder);
            holder.set_busy(false);
            if !ejected? {
                return Ok(Resolution::Deferred);
            }
        }
        self.load_read_tape(drive, &tape)
    }
}
