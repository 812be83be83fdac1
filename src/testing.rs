//! In-memory tape library for tests: answers `mt`, `mtx` and `lsscsi` like the
//! real tools and serves block streams on simulated non-rewinding devices.

use crate::command::CommandRunner;
use crate::device::DeviceIo;
use crate::error::{Result, TlfsError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Block(Vec<u8>),
    FileMark,
}

#[derive(Debug, Clone)]
struct SimTape {
    barcode: String,
    records: Vec<Record>,
    capacity_blocks: usize,
    failing_writes: u32,
    /// Writes that still succeed before `failing_writes` kick in.
    writes_before_failure: u32,
}

impl SimTape {
    fn new(barcode: &str, capacity_blocks: usize) -> Self {
        Self {
            barcode: barcode.to_string(),
            records: Vec::new(),
            capacity_blocks,
            failing_writes: 0,
            writes_before_failure: 0,
        }
    }
}

#[derive(Debug)]
struct SimDrive {
    device: String,
    generic: String,
    element: u32,
    tape: Option<SimTape>,
    source: Option<u32>,
    position: usize,
}

impl SimDrive {
    fn file_and_block(&self) -> (i64, i64) {
        let Some(tape) = &self.tape else {
            return (-1, -1);
        };
        let before = &tape.records[..self.position.min(tape.records.len())];
        let files = before.iter().filter(|r| **r == Record::FileMark).count();
        let blocks = before
            .iter()
            .rev()
            .take_while(|r| **r != Record::FileMark)
            .count();
        (files as i64, blocks as i64)
    }
}

#[derive(Debug)]
struct SimState {
    changer: String,
    drives: Vec<SimDrive>,
    storage: BTreeMap<u32, Option<SimTape>>,
    import_export: BTreeSet<u32>,
    moves: usize,
}

#[derive(Clone)]
pub struct SimulatedLibrary {
    state: Arc<Mutex<SimState>>,
}

fn process_error(program: &str, code: i32, stderr: &str) -> TlfsError {
    TlfsError::Process {
        program: program.to_string(),
        code,
        stderr: stderr.to_string(),
    }
}

impl SimulatedLibrary {
    /// Drive device `i` sits in changer element `drives - 1 - i`, so the
    /// slot mapping has to be discovered rather than assumed.
    pub fn new(drives: usize, storage_slots: u32) -> Self {
        let drives = (0..drives)
            .map(|i| SimDrive {
                device: format!("/dev/nst{}", i),
                generic: format!("/dev/sg{}", i),
                element: (drives - 1 - i) as u32,
                tape: None,
                source: None,
                position: 0,
            })
            .collect();
        let storage = (1..=storage_slots).map(|n| (n, None)).collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                changer: "/dev/sg9".to_string(),
                drives,
                storage,
                import_export: BTreeSet::new(),
                moves: 0,
            })),
        }
    }

    pub fn with_tape(self, slot: u32, barcode: &str, capacity_blocks: usize) -> Self {
        self.state
            .lock()
            .storage
            .insert(slot, Some(SimTape::new(barcode, capacity_blocks)));
        self
    }

    pub fn with_tape_in_drive(self, element: u32, barcode: &str, capacity_blocks: usize) -> Self {
        {
            let mut state = self.state.lock();
            if let Some(drive) = state.drives.iter_mut().find(|d| d.element == element) {
                drive.tape = Some(SimTape::new(barcode, capacity_blocks));
            }
        }
        self
    }

    pub fn with_import_export_slot(self, slot: u32) -> Self {
        {
            let mut state = self.state.lock();
            state.import_export.insert(slot);
            state.storage.entry(slot).or_insert(None);
        }
        self
    }

    pub fn changer(&self) -> String {
        self.state.lock().changer.clone()
    }

    pub fn device(&self, index: usize) -> String {
        self.state.lock().drives[index].device.clone()
    }

    pub fn moves(&self) -> usize {
        self.state.lock().moves
    }

    /// Makes the next `count` block writes on a tape fail with EIO.
    pub fn fail_writes(&self, barcode: &str, count: u32) {
        self.fail_writes_after(barcode, 0, count);
    }

    /// Lets `skip` block writes through, then fails the next `count` with EIO.
    pub fn fail_writes_after(&self, barcode: &str, skip: u32, count: u32) {
        self.with_tape_mut(barcode, |tape| {
            tape.writes_before_failure = skip;
            tape.failing_writes = count;
        });
    }

    /// Recorded content of a tape wherever it currently is.
    pub fn records(&self, barcode: &str) -> Vec<Record> {
        let mut records = Vec::new();
        self.with_tape_mut(barcode, |tape| records = tape.records.clone());
        records
    }

    /// Data blocks on a tape, filemarks excluded.
    pub fn block_count(&self, barcode: &str) -> usize {
        self.records(barcode)
            .iter()
            .filter(|r| matches!(r, Record::Block(_)))
            .count()
    }

    fn with_tape_mut(&self, barcode: &str, f: impl FnOnce(&mut SimTape)) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let tape = state
            .drives
            .iter_mut()
            .filter_map(|d| d.tape.as_mut())
            .chain(state.storage.values_mut().filter_map(|s| s.as_mut()))
            .find(|t| t.barcode == barcode);
        if let Some(tape) = tape {
            f(tape);
        }
    }

    fn drive_index(&self, device: &str) -> Option<usize> {
        self.state
            .lock()
            .drives
            .iter()
            .position(|d| d.device == device)
    }

    fn lsscsi(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        for (i, drive) in state.drives.iter().enumerate() {
            out.push_str(&format!(
                "[0:0:{}:0]    tape    IBM      ULT3580-TD8      Q390  {}   {}\n",
                i,
                drive.device.replace("/dev/nst", "/dev/st"),
                drive.generic
            ));
        }
        out.push_str(&format!(
            "[0:0:{}:0]    mediumx IBM      3573-TL          F.11  -          {}\n",
            state.drives.len(),
            state.changer
        ));
        out
    }

    fn mtx_status(state: &SimState) -> String {
        let mut out = format!(
            "  Storage Changer {}:{} Drives, {} Slots ( {} Import/Export )\n",
            state.changer,
            state.drives.len(),
            state.storage.len(),
            state.import_export.len()
        );
        let mut drives: Vec<&SimDrive> = state.drives.iter().collect();
        drives.sort_by_key(|d| d.element);
        for drive in drives {
            match (&drive.tape, drive.source) {
                (None, _) => out.push_str(&format!("Data Transfer Element {}:Empty\n", drive.element)),
                (Some(tape), Some(source)) => out.push_str(&format!(
                    "Data Transfer Element {}:Full (Storage Element {} Loaded):VolumeTag = {}\n",
                    drive.element, source, tape.barcode
                )),
                (Some(tape), None) => out.push_str(&format!(
                    "Data Transfer Element {}:Full (Unknown Storage Element Loaded):VolumeTag = {}\n",
                    drive.element, tape.barcode
                )),
            }
        }
        for (slot, tape) in &state.storage {
            let ie = if state.import_export.contains(slot) {
                " IMPORT/EXPORT"
            } else {
                ""
            };
            match tape {
                Some(tape) => out.push_str(&format!(
                    "      Storage Element {}{}:Full :VolumeTag={}\n",
                    slot, ie, tape.barcode
                )),
                None => out.push_str(&format!("      Storage Element {}{}:Empty\n", slot, ie)),
            }
        }
        out
    }

    fn mtx(&self, args: &[&str]) -> Result<String> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (slot, element) = match args {
            ["-f", _, "status"] => return Ok(Self::mtx_status(state)),
            ["-f", _, "load" | "unload", slot, element] => {
                let slot: u32 = slot.parse().map_err(|_| process_error("mtx", 1, "bad slot"))?;
                let element: u32 = element
                    .parse()
                    .map_err(|_| process_error("mtx", 1, "bad drive"))?;
                (slot, element)
            }
            _ => return Err(process_error("mtx", 1, "usage")),
        };
        let drive = state
            .drives
            .iter_mut()
            .find(|d| d.element == element)
            .ok_or_else(|| process_error("mtx", 1, "no such drive"))?;

        if args[2] == "load" {
            if drive.tape.is_some() {
                return Err(process_error("mtx", 1, &format!("Drive {} Full", element)));
            }
            let tape = state
                .storage
                .get_mut(&slot)
                .and_then(|s| s.take())
                .ok_or_else(|| {
                    process_error("mtx", 1, &format!("Source Element Address {} is Empty", slot))
                })?;
            drive.tape = Some(tape);
            drive.source = Some(slot);
            drive.position = 0;
            state.moves += 1;
            Ok(format!(
                "Loading media from Storage Element {} into drive {}...done\n",
                slot, element
            ))
        } else {
            if !matches!(state.storage.get(&slot), Some(None)) {
                return Err(process_error("mtx", 1, &format!("Storage Element {} is Full", slot)));
            }
            let tape = drive.tape.take().ok_or_else(|| {
                process_error("mtx", 1, &format!("Data Transfer Element {} is Empty", element))
            })?;
            drive.source = None;
            drive.position = 0;
            state.storage.insert(slot, Some(tape));
            state.moves += 1;
            Ok(format!(
                "Unloading drive {} into Storage Element {}...done\n",
                element, slot
            ))
        }
    }

    fn mt(&self, args: &[&str]) -> Result<String> {
        let (device, command) = match args {
            ["-f", device, rest @ ..] => (*device, rest),
            _ => return Err(process_error("mt", 1, "usage")),
        };
        let mut state = self.state.lock();
        let drive = state
            .drives
            .iter_mut()
            .find(|d| d.device == device)
            .ok_or_else(|| process_error("mt", 1, &format!("{}: No such file or directory", device)))?;

        if let ["status"] = command {
            let (file, block) = drive.file_and_block();
            let bits = match &drive.tape {
                Some(_) if drive.position == 0 => " BOT ONLINE IM_REP_EN",
                Some(_) => " ONLINE IM_REP_EN",
                None => " DR_OPEN IM_REP_EN",
            };
            return Ok(format!(
                "SCSI 2 tape drive:\nFile number={}, block number={}, partition=0.\n\
                 Tape block size 0 bytes. Density code 0x5e (LTO-8).\n\
                 Soft error count since last status=0\nGeneral status bits on (41010000):\n{}\n",
                file, block, bits
            ));
        }

        let no_medium = format!("{}: No medium found", device);
        let Some(tape) = &drive.tape else {
            return Err(process_error("mt", 2, &no_medium));
        };
        let io_error = format!("{}: Input/output error", device);
        match command {
            ["rewind"] => {
                drive.position = 0;
                Ok(String::new())
            }
            ["fsf", count] => {
                let count: usize = count.parse().map_err(|_| process_error("mt", 1, "bad count"))?;
                let mut passed = 0;
                while passed < count {
                    match tape.records.get(drive.position) {
                        Some(Record::FileMark) => passed += 1,
                        Some(Record::Block(_)) => {}
                        None => return Err(process_error("mt", 2, &io_error)),
                    }
                    drive.position += 1;
                }
                Ok(String::new())
            }
            ["bsfm", count] => {
                let count: usize = count.parse().map_err(|_| process_error("mt", 1, "bad count"))?;
                let mut passed = 0;
                let mut i = drive.position.min(tape.records.len());
                while passed < count {
                    if i == 0 {
                        drive.position = 0;
                        return Err(process_error("mt", 2, &io_error));
                    }
                    i -= 1;
                    if tape.records[i] == Record::FileMark {
                        passed += 1;
                    }
                }
                drive.position = i + 1;
                Ok(String::new())
            }
            _ => Err(process_error("mt", 1, "usage")),
        }
    }
}

impl CommandRunner for SimulatedLibrary {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        match program.rsplit('/').next().unwrap_or(program) {
            "mt" => self.mt(args),
            "mtx" => self.mtx(args),
            "lsscsi" => Ok(self.lsscsi()),
            other => Err(process_error(other, 127, "command not found")),
        }
    }
}

struct SimReader {
    state: Arc<Mutex<SimState>>,
    drive: usize,
}

impl Read for SimReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let drive = &mut state.drives[self.drive];
        let Some(tape) = &drive.tape else {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        };
        match tape.records.get(drive.position) {
            Some(Record::Block(block)) => {
                let n = block.len().min(buf.len());
                buf[..n].copy_from_slice(&block[..n]);
                drive.position += 1;
                Ok(n)
            }
            Some(Record::FileMark) => {
                drive.position += 1;
                Ok(0)
            }
            None => Ok(0),
        }
    }
}

struct SimWriter {
    state: Arc<Mutex<SimState>>,
    drive: usize,
    wrote: bool,
}

impl Write for SimWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let drive = &mut state.drives[self.drive];
        let position = drive.position;
        let Some(tape) = drive.tape.as_mut() else {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        };
        if tape.failing_writes > 0 {
            if tape.writes_before_failure > 0 {
                tape.writes_before_failure -= 1;
            } else {
                tape.failing_writes -= 1;
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
        }
        tape.records.truncate(position);
        let blocks = tape
            .records
            .iter()
            .filter(|r| matches!(r, Record::Block(_)))
            .count();
        if blocks >= tape.capacity_blocks {
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }
        tape.records.push(Record::Block(buf.to_vec()));
        drive.position += 1;
        self.wrote = true;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SimWriter {
    fn drop(&mut self) {
        if !self.wrote {
            return;
        }
        let mut state = self.state.lock();
        let drive = &mut state.drives[self.drive];
        let position = drive.position;
        if let Some(tape) = drive.tape.as_mut() {
            tape.records.truncate(position);
            tape.records.push(Record::FileMark);
            drive.position += 1;
        }
    }
}

impl DeviceIo for SimulatedLibrary {
    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let drive = self
            .drive_index(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        Ok(Box::new(SimReader {
            state: self.state.clone(),
            drive,
        }))
    }

    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        let drive = self
            .drive_index(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        Ok(Box::new(SimWriter {
            state: self.state.clone(),
            drive,
            wrote: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filemarks_and_positions() {
        let sim = SimulatedLibrary::new(1, 1).with_tape(1, "000001L8", 10);
        sim.run("mtx", &["-f", "/dev/sg9", "load", "1", "0"]).unwrap();
        let dev = sim.device(0);
        {
            let mut w = sim.open_write(&dev).unwrap();
            w.write_all(b"one").unwrap();
            w.write_all(b"two").unwrap();
        }
        let status = sim.run("mt", &["-f", &dev, "status"]).unwrap();
        assert!(status.contains("File number=1, block number=0"));

        sim.run("mt", &["-f", &dev, "bsfm", "1"]).unwrap();
        let status = sim.run("mt", &["-f", &dev, "status"]).unwrap();
        assert!(status.contains("File number=1, block number=0"));

        sim.run("mt", &["-f", &dev, "rewind"]).unwrap();
        let mut r = sim.open_read(&dev).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"two");
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert_eq!(sim.block_count("000001L8"), 2);
    }

    #[test]
    fn test_capacity_reports_enospc() {
        let sim = SimulatedLibrary::new(1, 1).with_tape(1, "000001L8", 1);
        sim.run("mtx", &["-f", "/dev/sg9", "load", "1", "0"]).unwrap();
        let mut w = sim.open_write(&sim.device(0)).unwrap();
        w.write_all(b"a").unwrap();
        let err = w.write_all(b"b").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOSPC));
    }
}
