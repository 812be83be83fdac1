//! File coordinator: one streaming session per open entry, ordered reads,
//! sequential writes and volume spanning.

use crate::catalog::MetadataStore;
use crate::error::{Result, TlfsError};
use crate::model::{Entry, MarkerKind};
use crate::open_file::{OpenFile, OpenMode};
use crate::scheduler::{LibraryManager, MAX_WRITE_RETRIES, TICK};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct OpenHandle {
    file: Mutex<OpenFile>,
    cursor_moved: Condvar,
}

enum HandleSlot {
    /// Reserved while the session is being set up.
    Opening,
    Open(Arc<OpenHandle>),
}

pub struct FileSystemManager {
    store: Arc<dyn MetadataStore>,
    library: Arc<LibraryManager>,
    handles: Mutex<HashMap<u64, HandleSlot>>,
    handle_released: Condvar,
}

impl FileSystemManager {
    pub fn new(library: Arc<LibraryManager>) -> Self {
        Self {
            store: library.store().clone(),
            library,
            handles: Mutex::new(HashMap::new()),
            handle_released: Condvar::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn library(&self) -> &Arc<LibraryManager> {
        &self.library
    }

    /// Looks up a live entry; `/` resolves to the synthetic root.
    pub fn get_entry(&self, path: &str) -> Result<Option<Entry>> {
        if path == "/" {
            return Ok(Some(Entry::root()));
        }
        self.store.get_entry_by_path(path)
    }

    /// Opens a file and returns its handle, which is the entry id.
    ///
    /// Blocks while the same entry is open elsewhere. An empty file opens for
    /// writing, anything else for reading.
    pub fn open(&self, path: &str, truncate: bool) -> Result<u64> {
        let entry = self
            .get_entry(path)?
            .ok_or_else(|| TlfsError::not_found(path))?;
        if entry.is_directory {
            return Err(TlfsError::IsDirectory(path.to_string()));
        }
        let id = entry.id;

        {
            let mut handles = self.handles.lock();
            while handles.contains_key(&id) {
                if !self.library.is_mounted() {
                    return Err(TlfsError::Unmounted);
                }
                debug!("{} is already open, waiting for release", path);
                self.handle_released.wait_for(&mut handles, TICK);
            }
            handles.insert(id, HandleSlot::Opening);
        }

        match self.open_session(id, truncate) {
            Ok(file) => {
                let handle = Arc::new(OpenHandle {
                    file: Mutex::new(file),
                    cursor_moved: Condvar::new(),
                });
                self.handles.lock().insert(id, HandleSlot::Open(handle));
                Ok(id)
            }
            Err(e) => {
                self.handles.lock().remove(&id);
                self.handle_released.notify_all();
                Err(e)
            }
        }
    }

    fn open_session(&self, id: u64, truncate: bool) -> Result<OpenFile> {
        // reload: a previous holder may have written or deleted it
        let mut entry = self
            .store
            .get_entry(id)?
            .ok_or_else(|| TlfsError::not_found(format!("entry #{}", id)))?;

        if truncate && entry.size > 0 {
            self.discard_parts(id)?;
            entry.size = 0;
        }

        if entry.size == 0 {
            self.store.restart_write(id)?;
            let (drive, part) = self.library.load_for_new_write(id)?;
            info!("Opened {} for writing on {}", entry.path, drive.describe());
            return Ok(OpenFile::for_write(entry, drive, part));
        }

        let parts = self.store.list_file_parts(id)?;
        let drive = self.library.load_for_new_read(&parts)?;
        let opened = OpenFile::for_read(entry, drive.clone(), parts).and_then(|mut file| {
            file.prefetch()?;
            Ok(file)
        });
        match opened {
            Ok(file) => {
                info!("Opened {} for reading on {}", file.entry().path, drive.describe());
                Ok(file)
            }
            Err(e) => {
                self.library.release_drive(&drive);
                Err(e)
            }
        }
    }

    /// Soft-deletes every part of an entry and queues trims for their tapes.
    fn discard_parts(&self, id: u64) -> Result<()> {
        let parts = self.store.list_file_parts(id)?;
        let tapes: BTreeSet<u32> = parts.iter().map(|p| p.tape_id).collect();
        for part in &parts {
            self.store.mark_part_deleted(part.id)?;
        }
        self.store.restart_write(id)?;
        for tape_id in tapes {
            self.library.trim_tape(tape_id);
        }
        Ok(())
    }

    fn handle(&self, fh: u64) -> Result<Arc<OpenHandle>> {
        match self.handles.lock().get(&fh) {
            Some(HandleSlot::Open(handle)) => Ok(handle.clone()),
            _ => Err(TlfsError::BadHandle(fh)),
        }
    }

    /// Appends `data` at `offset`, which must equal the bytes written so far.
    ///
    /// Returns a short count when a flush fails after part of `data` was
    /// accepted; the caller resumes at `offset + count`.
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let handle = self.handle(fh)?;
        let mut file = handle.file.lock();
        if file.mode() != OpenMode::Write || file.is_closed() {
            return Err(TlfsError::BadHandle(fh));
        }
        if offset != file.size() {
            return Err(TlfsError::OutOfOrderWrite {
                expected: file.size(),
                actual: offset,
            });
        }

        let mut written = 0;
        while written < data.len() {
            if file.buffer_full() {
                if let Err(e) = self.flush_with_recovery(&mut file) {
                    if written == 0 {
                        return Err(e);
                    }
                    warn!(
                        "Short write to {} after {} of {} bytes: {}",
                        file.entry().path,
                        written,
                        data.len(),
                        e
                    );
                    return Ok(written);
                }
            }
            written += file.prepare_write(&data[written..]);
        }
        Ok(written)
    }

    /// Flushes the block buffer, moving to a new volume on write faults.
    fn flush_with_recovery(&self, file: &mut OpenFile) -> Result<()> {
        let mut faults = 0;
        loop {
            match file.flush() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_write_fault() => {
                    if !e.is_end_of_volume() {
                        faults += 1;
                        if faults >= MAX_WRITE_RETRIES {
                            self.library.record_write_failure(file.drive(), &e)?;
                            return Err(e);
                        }
                    }
                    self.move_to_next_volume(file, &e)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Closes the current part and continues the file on another tape.
    fn move_to_next_volume(&self, file: &mut OpenFile, error: &TlfsError) -> Result<()> {
        let drive = file.drive().clone();
        self.library.record_write_failure(&drive, error)?;
        file.close_tape_stream();

        let part = file
            .current_part()
            .cloned()
            .ok_or_else(|| TlfsError::catalog(format!("{} has no current part", file.entry().path)))?;
        let next_number = if file.blocks_in_part() == 0 {
            self.store.delete_file_part(part.id)?;
            file.forget_part(part.part_number);
            part.part_number
        } else {
            self.store.set_blocks_written(part.id, file.blocks_in_part())?;
            if let Err(e) = drive.write_marker(MarkerKind::End, part.id) {
                warn!("Could not close part #{} with an end marker: {}", part.id, e);
            }
            part.part_number + 1
        };

        info!(
            "Continuing {} as part {} after: {}",
            file.entry().path,
            next_number,
            error
        );
        let next = self
            .library
            .load_to_continue_write(file.entry().id, next_number, &drive)?;
        file.begin_part(next);
        Ok(())
    }

    /// Reads at `offset`, blocking until every earlier offset has been served.
    pub fn read(&self, fh: u64, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let handle = self.handle(fh)?;
        let mut file = handle.file.lock();
        if file.mode() != OpenMode::Read {
            return Err(TlfsError::BadHandle(fh));
        }
        if offset >= file.size() {
            return Ok(0);
        }

        loop {
            if file.is_closed() {
                return Err(TlfsError::BadHandle(fh));
            }
            let cursor = file.read_offset();
            if cursor == offset {
                break;
            }
            if cursor > offset {
                return Err(TlfsError::OutOfOrderRead {
                    cursor,
                    requested: offset,
                });
            }
            handle.cursor_moved.wait_for(&mut file, TICK);
        }

        let result = self.fill(&mut file, buf);
        handle.cursor_moved.notify_all();
        result
    }

    fn fill(&self, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize> {
        let remaining = file.size() - file.read_offset();
        let want = usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len());

        let mut filled = file.read_into(&mut buf[..want])?;
        while filled < want && file.volume_exhausted() {
            let next = file.next_part().ok_or_else(|| {
                TlfsError::position(format!(
                    "{} ends after {} of {} bytes",
                    file.entry().path,
                    file.read_offset(),
                    file.size()
                ))
            })?;
            file.close_read();
            let drive = file.drive().clone();
            self.library.load_to_continue_read(&next, &drive)?;
            file.continue_read(&next);
            filled += file.read_into(&mut buf[filled..want])?;
        }
        Ok(filled)
    }

    /// Ends a session. Write sessions are flushed and closed on tape first.
    pub fn release(&self, fh: u64) -> Result<()> {
        let handle = self.handle(fh)?;
        let (drive, result) = {
            let mut file = handle.file.lock();
            let result = match file.mode() {
                OpenMode::Read => {
                    file.close_read();
                    Ok(())
                }
                OpenMode::Write => self.finish_write(&mut file),
            };
            file.close_tape_stream();
            file.mark_closed();
            (file.drive().clone(), result)
        };

        self.library.release_drive(&drive);
        self.handles.lock().remove(&fh);
        self.handle_released.notify_all();
        handle.cursor_moved.notify_all();
        result
    }

    fn finish_write(&self, file: &mut OpenFile) -> Result<()> {
        let id = file.entry().id;
        self.flush_with_recovery(file)?;
        file.close_tape_stream();

        let part = file
            .current_part()
            .cloned()
            .ok_or_else(|| TlfsError::catalog(format!("{} has no current part", file.entry().path)))?;

        if file.size() == 0 {
            // empty files are not kept
            for part in self.store.list_file_parts(id)? {
                self.store.mark_part_deleted(part.id)?;
            }
            self.store.clear_deleted_parts_from_end_of_tape(part.tape_id)?;
            self.store.purge_entry(id)?;
            info!("Removed empty file {}", file.entry().path);
            return Ok(());
        }

        self.store.set_blocks_written(part.id, file.blocks_in_part())?;
        match file.write_end_marker() {
            Ok(()) => {}
            Err(e) if e.is_end_of_volume() => {
                warn!(
                    "No room for the end marker of part #{}, tape marked full",
                    part.id
                );
                self.library.record_write_failure(file.drive(), &e)?;
            }
            Err(e) => return Err(e),
        }
        self.store.complete_write(id, file.size())?;
        info!(
            "Wrote {} ({}) in {} parts",
            file.entry().path,
            crate::utils::format_bytes(file.size()),
            part.part_number + 1
        );
        Ok(())
    }

    /// Removes a file: its entry and parts are soft-deleted and trims queued.
    pub fn delete(&self, path: &str) -> Result<()> {
        let entry = self
            .get_entry(path)?
            .ok_or_else(|| TlfsError::not_found(path))?;
        if entry.is_directory {
            return Err(TlfsError::IsDirectory(path.to_string()));
        }

        let parts = self.store.list_file_parts(entry.id)?;
        if parts.is_empty() {
            self.store.purge_entry(entry.id)?;
            return Ok(());
        }
        let tapes: BTreeSet<u32> = parts.iter().map(|p| p.tape_id).collect();
        for part in &parts {
            self.store.mark_part_deleted(part.id)?;
        }
        self.store.soft_delete_entry(entry.id)?;
        for tape_id in tapes {
            self.library.trim_tape(tape_id);
        }
        debug!("Deleted {} ({} parts)", path, parts.len());
        Ok(())
    }
}
