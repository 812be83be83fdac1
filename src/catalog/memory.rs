//! In-process catalog with optional write-through JSON persistence.

use super::MetadataStore;
use crate::error::{Result, TlfsError};
use crate::model::{Entry, FilePart, NewEntry, Tape, ROOT_ENTRY_ID};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Serialize, Deserialize)]
struct CatalogState {
    next_entry_id: u64,
    next_tape_id: u32,
    next_part_id: u64,
    entries: BTreeMap<u64, Entry>,
    tapes: BTreeMap<u32, Tape>,
    parts: BTreeMap<u64, FilePart>,
    #[serde(skip)]
    live_paths: HashMap<String, u64>,
}

impl Default for CatalogState {
    fn default() -> Self {
        Self {
            next_entry_id: ROOT_ENTRY_ID + 1,
            next_tape_id: 1,
            next_part_id: 1,
            entries: BTreeMap::new(),
            tapes: BTreeMap::new(),
            parts: BTreeMap::new(),
            live_paths: HashMap::new(),
        }
    }
}

impl CatalogState {
    fn rebuild_index(&mut self) {
        self.live_paths = self
            .entries
            .values()
            .filter(|e| !e.is_deleted)
            .map(|e| (e.path.clone(), e.id))
            .collect();
    }

    fn entry_mut(&mut self, id: u64) -> Result<&mut Entry> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| TlfsError::not_found(format!("entry #{}", id)))
    }

    fn tape_mut(&mut self, id: u32) -> Result<&mut Tape> {
        self.tapes
            .get_mut(&id)
            .ok_or_else(|| TlfsError::TapeNotFound(format!("tape #{}", id)))
    }

    fn part_mut(&mut self, id: u64) -> Result<&mut FilePart> {
        self.parts
            .get_mut(&id)
            .ok_or_else(|| TlfsError::catalog(format!("file part #{} does not exist", id)))
    }

    fn soft_delete(&mut self, id: u64) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if entry.is_deleted {
            return Ok(());
        }
        entry.is_deleted = true;
        let path = entry.path.clone();
        if self.live_paths.get(&path) == Some(&id) {
            self.live_paths.remove(&path);
        }
        Ok(())
    }

    /// Hard-deletes soft-deleted entries that no stored part references.
    fn purge_orphans(&mut self) -> usize {
        let referenced: std::collections::HashSet<u64> =
            self.parts.values().map(|p| p.entry_id).collect();
        let before = self.entries.len();
        self.entries
            .retain(|id, e| !e.is_deleted || referenced.contains(id));
        before - self.entries.len()
    }
}

/// Metadata store kept in memory behind one lock.
///
/// When opened from a file every mutation is written back as a JSON snapshot
/// (temporary file, then rename).
pub struct Catalog {
    state: Mutex<CatalogState>,
    path: Option<PathBuf>,
}

impl Catalog {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(CatalogState::default()),
            path: None,
        }
    }

    /// Creates an empty catalog file, refusing to replace an existing one unless forced.
    pub fn initialise(path: &Path, force: bool) -> Result<Self> {
        if path.exists() && !force {
            return Err(TlfsError::AlreadyExists(format!(
                "catalog {} already exists; pass --force to reinitialise it",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let catalog = Self {
            state: Mutex::new(CatalogState::default()),
            path: Some(path.to_path_buf()),
        };
        {
            let state = catalog.state.lock();
            catalog.persist(&state)?;
        }
        info!("Initialised empty catalog at {}", path.display());
        Ok(catalog)
    }

    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TlfsError::catalog(format!(
                "catalog {} not found; create it with `tlfs --init`",
                path.display()
            )));
        }
        let content = fs::read_to_string(path)?;
        let mut state: CatalogState = serde_json::from_str(&content)?;
        state.rebuild_index();
        debug!(
            "Loaded catalog {}: {} entries, {} tapes, {} file parts",
            path.display(),
            state.entries.len(),
            state.tapes.len(),
            state.parts.len()
        );
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path.to_path_buf()),
        })
    }

    fn persist(&self, state: &CatalogState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(state)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&CatalogState) -> T) -> Result<T> {
        let state = self.state.lock();
        Ok(f(&state))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut CatalogState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        let value = f(&mut state)?;
        self.persist(&state)?;
        Ok(value)
    }
}

impl MetadataStore for Catalog {
    fn create_entry(&self, new: NewEntry) -> Result<Entry> {
        self.mutate(|state| {
            if new.path == "/" || state.live_paths.contains_key(&new.path) {
                return Err(TlfsError::AlreadyExists(new.path.clone()));
            }
            let now = Utc::now();
            let entry = Entry {
                id: state.next_entry_id,
                path: new.path,
                mode: new.mode,
                is_directory: new.is_directory,
                uid: new.uid,
                gid: new.gid,
                accessed: now,
                modified: now,
                parent_id: new.parent_id,
                size: 0,
                write_complete: new.is_directory,
                is_deleted: false,
            };
            state.next_entry_id += 1;
            state.live_paths.insert(entry.path.clone(), entry.id);
            state.entries.insert(entry.id, entry.clone());
            Ok(entry)
        })
    }

    fn get_entry(&self, id: u64) -> Result<Option<Entry>> {
        self.read(|state| state.entries.get(&id).filter(|e| !e.is_deleted).cloned())
    }

    fn get_entry_by_path(&self, path: &str) -> Result<Option<Entry>> {
        self.read(|state| {
            state
                .live_paths
                .get(path)
                .and_then(|id| state.entries.get(id))
                .cloned()
        })
    }

    fn list_children(&self, parent_id: u64) -> Result<Vec<Entry>> {
        self.read(|state| {
            state
                .entries
                .values()
                .filter(|e| !e.is_deleted && e.parent_id == parent_id && e.id != parent_id)
                .cloned()
                .collect()
        })
    }

    fn rename_entry(&self, id: u64, new_path: &str, new_parent_id: u64) -> Result<()> {
        self.mutate(|state| {
            if state.live_paths.contains_key(new_path) {
                return Err(TlfsError::AlreadyExists(new_path.to_string()));
            }
            let entry = state.entry_mut(id)?;
            if entry.is_directory && new_path.starts_with(&format!("{}/", entry.path)) {
                return Err(TlfsError::InvalidArgument(format!(
                    "{} cannot move below itself",
                    entry.path
                )));
            }
            let old_path = std::mem::replace(&mut entry.path, new_path.to_string());
            entry.parent_id = new_parent_id;
            let is_directory = entry.is_directory;
            state.live_paths.remove(&old_path);
            state.live_paths.insert(new_path.to_string(), id);

            if is_directory {
                let prefix = format!("{}/", old_path);
                for child in state.entries.values_mut() {
                    if child.id != id && !child.is_deleted && child.path.starts_with(&prefix) {
                        let renamed = format!("{}/{}", new_path, &child.path[prefix.len()..]);
                        state.live_paths.remove(&child.path);
                        state.live_paths.insert(renamed.clone(), child.id);
                        child.path = renamed;
                    }
                }
            }
            Ok(())
        })
    }

    fn set_owner(&self, id: u64, uid: u32, gid: u32) -> Result<()> {
        self.mutate(|state| {
            let entry = state.entry_mut(id)?;
            entry.uid = uid;
            entry.gid = gid;
            Ok(())
        })
    }

    fn set_mode(&self, id: u64, mode: u32) -> Result<()> {
        self.mutate(|state| {
            state.entry_mut(id)?.mode = mode;
            Ok(())
        })
    }

    fn set_times(
        &self,
        id: u64,
        accessed: Option<DateTime<Utc>>,
        modified: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.mutate(|state| {
            let entry = state.entry_mut(id)?;
            if let Some(at) = accessed {
                entry.accessed = at;
            }
            if let Some(mt) = modified {
                entry.modified = mt;
            }
            Ok(())
        })
    }

    fn soft_delete_entry(&self, id: u64) -> Result<()> {
        self.mutate(|state| state.soft_delete(id))
    }

    fn purge_entry(&self, id: u64) -> Result<()> {
        self.mutate(|state| {
            state.soft_delete(id)?;
            state.entries.remove(&id);
            Ok(())
        })
    }

    fn restart_write(&self, id: u64) -> Result<()> {
        self.mutate(|state| {
            let entry = state.entry_mut(id)?;
            entry.size = 0;
            entry.write_complete = false;
            entry.modified = Utc::now();
            Ok(())
        })
    }

    fn complete_write(&self, id: u64, size: u64) -> Result<()> {
        self.mutate(|state| {
            let entry = state.entry_mut(id)?;
            entry.size = size;
            entry.write_complete = true;
            entry.modified = Utc::now();
            Ok(())
        })
    }

    fn list_tapes(&self) -> Result<Vec<Tape>> {
        self.read(|state| state.tapes.values().cloned().collect())
    }

    fn get_tape(&self, id: u32) -> Result<Option<Tape>> {
        self.read(|state| state.tapes.get(&id).cloned())
    }

    fn get_tape_by_barcode(&self, barcode: &str) -> Result<Option<Tape>> {
        self.read(|state| state.tapes.values().find(|t| t.barcode == barcode).cloned())
    }

    fn add_tape(&self, barcode: &str) -> Result<Tape> {
        self.mutate(|state| {
            if state.tapes.values().any(|t| t.barcode == barcode) {
                return Err(TlfsError::AlreadyExists(format!("tape {}", barcode)));
            }
            let tape = Tape {
                id: state.next_tape_id,
                barcode: barcode.to_string(),
                capacity: Tape::estimated_capacity(barcode),
                is_full: false,
                marked_for_removal: false,
                write_errors: 0,
            };
            state.next_tape_id += 1;
            state.tapes.insert(tape.id, tape.clone());
            Ok(tape)
        })
    }

    fn mark_tape_full(&self, id: u32) -> Result<()> {
        self.mutate(|state| {
            state.tape_mut(id)?.is_full = true;
            Ok(())
        })
    }

    fn increment_write_errors(&self, id: u32) -> Result<()> {
        self.mutate(|state| {
            state.tape_mut(id)?.write_errors += 1;
            Ok(())
        })
    }

    fn create_file_part(
        &self,
        tape_id: u32,
        entry_id: u64,
        part_number: u32,
        block_size: u32,
        tape_index: u32,
    ) -> Result<FilePart> {
        self.mutate(|state| {
            if !state.tapes.contains_key(&tape_id) {
                return Err(TlfsError::TapeNotFound(format!("tape #{}", tape_id)));
            }
            let part = FilePart {
                id: state.next_part_id,
                tape_id,
                entry_id,
                part_number,
                blocks_written: 0,
                block_size,
                tape_index,
                is_deleted: false,
            };
            state.next_part_id += 1;
            state.parts.insert(part.id, part.clone());
            Ok(part)
        })
    }

    fn list_file_parts(&self, entry_id: u64) -> Result<Vec<FilePart>> {
        self.read(|state| {
            let mut parts: Vec<FilePart> = state
                .parts
                .values()
                .filter(|p| p.entry_id == entry_id && !p.is_deleted)
                .cloned()
                .collect();
            parts.sort_by_key(|p| p.part_number);
            parts
        })
    }

    fn last_part_on_tape(&self, tape_id: u32) -> Result<Option<FilePart>> {
        self.read(|state| {
            state
                .parts
                .values()
                .filter(|p| p.tape_id == tape_id)
                .max_by_key(|p| p.tape_index)
                .cloned()
        })
    }

    fn mark_part_deleted(&self, id: u64) -> Result<()> {
        self.mutate(|state| {
            state.part_mut(id)?.is_deleted = true;
            Ok(())
        })
    }

    fn delete_file_part(&self, id: u64) -> Result<()> {
        self.mutate(|state| {
            state.parts.remove(&id);
            Ok(())
        })
    }

    fn set_blocks_written(&self, id: u64, blocks: u64) -> Result<()> {
        self.mutate(|state| {
            state.part_mut(id)?.blocks_written = blocks;
            Ok(())
        })
    }

    fn deleted_bytes_on_tape(&self, tape_id: u32) -> Result<u64> {
        self.read(|state| {
            state
                .parts
                .values()
                .filter(|p| p.tape_id == tape_id && p.is_deleted)
                .map(FilePart::bytes_on_tape)
                .sum()
        })
    }

    fn total_capacity(&self) -> Result<u64> {
        self.read(|state| {
            state
                .tapes
                .values()
                .filter(|t| !t.marked_for_removal)
                .map(|t| t.capacity)
                .sum()
        })
    }

    fn consumed_space(&self) -> Result<u64> {
        self.read(|state| state.parts.values().map(FilePart::bytes_on_tape).sum())
    }

    fn useful_space(&self) -> Result<u64> {
        self.read(|state| {
            state
                .entries
                .values()
                .filter(|e| !e.is_deleted && !e.is_directory && e.write_complete)
                .map(|e| e.size)
                .sum()
        })
    }

    fn max_entry_id(&self) -> Result<u64> {
        self.read(|state| state.next_entry_id - 1)
    }

    fn delete_incomplete_files_and_parts(&self) -> Result<usize> {
        self.mutate(|state| {
            let incomplete: Vec<u64> = state
                .entries
                .values()
                .filter(|e| !e.is_deleted && !e.write_complete)
                .map(|e| e.id)
                .collect();
            for id in &incomplete {
                state.soft_delete(*id)?;
            }

            let dead: std::collections::HashSet<u64> = state
                .entries
                .values()
                .filter(|e| e.is_deleted || !e.write_complete)
                .map(|e| e.id)
                .collect();
            for part in state.parts.values_mut() {
                if dead.contains(&part.entry_id) || !state.entries.contains_key(&part.entry_id) {
                    part.is_deleted = true;
                }
            }

            let purged = state.purge_orphans();
            if !incomplete.is_empty() {
                info!(
                    "Reconciled {} write-incomplete entries ({} purged)",
                    incomplete.len(),
                    purged
                );
            }
            Ok(incomplete.len())
        })
    }

    fn clear_deleted_parts_from_end_of_tape(&self, tape_id: u32) -> Result<usize> {
        self.mutate(|state| {
            let mut on_tape: Vec<&FilePart> =
                state.parts.values().filter(|p| p.tape_id == tape_id).collect();
            on_tape.sort_by(|a, b| b.tape_index.cmp(&a.tape_index));

            let tail: Vec<u64> = on_tape
                .iter()
                .take_while(|p| p.is_deleted)
                .map(|p| p.id)
                .collect();
            for id in &tail {
                state.parts.remove(id);
            }

            if !tail.is_empty() {
                if let Some(tape) = state.tapes.get_mut(&tape_id) {
                    tape.is_full = false;
                }
                debug!("Trimmed {} deleted parts from tape #{}", tail.len(), tape_id);
            }
            state.purge_orphans();
            Ok(tail.len())
        })
    }
}
