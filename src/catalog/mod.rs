//! Metadata store: entries, tapes and file parts.
//!
//! The core only talks to the store through [`MetadataStore`]. Calls are
//! synchronous and strongly consistent.

pub mod memory;

pub use memory::Catalog;

use crate::error::Result;
use crate::model::{Entry, FilePart, NewEntry, Tape};
use chrono::{DateTime, Utc};

pub trait MetadataStore: Send + Sync {
    // Entries
    fn create_entry(&self, entry: NewEntry) -> Result<Entry>;
    fn get_entry(&self, id: u64) -> Result<Option<Entry>>;
    fn get_entry_by_path(&self, path: &str) -> Result<Option<Entry>>;
    fn list_children(&self, parent_id: u64) -> Result<Vec<Entry>>;
    fn rename_entry(&self, id: u64, new_path: &str, new_parent_id: u64) -> Result<()>;
    fn set_owner(&self, id: u64, uid: u32, gid: u32) -> Result<()>;
    fn set_mode(&self, id: u64, mode: u32) -> Result<()>;
    fn set_times(
        &self,
        id: u64,
        accessed: Option<DateTime<Utc>>,
        modified: Option<DateTime<Utc>>,
    ) -> Result<()>;
    fn soft_delete_entry(&self, id: u64) -> Result<()>;
    fn purge_entry(&self, id: u64) -> Result<()>;
    /// Resets size to zero and clears the write-complete flag.
    fn restart_write(&self, id: u64) -> Result<()>;
    /// Records the final size and sets the write-complete flag.
    fn complete_write(&self, id: u64, size: u64) -> Result<()>;

    // Tapes
    fn list_tapes(&self) -> Result<Vec<Tape>>;
    fn get_tape(&self, id: u32) -> Result<Option<Tape>>;
    fn get_tape_by_barcode(&self, barcode: &str) -> Result<Option<Tape>>;
    fn add_tape(&self, barcode: &str) -> Result<Tape>;
    fn mark_tape_full(&self, id: u32) -> Result<()>;
    fn increment_write_errors(&self, id: u32) -> Result<()>;

    // File parts
    fn create_file_part(
        &self,
        tape_id: u32,
        entry_id: u64,
        part_number: u32,
        block_size: u32,
        tape_index: u32,
    ) -> Result<FilePart>;
    /// Live parts of an entry ordered by part number.
    fn list_file_parts(&self, entry_id: u64) -> Result<Vec<FilePart>>;
    /// Part with the highest tape index on a tape, deleted or not.
    fn last_part_on_tape(&self, tape_id: u32) -> Result<Option<FilePart>>;
    fn mark_part_deleted(&self, id: u64) -> Result<()>;
    fn delete_file_part(&self, id: u64) -> Result<()>;
    fn set_blocks_written(&self, id: u64, blocks: u64) -> Result<()>;

    // Aggregates
    fn deleted_bytes_on_tape(&self, tape_id: u32) -> Result<u64>;
    fn total_capacity(&self) -> Result<u64>;
    fn consumed_space(&self) -> Result<u64>;
    fn useful_space(&self) -> Result<u64>;
    fn max_entry_id(&self) -> Result<u64>;

    // Maintenance
    /// Soft-deletes write-incomplete entries and every part they own.
    fn delete_incomplete_files_and_parts(&self) -> Result<usize>;
    /// Removes soft-deleted parts from the tail of a tape. Returns the count removed.
    fn clear_deleted_parts_from_end_of_tape(&self, tape_id: u32) -> Result<usize>;
}
