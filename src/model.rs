//! Records shared between the catalog, the scheduler and the streaming layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Id of the root directory entry. It is never stored in the catalog.
pub const ROOT_ENTRY_ID: u64 = 0;

/// Tape file offset of a part's end marker relative to its start marker.
pub const END_MARKER_OFFSET: u32 = 2;

/// Tape files occupied by one part: start marker, data, end marker.
pub const PART_SPAN: u32 = 3;

/// A filesystem node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: u64,
    pub path: String,
    pub mode: u32,
    pub is_directory: bool,
    pub uid: u32,
    pub gid: u32,
    pub accessed: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub parent_id: u64,
    /// Authoritative only once `write_complete` is set.
    pub size: u64,
    pub write_complete: bool,
    pub is_deleted: bool,
}

impl Entry {
    pub fn root() -> Self {
        let now = Utc::now();
        Self {
            id: ROOT_ENTRY_ID,
            path: "/".to_string(),
            mode: 0o755,
            is_directory: true,
            uid: 0,
            gid: 0,
            accessed: now,
            modified: now,
            parent_id: ROOT_ENTRY_ID,
            size: 0,
            write_complete: true,
            is_deleted: false,
        }
    }
}

/// Attributes supplied when creating an entry.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub path: String,
    pub mode: u32,
    pub is_directory: bool,
    pub uid: u32,
    pub gid: u32,
    pub parent_id: u64,
}

/// A physical volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tape {
    pub id: u32,
    pub barcode: String,
    pub capacity: u64,
    pub is_full: bool,
    pub marked_for_removal: bool,
    pub write_errors: u32,
}

impl Tape {
    /// Nominal capacity derived from the barcode's media suffix.
    pub fn estimated_capacity(barcode: &str) -> u64 {
        if barcode.ends_with("L8") {
            12_000_000_000_000
        } else if barcode.ends_with("M8") {
            900_000_000_000
        } else {
            0
        }
    }

    /// Whether new file parts may be appended to this tape.
    pub fn is_writable(&self) -> bool {
        !self.is_full && !self.marked_for_removal && self.write_errors == 0
    }
}

/// One contiguous span of a file's data on one tape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePart {
    pub id: u64,
    pub tape_id: u32,
    pub entry_id: u64,
    pub part_number: u32,
    pub blocks_written: u64,
    pub block_size: u32,
    /// Tape file number of the part's start marker.
    pub tape_index: u32,
    pub is_deleted: bool,
}

impl FilePart {
    pub fn end_marker_index(&self) -> u32 {
        self.tape_index + END_MARKER_OFFSET
    }

    pub fn data_index(&self) -> u32 {
        self.tape_index + 1
    }

    pub fn next_part_index(&self) -> u32 {
        self.tape_index + PART_SPAN
    }

    pub fn bytes_on_tape(&self) -> u64 {
        self.blocks_written * self.block_size as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotType {
    Drive,
    Storage,
}

/// A changer slot as reported by the robot. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibrarySlot {
    pub slot_type: SlotType,
    pub number: u32,
    pub occupied: bool,
    pub barcode: Option<String>,
    pub import_export: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MarkerKind {
    Start = b's',
    End = b'e',
}

impl MarkerKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b's' => Some(Self::Start),
            b'e' => Some(Self::End),
            _ => None,
        }
    }
}

/// Builds a marker block: tag byte, part id little-endian, zero padding.
pub fn encode_marker(kind: MarkerKind, part_id: u64, block_size: usize) -> Vec<u8> {
    let mut block = vec![0u8; block_size.max(9)];
    block[0] = kind.tag();
    block[1..9].copy_from_slice(&part_id.to_le_bytes());
    block
}

/// Decodes the tag and part id from the head of a marker block.
pub fn decode_marker(block: &[u8]) -> Option<(Option<MarkerKind>, u64)> {
    if block.len() < 9 {
        return None;
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&block[1..9]);
    Some((MarkerKind::from_tag(block[0]), u64::from_le_bytes(id)))
}

/// Logical head position reported by `mt status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TapePosition {
    pub partition: u8,
    pub file_number: i64,
    pub block_number: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_from_barcode() {
        assert_eq!(Tape::estimated_capacity("000001L8"), 12_000_000_000_000);
        assert_eq!(Tape::estimated_capacity("000001M8"), 900_000_000_000);
        assert_eq!(Tape::estimated_capacity("000001L7"), 0);
        assert_eq!(Tape::estimated_capacity(""), 0);
    }

    #[test]
    fn test_part_layout() {
        let part = FilePart {
            id: 9,
            tape_id: 1,
            entry_id: 4,
            part_number: 0,
            blocks_written: 3,
            block_size: 1024,
            tape_index: 6,
            is_deleted: false,
        };
        assert_eq!(part.data_index(), 7);
        assert_eq!(part.end_marker_index(), 8);
        assert_eq!(part.next_part_index(), 9);
        assert_eq!(part.bytes_on_tape(), 3072);
    }

    #[test]
    fn test_marker_block_layout() {
        let block = encode_marker(MarkerKind::End, 0x0102, 64);
        assert_eq!(block.len(), 64);
        assert_eq!(block[0], b'e');
        assert_eq!(&block[1..3], &[0x02, 0x01]);
        assert!(block[9..].iter().all(|b| *b == 0));
        assert_eq!(decode_marker(&block), Some((Some(MarkerKind::End), 0x0102)));
        assert_eq!(decode_marker(&block[..4]), None);
    }

    #[test]
    fn test_unknown_marker_tag() {
        let mut block = encode_marker(MarkerKind::Start, 1, 16);
        block[0] = b'x';
        assert_eq!(decode_marker(&block), Some((None, 1)));
    }

    #[test]
    fn test_writable_tape() {
        let mut tape = Tape {
            id: 1,
            barcode: "000001L8".into(),
            capacity: Tape::estimated_capacity("000001L8"),
            is_full: false,
            marked_for_removal: false,
            write_errors: 0,
        };
        assert!(tape.is_writable());
        tape.write_errors = 1;
        assert!(!tape.is_writable());
    }
}
