//! Startup discovery of drives, the changer and the tapes it holds.

use crate::catalog::MetadataStore;
use crate::error::Result;
use crate::robot::ChangerStatus;
use tracing::{debug, info};

/// A tape drive as listed by `lsscsi --generic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDrive {
    /// Non-rewinding node (`/dev/nstN`).
    pub device_path: String,
    pub generic_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredDevices {
    pub drives: Vec<DiscoveredDrive>,
    pub changer: Option<String>,
}

/// Parses `lsscsi --generic` output.
///
/// `[0:0:0:0]  tape  IBM  ULT3580-TD8  Q390  /dev/st0  /dev/sg0`
/// `[0:0:1:0]  mediumx  IBM  3573-TL  F.11  -  /dev/sg1`
pub fn parse_lsscsi(output: &str) -> DiscoveredDevices {
    let mut devices = DiscoveredDevices::default();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 4 || !tokens[0].starts_with('[') {
            continue;
        }
        let generic = tokens[tokens.len() - 1];
        let node = tokens[tokens.len() - 2];
        match tokens[1] {
            "tape" => {
                let Some(st) = node.strip_prefix("/dev/st") else {
                    debug!("Skipping tape device without st node: {}", line.trim());
                    continue;
                };
                devices.drives.push(DiscoveredDrive {
                    device_path: format!("/dev/nst{}", st),
                    generic_path: generic.starts_with("/dev/").then(|| generic.to_string()),
                });
            }
            "mediumx" => {
                if devices.changer.is_none() && generic.starts_with("/dev/") {
                    devices.changer = Some(generic.to_string());
                }
            }
            _ => {}
        }
    }
    devices
}

/// Registers every barcode the changer reports that the catalog does not know yet.
///
/// Cleaning cartridges and slots without a readable label are ignored.
pub fn register_new_tapes(store: &dyn MetadataStore, status: &ChangerStatus) -> Result<usize> {
    let mut added = 0;
    for barcode in status.barcodes() {
        if barcode.is_empty() || barcode.starts_with("CLN") {
            continue;
        }
        if store.get_tape_by_barcode(&barcode)?.is_none() {
            let tape = store.add_tape(&barcode)?;
            info!(
                "Registered new tape {} as #{} ({})",
                tape.barcode,
                tape.id,
                crate::utils::format_bytes(tape.capacity)
            );
            added += 1;
        }
    }
    Ok(added)
}
