//! Superblock recovery.
//!
//! Scans every superblock copy that fits on the device, picks the valid
//! copy with the highest generation, and rewrites every other copy from it.
//! Stale valid copies (lower generation) are repair targets too, so a
//! recovered device carries one generation everywhere.

use crate::open::{read_super_region, super_copy_offsets};
use crate::prompt::Prompter;
use btr_block::ByteDevice;
use btr_error::Result;
use btr_ondisk::{Superblock, stamp_super_csum, super_csum_matches};
use btr_types::write_le_u64;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuperRecoveryStatus {
    /// Every copy is valid and carries the newest generation.
    AllValid,
    /// Bad or stale copies were rewritten from the best copy.
    Recovered,
    /// No valid copy exists to recover from.
    Failed,
    /// The user declined the rewrite.
    Aborted,
}

/// Scan result for one superblock copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SuperCopyState {
    pub offset: u64,
    pub valid: bool,
    /// Generation of a valid copy; `None` when invalid.
    pub generation: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuperRecoveryReport {
    pub status: SuperRecoveryStatus,
    pub copies: Vec<SuperCopyState>,
    /// Generation every copy carries after a successful recovery.
    pub best_generation: Option<u64>,
    pub copies_rewritten: usize,
}

impl SuperRecoveryReport {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One copy is valid when its checksum matches, it parses, and its bytenr
/// field names its own offset.
fn scan_copy(region: &[u8], offset: u64) -> SuperCopyState {
    if !super_csum_matches(region) {
        return SuperCopyState {
            offset,
            valid: false,
            generation: None,
        };
    }
    match Superblock::parse_region(region) {
        Ok(sb) if sb.bytenr == offset => SuperCopyState {
            offset,
            valid: true,
            generation: Some(sb.generation),
        },
        Ok(sb) => {
            warn!(offset, stored_bytenr = sb.bytenr, "superblock copy claims wrong offset");
            SuperCopyState {
                offset,
                valid: false,
                generation: None,
            }
        }
        Err(err) => {
            warn!(offset, %err, "superblock copy does not parse");
            SuperCopyState {
                offset,
                valid: false,
                generation: None,
            }
        }
    }
}

pub fn super_recover<D: ByteDevice, P: Prompter>(
    device: &D,
    prompter: &mut P,
) -> Result<SuperRecoveryReport> {
    recover_at(device, super_copy_offsets(device.len_bytes()), prompter)
}

fn recover_at<D: ByteDevice, P: Prompter>(
    device: &D,
    offsets: Vec<u64>,
    prompter: &mut P,
) -> Result<SuperRecoveryReport> {
    let mut copies = Vec::with_capacity(offsets.len());
    let mut regions = Vec::with_capacity(offsets.len());
    for offset in &offsets {
        let region = read_super_region(device, *offset)?;
        copies.push(scan_copy(&region, *offset));
        regions.push(region);
    }

    let best = copies
        .iter()
        .enumerate()
        .filter(|(_, c)| c.valid)
        .max_by_key(|(_, c)| c.generation);
    let Some((best_idx, best_copy)) = best else {
        return Ok(SuperRecoveryReport {
            status: SuperRecoveryStatus::Failed,
            copies,
            best_generation: None,
            copies_rewritten: 0,
        });
    };
    let best_generation = best_copy.generation;

    // Invalid copies and valid-but-stale copies both get rewritten.
    let targets: Vec<usize> = copies
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.valid || c.generation != best_generation)
        .map(|(i, _)| i)
        .collect();
    if targets.is_empty() {
        return Ok(SuperRecoveryReport {
            status: SuperRecoveryStatus::AllValid,
            copies,
            best_generation,
            copies_rewritten: 0,
        });
    }

    let question = format!(
        "rewrite {} superblock copies from the copy at offset {} (generation {})?",
        targets.len(),
        best_copy.offset,
        best_generation.unwrap_or(0)
    );
    if !prompter.confirm(&question)? {
        return Ok(SuperRecoveryReport {
            status: SuperRecoveryStatus::Aborted,
            copies,
            best_generation,
            copies_rewritten: 0,
        });
    }

    let template = regions[best_idx].clone();
    let mut rewritten = 0_usize;
    for idx in targets {
        let offset = offsets[idx];
        let mut region = template.clone();
        // Each copy names its own offset in the bytenr field.
        write_le_u64(&mut region, 0x30, offset)
            .map_err(|err| btr_error::BtrError::Parse(err.to_string()))?;
        stamp_super_csum(&mut region)
            .map_err(|err| btr_error::BtrError::Parse(err.to_string()))?;
        device.write_all_at(offset, &region)?;
        rewritten += 1;
        info!(offset, "superblock copy rewritten");
    }
    device.sync()?;

    Ok(SuperRecoveryReport {
        status: SuperRecoveryStatus::Recovered,
        copies,
        best_generation,
        copies_rewritten: rewritten,
    })
}
