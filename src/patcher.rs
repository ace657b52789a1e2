//! Binary patcher: applies a validated plan to a ROM image
//!
//! Every patch carries the bytes it expects to replace. Nothing is written
//! until all patches are in bounds, disjoint and still match the image, so a
//! failed apply leaves the ROM exactly as it was.

use crate::error::{hex_bytes, PatchError};
use crate::header::{CGB_COMPATIBLE, CGB_FLAG, CGB_ONLY, GLOBAL_CHECKSUM, HEADER_CHECKSUM};
use crate::planner::PatchPlan;
use crate::rom::RomImage;
use log::{debug, info};
use std::collections::HashMap;
use std::fmt::{Display, Error, Formatter};

/// Header bytes the patcher owns; plans may not write them directly
const PROTECTED_HEADER_BYTES: [usize; 4] = [CGB_FLAG, HEADER_CHECKSUM, GLOBAL_CHECKSUM, GLOBAL_CHECKSUM + 1];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub label: String,
    /// File offset of the first byte
    pub offset: usize,
    /// Bytes found at `offset` when the plan was made
    pub original: Vec<u8>,
    pub replacement: Vec<u8>,
}

impl Patch {
    pub fn new(label: &str, offset: usize, original: Vec<u8>, replacement: Vec<u8>) -> Self {
        Patch {
            label: label.to_string(),
            offset,
            original,
            replacement,
        }
    }

    /// Patch whose original bytes are read from `rom`
    pub fn from_rom(rom: &RomImage, label: &str, offset: usize, replacement: Vec<u8>) -> Result<Self, PatchError> {
        let original = rom.read(offset, replacement.len())?.to_vec();
        Ok(Patch::new(label, offset, original, replacement))
    }

    pub fn len(&self) -> usize {
        self.replacement.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replacement.is_empty()
    }

    pub fn end(&self) -> usize {
        self.offset + self.replacement.len()
    }
}

impl Display for Patch {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(
            f,
            "{:#07x} {:<16} {} bytes",
            self.offset,
            self.label,
            self.replacement.len()
        )
    }
}

/// Check bounds, byte ownership and header protection across a patch list
pub fn validate_patches(patches: &[Patch], rom_len: usize) -> Result<(), PatchError> {
    let mut owners: HashMap<usize, &Patch> = HashMap::new();

    for patch in patches {
        if patch.original.len() != patch.replacement.len() {
            return Err(PatchError::InvalidParameter(format!(
                "patch '{}' replaces {} bytes with {}",
                patch.label,
                patch.original.len(),
                patch.replacement.len()
            )));
        }
        if patch.offset.checked_add(patch.len()).map_or(true, |end| end > rom_len) {
            return Err(PatchError::PatchOutOfBounds {
                offset: patch.offset,
                len: patch.len(),
                rom_len,
            });
        }

        for offset in patch.offset..patch.end() {
            if PROTECTED_HEADER_BYTES.contains(&offset) {
                return Err(PatchError::PatchOverlap {
                    first: patch.label.clone(),
                    second: "cartridge header".to_string(),
                    offset,
                });
            }
            if let Some(owner) = owners.insert(offset, patch) {
                return Err(PatchError::PatchOverlap {
                    first: owner.label.clone(),
                    second: patch.label.clone(),
                    offset,
                });
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    pub applied: Vec<String>,
    pub bytes_written: usize,
    pub cgb_flag: u8,
    pub old_header_checksum: u8,
    pub new_header_checksum: u8,
    pub global_checksum: Option<u16>,
}

impl Display for PatchReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        writeln!(
            f,
            "Applied {} patches, {} bytes written",
            self.applied.len(),
            self.bytes_written
        )?;
        writeln!(f, "CGB flag: {:#04x}", self.cgb_flag)?;
        write!(
            f,
            "Header checksum: {:#04x} -> {:#04x}",
            self.old_header_checksum, self.new_header_checksum
        )?;
        if let Some(global) = self.global_checksum {
            write!(f, "\nGlobal checksum: {:#06x}", global)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patcher {
    pub update_global_checksum: bool,
}

impl Default for Patcher {
    fn default() -> Self {
        Patcher {
            update_global_checksum: true,
        }
    }
}

impl Patcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `plan` to `rom`. On error the image is unchanged.
    pub fn apply(&self, rom: &mut RomImage, plan: &PatchPlan) -> Result<PatchReport, PatchError> {
        if plan.cgb_flag != CGB_COMPATIBLE && plan.cgb_flag != CGB_ONLY {
            return Err(PatchError::InvalidParameter(format!(
                "CGB flag {:#04x} is neither compatible (0x80) nor CGB-only (0xC0)",
                plan.cgb_flag
            )));
        }

        validate_patches(&plan.patches, rom.len())?;
        for patch in &plan.patches {
            let actual = rom.read(patch.offset, patch.len())?;
            if actual != patch.original.as_slice() {
                debug!(
                    "Patch '{}' expected [{}] found [{}]",
                    patch.label,
                    hex_bytes(&patch.original),
                    hex_bytes(actual)
                );
                return Err(PatchError::OriginalMismatch {
                    offset: patch.offset,
                    expected: patch.original.clone(),
                    actual: actual.to_vec(),
                });
            }
        }

        let old_header_checksum = rom.header_checksum();
        let mut bytes_written = 0;
        let mut applied = Vec::new();
        for patch in &plan.patches {
            rom.write(patch.offset, &patch.replacement)?;
            bytes_written += patch.len();
            applied.push(patch.label.clone());
            debug!("Applied {}", patch);
        }

        rom.set_cgb_flag(plan.cgb_flag);
        let new_header_checksum = rom.update_header_checksum();
        let global_checksum = if self.update_global_checksum {
            Some(rom.update_global_checksum())
        } else {
            None
        };

        info!(
            "Applied {} patches ({} bytes), CGB flag {:#04x}, header checksum {:#04x}",
            applied.len(),
            bytes_written,
            plan.cgb_flag,
            new_header_checksum
        );

        Ok(PatchReport {
            applied,
            bytes_written,
            cgb_flag: plan.cgb_flag,
            old_header_checksum,
            new_header_checksum,
            global_checksum,
        })
    }
}
