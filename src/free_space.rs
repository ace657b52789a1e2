//! Pad byte runs that can hold injected code and data

use crate::error::PatchError;
use crate::rom::{BankedAddress, RomImage, BANK_SIZE};
use log::debug;
use std::fmt::{Display, Error, Formatter};

/// Byte values cartridges are usually padded with
pub const DEFAULT_PAD_BYTES: [u8; 2] = [0xFF, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRegion {
    pub start: BankedAddress,
    pub len: usize,
    pub pad: u8,
}

impl FreeRegion {
    pub fn new(start: BankedAddress, len: usize, pad: u8) -> Self {
        FreeRegion { start, len, pad }
    }

    /// CPU address one past the region
    pub fn end_address(&self) -> u32 {
        self.start.address as u32 + self.len as u32
    }
}

impl Display for FreeRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{} +{:#x} (pad {:02X})", self.start, self.len, self.pad)
    }
}

/// Every run of at least `min_len` identical pad bytes, longest first.
///
/// Runs never span a bank boundary since code placed there could not be
/// mapped in one piece.
pub fn find_free_space(rom: &RomImage, min_len: usize, pad_bytes: &[u8]) -> Vec<FreeRegion> {
    let mut regions = Vec::new();
    let data = rom.as_bytes();

    for (bank, chunk) in data.chunks(BANK_SIZE).enumerate() {
        let mut i = 0;
        while i < chunk.len() {
            let pad = chunk[i];
            if !pad_bytes.contains(&pad) {
                i += 1;
                continue;
            }
            let start = i;
            while i < chunk.len() && chunk[i] == pad {
                i += 1;
            }
            let len = i - start;
            if len >= min_len {
                // from_offset only fails past bank 0xFF, which a 4MiB ROM never reaches
                if let Ok(address) = BankedAddress::from_offset(bank * BANK_SIZE + start) {
                    regions.push(FreeRegion::new(address, len, pad));
                }
            }
        }
    }

    regions.sort_by(|a, b| b.len.cmp(&a.len).then(a.start.cmp(&b.start)));
    debug!("Found {} free regions of at least {} bytes", regions.len(), min_len);
    regions
}

/// Length of the actual pad run from the start of `region`, capped at the declared length
pub fn verify_region(rom: &RomImage, region: &FreeRegion) -> Result<usize, PatchError> {
    let offset = region.start.to_offset()?;
    if offset >= rom.len() {
        return Err(PatchError::AddressOutOfRange(format!(
            "free region {} is beyond the end of the ROM",
            region
        )));
    }
    let bank_end = (offset / BANK_SIZE + 1) * BANK_SIZE;
    let limit = (offset + region.len).min(bank_end).min(rom.len());

    let available = rom.as_bytes()[offset..limit]
        .iter()
        .take_while(|b| **b == region.pad)
        .count();

    if available < region.len {
        debug!(
            "Free region {} only has {} pad bytes",
            region, available
        );
    }
    Ok(available)
}
