//! Palette blocks and the tile to palette lookup table
//!
//! Colors are CGB native BGR555 words stored little-endian. A palette set is
//! always 8 palettes of 4 colors, 64 bytes, the size of one palette RAM.

use crate::error::PatchError;
use log::warn;

pub const COLORS_PER_PALETTE: usize = 4;
pub const PALETTES_PER_SET: usize = 8;
pub const BYTES_PER_COLOR: usize = 2;
pub const PALETTE_SET_BYTES: usize = PALETTES_PER_SET * COLORS_PER_PALETTE * BYTES_PER_COLOR;

/// White, light gray, dark gray, black
pub const DEFAULT_PALETTE: Palette = [0x7FFF, 0x5294, 0x2108, 0x0000];

pub const LOOKUP_TABLE_SIZE: usize = 256;
/// Lookup entry meaning "leave this tile's palette alone"
pub const LOOKUP_SKIP: u8 = 0xFF;
pub const MAX_PALETTE_INDEX: u8 = 7;

pub type Palette = [u16; COLORS_PER_PALETTE];

/// Parse a 4 hex digit native color, e.g. `7FFF` or `0x001F`
pub fn parse_color(text: &str) -> Result<u16, PatchError> {
    let digits = text.trim().trim_start_matches("0x").trim_start_matches("0X");
    if digits.is_empty() || digits.len() > 4 {
        return Err(PatchError::Config(format!(
            "color '{}' is not a 4 digit hex word",
            text
        )));
    }
    let word = u16::from_str_radix(digits, 16)
        .map_err(|_| PatchError::Config(format!("color '{}' is not hex", text)))?;
    Ok(word & 0x7FFF)
}

/// One 64 byte palette set, ready to stream into palette RAM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteBlock {
    bytes: [u8; PALETTE_SET_BYTES],
}

impl PaletteBlock {
    /// Build from up to 8 palettes; missing palettes get the default ramp
    pub fn from_palettes(palettes: &[Palette]) -> Self {
        if palettes.len() > PALETTES_PER_SET {
            warn!(
                "{} palettes given, only the first {} fit a palette set",
                palettes.len(),
                PALETTES_PER_SET
            );
        }
        let mut bytes = [0u8; PALETTE_SET_BYTES];
        for slot in 0..PALETTES_PER_SET {
            let palette = palettes.get(slot).unwrap_or(&DEFAULT_PALETTE);
            for (i, color) in palette.iter().enumerate() {
                let at = (slot * COLORS_PER_PALETTE + i) * BYTES_PER_COLOR;
                let [lo, hi] = (color & 0x7FFF).to_le_bytes();
                bytes[at] = lo;
                bytes[at + 1] = hi;
            }
        }
        PaletteBlock { bytes }
    }

    /// Pad with the default ramp or truncate a raw byte run to exactly one set
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut block = Self::from_palettes(&[]);
        let take = raw.len().min(PALETTE_SET_BYTES);
        if raw.len() > PALETTE_SET_BYTES {
            warn!("Palette data of {} bytes truncated to {}", raw.len(), PALETTE_SET_BYTES);
        }
        block.bytes[..take].copy_from_slice(&raw[..take]);
        block
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn color(&self, palette: usize, index: usize) -> u16 {
        let at = (palette * COLORS_PER_PALETTE + index) * BYTES_PER_COLOR;
        u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]])
    }
}

/// Background and object palette sets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteSet {
    pub background: PaletteBlock,
    pub object: PaletteBlock,
}

impl PaletteSet {
    pub fn new(background: &[Palette], object: &[Palette]) -> Self {
        PaletteSet {
            background: PaletteBlock::from_palettes(background),
            object: PaletteBlock::from_palettes(object),
        }
    }
}

/// 256 entry table from tile ID to object palette index, `LOOKUP_SKIP` for untouched tiles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLookupTable {
    entries: [u8; LOOKUP_TABLE_SIZE],
}

impl Default for TileLookupTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TileLookupTable {
    pub fn new() -> Self {
        TileLookupTable {
            entries: [LOOKUP_SKIP; LOOKUP_TABLE_SIZE],
        }
    }

    /// Map every tile in `first..=last` to `palette`. Later assignments win.
    pub fn assign(&mut self, first: u8, last: u8, palette: u8) -> Result<(), PatchError> {
        if palette > MAX_PALETTE_INDEX {
            return Err(PatchError::InvalidPaletteIndex(palette));
        }
        if first > last {
            return Err(PatchError::InvalidParameter(format!(
                "tile range {:#04x}-{:#04x} is empty",
                first, last
            )));
        }
        for tile in first..=last {
            self.entries[tile as usize] = palette;
        }
        Ok(())
    }

    pub fn clear(&mut self, tile: u8) {
        self.entries[tile as usize] = LOOKUP_SKIP;
    }

    pub fn get(&self, tile: u8) -> Option<u8> {
        match self.entries[tile as usize] {
            LOOKUP_SKIP => None,
            palette => Some(palette),
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, PatchError> {
        if raw.len() != LOOKUP_TABLE_SIZE {
            return Err(PatchError::InvalidParameter(format!(
                "lookup table must be {} bytes, got {}",
                LOOKUP_TABLE_SIZE,
                raw.len()
            )));
        }
        if let Some(bad) = raw
            .iter()
            .find(|b| **b != LOOKUP_SKIP && **b > MAX_PALETTE_INDEX)
        {
            return Err(PatchError::InvalidPaletteIndex(*bad));
        }
        let mut entries = [LOOKUP_SKIP; LOOKUP_TABLE_SIZE];
        entries.copy_from_slice(raw);
        Ok(TileLookupTable { entries })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.entries
    }

    pub fn assigned_count(&self) -> usize {
        self.entries.iter().filter(|b| **b != LOOKUP_SKIP).count()
    }
}
