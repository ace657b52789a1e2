/// oam.rs
/// Sprite attribute rewriter: recolors sprites by changing only the CGB palette bits
///
/// Each OAM entry is Y, X, tile, flags. The low three flag bits select one of
/// the eight object palettes on CGB hardware; everything else in the flags
/// byte (priority, flips, DMG palette, VRAM bank) is preserved.
use crate::codegen::assembler::{Assembler, Condition, Reg16, Reg8, StackReg};
use crate::codegen::opcodes::alu;
use crate::error::PatchError;
use crate::palette::{LOOKUP_SKIP, MAX_PALETTE_INDEX};
use log::debug;

/// Hardware sprite attribute table
pub const OAM_BASE: u16 = 0xFE00;
pub const SPRITE_COUNT: u8 = 40;
pub const OAM_ENTRY_SIZE: u16 = 4;
pub const PALETTE_BITS: u8 = 0x07;
/// Usual home of the HRAM OAM DMA routine
pub const DMA_ROUTINE: u16 = 0xFF80;

/// Inclusive Y range counted as on screen. Hardware hides Y = 0 and Y >= 160.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleRange {
    pub min_y: u8,
    pub max_y: u8,
}

impl Default for VisibleRange {
    fn default() -> Self {
        VisibleRange {
            min_y: 1,
            max_y: 159,
        }
    }
}

/// How the new palette index is chosen for each sprite
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaletteSelection {
    /// Every sprite gets this palette
    Fixed(u8),
    /// Sprites whose tile is in `first..=last` get `palette`, others are skipped
    TileRange { first: u8, last: u8, palette: u8 },
    /// Palette read from a 256 byte table indexed by tile; `LOOKUP_SKIP` leaves the sprite alone
    Lookup { table: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OamRewriter {
    /// Start addresses of every sprite table to rewrite, in order
    pub buffers: Vec<u16>,
    pub sprite_count: u8,
    pub visibility: Option<VisibleRange>,
    pub selection: PaletteSelection,
    /// Call the DMA routine after rewriting, for hooks that replaced the game's own call
    pub dma_after: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OamReport {
    /// Loop start offset per buffer
    pub loop_starts: Vec<usize>,
}

impl OamRewriter {
    pub fn new(buffers: Vec<u16>, selection: PaletteSelection) -> Self {
        OamRewriter {
            buffers,
            sprite_count: SPRITE_COUNT,
            visibility: None,
            selection,
            dma_after: None,
        }
    }

    /// Call the DMA routine at `dma` once every buffer is rewritten
    pub fn finish_with_dma(mut self, dma: Option<u16>) -> Self {
        self.dma_after = dma;
        self
    }

    fn validate(&self) -> Result<(), PatchError> {
        if self.buffers.is_empty() {
            return Err(PatchError::InvalidParameter(
                "OAM rewriter needs at least one buffer".to_string(),
            ));
        }
        if self.sprite_count == 0 || self.sprite_count > SPRITE_COUNT {
            return Err(PatchError::InvalidParameter(format!(
                "sprite count {} outside 1-{}",
                self.sprite_count, SPRITE_COUNT
            )));
        }
        for base in &self.buffers {
            if *base as u32 + self.sprite_count as u32 * OAM_ENTRY_SIZE as u32 > 0x10000 {
                return Err(PatchError::InvalidParameter(format!(
                    "sprite table at {:#06x} runs past the address space",
                    base
                )));
            }
        }
        if let Some(range) = self.visibility {
            if range.min_y > range.max_y {
                return Err(PatchError::InvalidParameter(format!(
                    "visible Y range {}-{} is empty",
                    range.min_y, range.max_y
                )));
            }
        }
        match &self.selection {
            PaletteSelection::Fixed(palette) | PaletteSelection::TileRange { palette, .. }
                if *palette > MAX_PALETTE_INDEX =>
            {
                Err(PatchError::InvalidPaletteIndex(*palette))
            }
            PaletteSelection::TileRange { first, last, .. } if first > last => {
                Err(PatchError::InvalidParameter(format!(
                    "tile range {:#04x}-{:#04x} is empty",
                    first, last
                )))
            }
            _ => Ok(()),
        }
    }

    /// Emit a complete subroutine ending in RET. All registers are preserved.
    pub fn emit(&self, asm: &mut Assembler) -> Result<OamReport, PatchError> {
        self.validate()?;

        let tag = asm.offset();
        let mut loop_starts = Vec::new();

        asm.push(StackReg::AF)
            .push(StackReg::BC)
            .push(StackReg::DE)
            .push(StackReg::HL);

        for (i, base) in self.buffers.iter().enumerate() {
            let top = format!("oam_{}_{}_loop", tag, i);
            let next = format!("oam_{}_{}_next", tag, i);

            asm.ld_rr_imm(Reg16::HL, *base)
                .ld_r_imm(Reg8::B, self.sprite_count);
            loop_starts.push(asm.offset());
            // HL = entry start for the whole body; restored at `next`
            asm.label(&top).push(StackReg::HL);

            if let Some(range) = self.visibility {
                asm.ld_r_r(Reg8::A, Reg8::HlInd);
                if range.min_y > 0 {
                    asm.cp_imm(range.min_y).jr_cond(Condition::C, &next);
                }
                if range.max_y < 0xFF {
                    asm.cp_imm(range.max_y + 1).jr_cond(Condition::NC, &next);
                }
            }

            // HL -> tile
            asm.inc_rr(Reg16::HL).inc_rr(Reg16::HL);
            self.emit_selection(asm, &next);

            // HL -> flags; C holds the new palette
            asm.inc_rr(Reg16::HL)
                .ld_r_r(Reg8::A, Reg8::HlInd)
                .and_imm(!PALETTE_BITS)
                .alu_r(alu::OR, Reg8::C)
                .ld_r_r(Reg8::HlInd, Reg8::A);

            asm.label(&next)
                .pop(StackReg::HL)
                .ld_rr_imm(Reg16::DE, OAM_ENTRY_SIZE)
                .add_hl_rr(Reg16::DE)
                .dec_r(Reg8::B)
                .jr_cond(Condition::NZ, &top);
        }

        if let Some(dma) = self.dma_after {
            asm.call(dma);
        }

        asm.pop(StackReg::HL)
            .pop(StackReg::DE)
            .pop(StackReg::BC)
            .pop(StackReg::AF)
            .ret();

        debug!(
            "OAM rewriter: {} buffer(s), {} sprites, {:?}",
            self.buffers.len(),
            self.sprite_count,
            self.selection
        );
        Ok(OamReport { loop_starts })
    }

    /// Leave the palette in C or branch to `skip`. HL points at the tile byte.
    fn emit_selection(&self, asm: &mut Assembler, skip: &str) {
        match &self.selection {
            PaletteSelection::Fixed(palette) => {
                asm.ld_r_imm(Reg8::C, *palette);
            }
            PaletteSelection::TileRange {
                first,
                last,
                palette,
            } => {
                asm.ld_r_r(Reg8::A, Reg8::HlInd);
                if *first > 0 {
                    asm.cp_imm(*first).jr_cond(Condition::C, skip);
                }
                if *last < 0xFF {
                    asm.cp_imm(*last + 1).jr_cond(Condition::NC, skip);
                }
                asm.ld_r_imm(Reg8::C, *palette);
            }
            PaletteSelection::Lookup { table } => {
                asm.ld_r_r(Reg8::A, Reg8::HlInd)
                    .ld_r_r(Reg8::E, Reg8::A)
                    .ld_r_imm(Reg8::D, 0)
                    .push(StackReg::HL)
                    .ld_rr_symbol(Reg16::HL, table)
                    .add_hl_rr(Reg16::DE)
                    .ld_r_r(Reg8::A, Reg8::HlInd)
                    .pop(StackReg::HL)
                    .cp_imm(LOOKUP_SKIP)
                    .jr_cond(Condition::Z, skip)
                    .and_imm(PALETTE_BITS)
                    .ld_r_r(Reg8::C, Reg8::A);
            }
        }
    }
}
