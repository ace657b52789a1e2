/// palette_loader.rs
/// Counted copy loops that stream a palette block into CGB palette RAM
use crate::codegen::assembler::{Assembler, Condition, Reg16, Reg8};
use crate::error::PatchError;
use crate::palette::PALETTE_SET_BYTES;
use log::debug;

/// Background palette index port (BCPS)
pub const BCPS: u16 = 0xFF68;
/// Background palette data port (BCPD)
pub const BCPD: u16 = 0xFF69;
/// Object palette index port (OCPS)
pub const OCPS: u16 = 0xFF6A;
/// Object palette data port (OCPD)
pub const OCPD: u16 = 0xFF6B;
/// Index port bit enabling auto-increment after each data write
pub const AUTO_INCREMENT: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaletteTarget {
    Background,
    Object,
}

impl PaletteTarget {
    /// (index port, data port)
    pub fn ports(self) -> (u16, u16) {
        match self {
            PaletteTarget::Background => (BCPS, BCPD),
            PaletteTarget::Object => (OCPS, OCPD),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PaletteTarget::Background => "background",
            PaletteTarget::Object => "object",
        }
    }
}

/// Where the loop reads palette bytes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaletteSource {
    /// Named data block resolved at link time
    Symbol(String),
    Address(u16),
    /// HL already points at the data, e.g. right after a previous loader
    Chained,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteLoader {
    pub target: PaletteTarget,
    pub source: PaletteSource,
    /// Bytes to copy; also the loop trip count
    pub len: usize,
    /// First palette RAM byte written
    pub start_index: u8,
}

/// Offsets recorded while emitting a loader, relative to the block start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderReport {
    pub loop_start: usize,
    /// Offset of the JR NZ opcode closing the loop
    pub branch_at: usize,
    pub trip_count: u8,
}

impl PaletteLoader {
    /// Loader for a whole 64 byte set
    pub fn full_set(target: PaletteTarget, source: PaletteSource) -> Self {
        PaletteLoader {
            target,
            source,
            len: PALETTE_SET_BYTES,
            start_index: 0,
        }
    }

    /// Emit into `asm`. The loop clobbers A, C and HL.
    ///
    /// The counter is 8 bits wide, so a zero length would run 256 times;
    /// that and anything overrunning palette RAM is refused.
    pub fn emit(&self, asm: &mut Assembler) -> Result<LoaderReport, PatchError> {
        if self.len == 0 || self.start_index as usize + self.len > PALETTE_SET_BYTES {
            return Err(PatchError::PaletteSize {
                target: self.target.name().to_string(),
                start: self.start_index as usize,
                len: self.len,
            });
        }

        let (index_port, data_port) = self.target.ports();
        let loop_label = format!("{}_palette_loop_{}", self.target.name(), asm.offset());

        match &self.source {
            PaletteSource::Symbol(symbol) => {
                asm.ld_rr_symbol(Reg16::HL, symbol);
            }
            PaletteSource::Address(address) => {
                asm.ld_rr_imm(Reg16::HL, *address);
            }
            PaletteSource::Chained => {}
        }

        asm.ld_r_imm(Reg8::A, AUTO_INCREMENT | self.start_index)
            .ldh_store(index_port)
            .ld_r_imm(Reg8::C, self.len as u8);

        let loop_start = asm.offset();
        asm.label(&loop_label)
            .ld_a_hli()
            .ldh_store(data_port)
            .dec_r(Reg8::C);
        let branch_at = asm.offset();
        asm.jr_cond(Condition::NZ, &loop_label);

        debug!(
            "{} palette loader: {} bytes, loop at +{:#x}",
            self.target.name(),
            self.len,
            loop_start
        );

        Ok(LoaderReport {
            loop_start,
            branch_at,
            trip_count: self.len as u8,
        })
    }
}

/// Upload both palette sets: background from `bg_symbol`, then object from `obj_symbol`
pub fn emit_palette_upload(
    asm: &mut Assembler,
    bg_symbol: &str,
    obj_symbol: &str,
) -> Result<(LoaderReport, LoaderReport), PatchError> {
    let bg = PaletteLoader::full_set(
        PaletteTarget::Background,
        PaletteSource::Symbol(bg_symbol.to_string()),
    )
    .emit(asm)?;
    let obj = PaletteLoader::full_set(
        PaletteTarget::Object,
        PaletteSource::Symbol(obj_symbol.to_string()),
    )
    .emit(asm)?;
    Ok((bg, obj))
}
