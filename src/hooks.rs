//! Hook sites: places in the game's own code where injected routines get control
//!
//! A site either gives up a run of instruction bytes to a trampoline
//! (`Splice`), has an existing CALL whose operand can be retargeted
//! (`CallSite`), or is one of the game's own DMG palette writes
//! (`PaletteWrite`). Sites are picked per phase; safe sites always win over
//! unsafe ones. Palette write sites are found by scanning the ROM and are all
//! hooked at once.

use crate::disassembler::CallGraph;
use crate::error::PatchError;
use crate::planner::NopPatch;
use crate::rom::{BankedAddress, RomImage};
use log::{debug, warn};
use std::fmt::{Display, Error, Formatter};

/// When during the frame or game lifecycle a hook runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    /// Once, before the game's own initialisation continues
    Boot,
    /// Every frame from the joypad polling routine
    InputPoll,
    /// Right before the game's OAM DMA transfer
    PostDma,
    /// Whenever a level is (re)loaded
    LevelLoad,
    /// Whenever the game writes one of its DMG palette registers
    PaletteWrite,
}

impl Display for HookPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let name = match self {
            HookPhase::Boot => "boot",
            HookPhase::InputPoll => "input_poll",
            HookPhase::PostDma => "post_dma",
            HookPhase::LevelLoad => "level_load",
            HookPhase::PaletteWrite => "palette_write",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookSafety {
    Safe,
    /// Known or suspected to be reached from more than one context
    Unsafe,
}

/// What happens to the instructions the splice overwrites
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceStrategy {
    /// Trampoline sits at the site; overwritten instructions run at the start
    /// of the banked routine
    InPlace,
    /// Site becomes `JP stub`; the stub in bank 0 holds the trampoline plus a
    /// copy of the overwritten instructions and jumps back
    Stub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Up to `len` bytes starting at the site may be rewritten
    Splice { len: usize, strategy: SpliceStrategy },
    /// A 3 byte CALL whose target gets redirected through a stub
    CallSite,
    /// `LD A,n; LDH [FF00+register],A`, replaced by a CALL to a wrapper that
    /// does the same write and then uploads the CGB palettes
    PaletteWrite { register: u8 },
}

/// BGP, OBP0 and OBP1, as `LDH` operands
pub const DMG_PALETTE_REGISTERS: [u8; 3] = [0x47, 0x48, 0x49];

/// Bytes of `LD A,n; LDH [n],A`
pub const PALETTE_WRITE_LEN: usize = 4;

/// `(value, register)` if `bytes` open with `LD A,value; LDH [FF00+register],A`
/// for one of `registers`
pub fn match_palette_write(bytes: &[u8], registers: &[u8]) -> Option<(u8, u8)> {
    match bytes {
        [0x3E, value, 0xE0, register, ..] if registers.contains(register) => Some((*value, *register)),
        _ => None,
    }
}

/// Scan a bank for immediate DMG palette writes.
///
/// Like `trace_region` this is a byte scan, so a match inside data is
/// reported too. The patch still checks the bytes it replaces.
pub fn find_palette_writes(memory: &[u8], origin: u16, bank: u8, registers: &[u8]) -> Vec<HookSite> {
    let mut sites = Vec::new();
    let mut i = 0;
    while i + PALETTE_WRITE_LEN <= memory.len() {
        match match_palette_write(&memory[i..], registers) {
            Some((_, register)) => {
                let address = origin + i as u16;
                sites.push(HookSite::palette_write(
                    &format!("palette_write_{:02X}_{:04X}", bank, address),
                    BankedAddress::new(bank, address),
                    register,
                ));
                i += PALETTE_WRITE_LEN;
            }
            None => i += 1,
        }
    }
    debug!("Bank {:02X}: {} DMG palette writes", bank, sites.len());
    sites
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSite {
    pub name: String,
    pub at: BankedAddress,
    pub phase: HookPhase,
    pub safety: HookSafety,
    pub kind: HookKind,
}

impl HookSite {
    pub fn splice(name: &str, address: u16, phase: HookPhase, len: usize, strategy: SpliceStrategy) -> Self {
        HookSite {
            name: name.to_string(),
            at: BankedAddress::new(0, address),
            phase,
            safety: HookSafety::Safe,
            kind: HookKind::Splice { len, strategy },
        }
    }

    pub fn call_site(name: &str, address: u16, phase: HookPhase) -> Self {
        HookSite {
            name: name.to_string(),
            at: BankedAddress::new(0, address),
            phase,
            safety: HookSafety::Safe,
            kind: HookKind::CallSite,
        }
    }

    pub fn palette_write(name: &str, at: BankedAddress, register: u8) -> Self {
        HookSite {
            name: name.to_string(),
            at,
            phase: HookPhase::PaletteWrite,
            safety: HookSafety::Safe,
            kind: HookKind::PaletteWrite { register },
        }
    }

    pub fn unsafe_site(mut self) -> Self {
        self.safety = HookSafety::Unsafe;
        self
    }
}

impl Display for HookSite {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let kind = match self.kind {
            HookKind::Splice { len, strategy } => format!("splice {} bytes, {:?}", len, strategy),
            HookKind::CallSite => "call site".to_string(),
            HookKind::PaletteWrite { register } => format!("DMG palette write FF{:02X}", register),
        };
        write!(
            f,
            "{} @ {} ({}, {}, {:?})",
            self.name, self.at, self.phase, kind, self.safety
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HookCatalogue {
    sites: Vec<HookSite>,
}

impl HookCatalogue {
    pub fn new(sites: Vec<HookSite>) -> Self {
        HookCatalogue { sites }
    }

    pub fn sites(&self) -> &[HookSite] {
        &self.sites
    }

    pub fn push(&mut self, site: HookSite) {
        self.sites.push(site);
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Least risky site for `phase`. Declaration order breaks ties.
    pub fn select(&self, phase: HookPhase, allow_unsafe: bool) -> Result<&HookSite, PatchError> {
        let site = self
            .sites
            .iter()
            .filter(|s| s.phase == phase)
            .filter(|s| allow_unsafe || s.safety == HookSafety::Safe)
            .min_by_key(|s| s.safety)
            .ok_or_else(|| PatchError::NoHookForPhase(phase.to_string()))?;

        if site.safety == HookSafety::Unsafe {
            warn!("Using unsafe hook {}", site);
        } else {
            debug!("Selected hook {}", site);
        }
        Ok(site)
    }

    /// Every usable site for `phase`, in declaration order
    pub fn select_all(&self, phase: HookPhase, allow_unsafe: bool) -> Vec<&HookSite> {
        self.sites
            .iter()
            .filter(|s| s.phase == phase)
            .filter(|s| {
                if s.safety == HookSafety::Safe {
                    return true;
                }
                if allow_unsafe {
                    warn!("Using unsafe hook {}", s);
                } else {
                    debug!("Skipping unsafe hook {}", s);
                }
                allow_unsafe
            })
            .collect()
    }

    /// Add the palette writes found in `banks` that are not already listed.
    /// Returns how many were added.
    pub fn discover_palette_writes(
        &mut self,
        rom: &RomImage,
        banks: &[u8],
        registers: &[u8],
    ) -> Result<usize, PatchError> {
        let mut added = 0;
        for bank in banks {
            let (memory, origin) = rom.bank(*bank)?;
            for site in find_palette_writes(memory, origin, *bank, registers) {
                if self.sites.iter().any(|s| s.at == site.at) {
                    continue;
                }
                self.sites.push(site);
                added += 1;
            }
        }
        debug!("Discovered {} palette write sites", added);
        Ok(added)
    }

    /// Demote spliced sites with more than one caller in `graph` to unsafe
    pub fn refine_with(&mut self, graph: &CallGraph) {
        for site in self.sites.iter_mut() {
            if !matches!(site.kind, HookKind::Splice { .. }) || site.safety == HookSafety::Unsafe {
                continue;
            }
            let callers = graph.callers_of(site.at.address);
            if callers.len() > 1 {
                warn!(
                    "Hook {} has {} callers ({}), marking unsafe",
                    site.name,
                    callers.len(),
                    callers
                        .iter()
                        .map(|c| format!("{:#06x}", c))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                site.safety = HookSafety::Unsafe;
            }
        }
    }

    /// Sites found in Penta Dragon (J)
    pub fn penta_dragon() -> Self {
        HookCatalogue::new(vec![
            HookSite::splice("boot_entry", 0x0150, HookPhase::Boot, 16, SpliceStrategy::Stub),
            HookSite::splice("input_handler", 0x0824, HookPhase::InputPoll, 46, SpliceStrategy::InPlace),
            HookSite::call_site("vblank_dma_call", 0x06D5, HookPhase::PostDma),
            HookSite::splice("level_load", 0x3B69, HookPhase::LevelLoad, 24, SpliceStrategy::InPlace)
                .unsafe_site(),
        ])
    }
}

/// Penta Dragon turns the LCD off inside its VBlank wait, which corrupts
/// VRAM bank 1 on CGB hardware. `LDH A,[FF40]; AND 7F; LDH [FF40],A`
pub fn penta_dragon_lcd_off_patch() -> NopPatch {
    NopPatch {
        address: BankedAddress::new(0, 0x0073),
        len: 6,
        expect: Some(vec![0xF0, 0x40, 0xE6, 0x7F, 0xE0, 0x40]),
    }
}
