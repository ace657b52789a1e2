//! TOML plan files
//!
//! A plan file names the game (for its built-in hook sites), the free
//! regions, the palettes and the OAM rewrite. Everything is checked when it
//! is turned into a `PlanRequest`, so a config that loads but cannot be
//! planned reports a `PatchError::Config` naming the offending field.

use crate::codegen::oam::{VisibleRange, DMA_ROUTINE, SPRITE_COUNT};
use crate::codegen::trampoline::BankRestore;
use crate::error::PatchError;
use crate::free_space::FreeRegion;
use crate::header::{CGB_COMPATIBLE, CGB_ONLY};
use crate::hooks::{penta_dragon_lcd_off_patch, HookCatalogue, HookPhase, HookSite, SpliceStrategy};
use crate::palette::{parse_color, Palette, PaletteSet, TileLookupTable, COLORS_PER_PALETTE, PALETTES_PER_SET};
use crate::planner::{BufferTargeting, NopPatch, OamRequest, OamSelection, PaletteWriteRequest, PlanRequest};
use crate::rom::BankedAddress;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Boot,
    InputPoll,
    PostDma,
    LevelLoad,
    PaletteWrite,
}

impl From<PhaseName> for HookPhase {
    fn from(name: PhaseName) -> Self {
        match name {
            PhaseName::Boot => HookPhase::Boot,
            PhaseName::InputPoll => HookPhase::InputPoll,
            PhaseName::PostDma => HookPhase::PostDma,
            PhaseName::LevelLoad => HookPhase::LevelLoad,
            PhaseName::PaletteWrite => HookPhase::PaletteWrite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyName {
    InPlace,
    Stub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKindName {
    Splice,
    CallSite,
    PaletteWrite,
}

/// DMG palette registers by their hardware names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmgRegister {
    Bgp,
    Obp0,
    Obp1,
}

impl DmgRegister {
    /// `LDH` operand
    pub fn port(self) -> u8 {
        match self {
            DmgRegister::Bgp => 0x47,
            DmgRegister::Obp0 => 0x48,
            DmgRegister::Obp1 => 0x49,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OamMode {
    Fixed,
    TileRange,
    Lookup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// `bank:addr` in hex
    pub start: String,
    pub len: usize,
    #[serde(default = "default_pad")]
    pub pad: u8,
}

fn default_pad() -> u8 {
    0xFF
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaletteEntry {
    pub colors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PalettesConfig {
    #[serde(default = "default_true")]
    pub at_boot: bool,
    #[serde(default)]
    pub at_hook: bool,
    #[serde(default)]
    pub background: Vec<PaletteEntry>,
    #[serde(default)]
    pub object: Vec<PaletteEntry>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRangeConfig {
    pub first: u8,
    pub last: u8,
    pub palette: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OamConfig {
    pub mode: OamMode,
    /// Palette for `fixed` mode
    pub palette: Option<u8>,
    #[serde(default)]
    pub tiles: Vec<TileRangeConfig>,
    /// Shadow OAM tables handed to DMA, if known
    #[serde(default)]
    pub buffers: Vec<String>,
    /// Rewrite every candidate because the DMA source is not known
    #[serde(default)]
    pub unknown_buffer: bool,
    #[serde(default)]
    pub candidates: Vec<String>,
    /// `[min_y, max_y]`; omit to rewrite hidden sprites as well
    pub visible: Option<[u8; 2]>,
    pub sprite_count: Option<u8>,
    /// Call the DMA routine after rewriting, `true` for the usual FF80
    #[serde(default)]
    pub call_dma: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    pub name: String,
    /// Bank 0 address in hex
    pub address: String,
    pub phase: PhaseName,
    #[serde(default = "default_kind")]
    pub kind: HookKindName,
    #[serde(default)]
    pub len: usize,
    #[serde(default = "default_strategy")]
    pub strategy: StrategyName,
    #[serde(default, rename = "unsafe")]
    pub is_unsafe: bool,
    /// Register written by a `palette_write` site
    pub register: Option<DmgRegister>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaletteWritesConfig {
    /// Banks scanned for palette writes; empty hooks only `[[hooks]]` sites
    #[serde(default = "default_scan_banks")]
    pub banks: Vec<u8>,
    #[serde(default = "default_registers")]
    pub registers: Vec<DmgRegister>,
}

fn default_scan_banks() -> Vec<u8> {
    vec![0]
}

fn default_registers() -> Vec<DmgRegister> {
    vec![DmgRegister::Bgp, DmgRegister::Obp0, DmgRegister::Obp1]
}

fn default_kind() -> HookKindName {
    HookKindName::Splice
}

fn default_strategy() -> StrategyName {
    StrategyName::InPlace
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NopConfig {
    pub address: String,
    pub len: usize,
    /// Expected bytes as hex pairs, e.g. `"F0 40 E6 7F"`
    pub expect: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfig {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Game with a built-in hook catalogue, e.g. `penta_dragon`
    pub game: Option<String>,
    #[serde(default)]
    pub cgb_only: bool,
    #[serde(default = "default_phase")]
    pub phase: PhaseName,
    #[serde(default)]
    pub allow_unsafe: bool,
    /// Bank mapped again after the hook returns
    pub home_bank: Option<u8>,
    /// WRAM byte holding the game's current bank, used instead of `home_bank`
    pub home_shadow: Option<String>,
    /// NOP out the game's LCD-off write in its VBlank wait
    #[serde(default)]
    pub fix_lcd_off: bool,
    pub region: RegionConfig,
    pub home_region: Option<RegionConfig>,
    pub palettes: Option<PalettesConfig>,
    pub oam: Option<OamConfig>,
    /// Re-upload palettes from the game's own DMG palette writes
    pub palette_writes: Option<PaletteWritesConfig>,
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
    #[serde(default)]
    pub nop: Vec<NopConfig>,
    #[serde(default)]
    pub trace: Vec<TraceConfig>,
}

fn default_phase() -> PhaseName {
    PhaseName::InputPoll
}

fn config_error(msg: String) -> PatchError {
    PatchError::Config(msg)
}

fn parse_u16(text: &str, field: &str) -> Result<u16, PatchError> {
    let address = BankedAddress::parse(text)?;
    if address.bank != 0 {
        return Err(config_error(format!("{}: '{}' must be a plain address", field, text)));
    }
    Ok(address.address)
}

fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, PatchError> {
    text.split_whitespace()
        .map(|pair| {
            u8::from_str_radix(pair, 16).map_err(|_| config_error(format!("'{}' is not a hex byte", pair)))
        })
        .collect()
}

fn region(config: &RegionConfig) -> Result<FreeRegion, PatchError> {
    Ok(FreeRegion::new(BankedAddress::parse(&config.start)?, config.len, config.pad))
}

fn palettes(entries: &[PaletteEntry], which: &str) -> Result<Vec<Palette>, PatchError> {
    if entries.len() > PALETTES_PER_SET {
        return Err(config_error(format!(
            "{} palettes: {} given, at most {} fit",
            which,
            entries.len(),
            PALETTES_PER_SET
        )));
    }
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            if entry.colors.len() != COLORS_PER_PALETTE {
                return Err(config_error(format!(
                    "{} palette {} has {} colors, expected {}",
                    which,
                    i,
                    entry.colors.len(),
                    COLORS_PER_PALETTE
                )));
            }
            let mut palette = [0u16; COLORS_PER_PALETTE];
            for (slot, text) in palette.iter_mut().zip(&entry.colors) {
                *slot = parse_color(text)?;
            }
            Ok(palette)
        })
        .collect()
}

impl OamConfig {
    fn selection(&self) -> Result<OamSelection, PatchError> {
        match self.mode {
            OamMode::Fixed => {
                let palette = self
                    .palette
                    .ok_or_else(|| config_error("oam: fixed mode needs 'palette'".to_string()))?;
                Ok(OamSelection::Fixed(palette))
            }
            OamMode::TileRange => match self.tiles.as_slice() {
                [range] => Ok(OamSelection::TileRange {
                    first: range.first,
                    last: range.last,
                    palette: range.palette,
                }),
                _ => Err(config_error(format!(
                    "oam: tile_range mode needs exactly one [[oam.tiles]] entry, found {}",
                    self.tiles.len()
                ))),
            },
            OamMode::Lookup => {
                if self.tiles.is_empty() {
                    return Err(config_error("oam: lookup mode needs [[oam.tiles]] entries".to_string()));
                }
                let mut table = TileLookupTable::new();
                for range in &self.tiles {
                    table.assign(range.first, range.last, range.palette)?;
                }
                debug!("Lookup table assigns {} tiles", table.assigned_count());
                Ok(OamSelection::Lookup(table))
            }
        }
    }

    fn targeting(&self) -> Result<BufferTargeting, PatchError> {
        let parse_all = |texts: &[String], field: &str| -> Result<Vec<u16>, PatchError> {
            texts.iter().map(|t| parse_u16(t, field)).collect()
        };
        match (self.unknown_buffer, self.buffers.is_empty()) {
            (true, true) => Ok(BufferTargeting::Unknown {
                candidates: parse_all(&self.candidates, "oam.candidates")?,
            }),
            (false, false) => Ok(BufferTargeting::Declared(parse_all(&self.buffers, "oam.buffers")?)),
            (true, false) => Err(config_error(
                "oam: 'buffers' and 'unknown_buffer' are mutually exclusive".to_string(),
            )),
            (false, true) => Err(config_error(
                "oam: declare 'buffers' or set 'unknown_buffer = true'".to_string(),
            )),
        }
    }

    fn request(&self) -> Result<OamRequest, PatchError> {
        let mut request = OamRequest::new(self.selection()?, self.targeting()?);
        request.visibility = self.visible.map(|[min_y, max_y]| VisibleRange { min_y, max_y });
        request.sprite_count = self.sprite_count.unwrap_or(SPRITE_COUNT);
        if self.call_dma {
            request.call_dma = Some(DMA_ROUTINE);
        }
        Ok(request)
    }
}

impl PlanConfig {
    pub fn from_toml(text: &str) -> Result<Self, PatchError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, PatchError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Built-in sites for `game` followed by the `[[hooks]]` entries
    pub fn catalogue(&self) -> Result<HookCatalogue, PatchError> {
        let mut catalogue = match self.game.as_deref() {
            Some("penta_dragon") => HookCatalogue::penta_dragon(),
            Some(other) => return Err(config_error(format!("unknown game '{}'", other))),
            None => HookCatalogue::default(),
        };
        for hook in &self.hooks {
            let phase = HookPhase::from(hook.phase);
            if (hook.kind == HookKindName::PaletteWrite) != (phase == HookPhase::PaletteWrite) {
                return Err(config_error(format!(
                    "hooks.{}: kind 'palette_write' goes with phase 'palette_write'",
                    hook.name
                )));
            }
            let field = format!("hooks.{}.address", hook.name);
            let site = match hook.kind {
                // palette writes may sit in any bank
                HookKindName::PaletteWrite => HookSite::palette_write(
                    &hook.name,
                    BankedAddress::parse(&hook.address)?,
                    hook.register.unwrap_or(DmgRegister::Bgp).port(),
                ),
                HookKindName::CallSite => HookSite::call_site(&hook.name, parse_u16(&hook.address, &field)?, phase),
                HookKindName::Splice => {
                    if hook.len == 0 {
                        return Err(config_error(format!("hooks.{}: splice needs 'len'", hook.name)));
                    }
                    let strategy = match hook.strategy {
                        StrategyName::InPlace => SpliceStrategy::InPlace,
                        StrategyName::Stub => SpliceStrategy::Stub,
                    };
                    HookSite::splice(&hook.name, parse_u16(&hook.address, &field)?, phase, hook.len, strategy)
                }
            };
            catalogue.push(if hook.is_unsafe { site.unsafe_site() } else { site });
        }
        if catalogue.is_empty() && self.palette_writes.is_none() {
            return Err(config_error(
                "no hook sites: set 'game', add [[hooks]] or scan for [palette_writes]".to_string(),
            ));
        }
        Ok(catalogue)
    }

    pub fn request(&self) -> Result<PlanRequest, PatchError> {
        let mut request = PlanRequest::new(region(&self.region)?);
        request.home_region = self.home_region.as_ref().map(region).transpose()?;
        request.phase = self.phase.into();
        request.allow_unsafe = self.allow_unsafe;
        request.cgb_flag = if self.cgb_only { CGB_ONLY } else { CGB_COMPATIBLE };

        request.home = match (self.home_bank, &self.home_shadow) {
            (Some(_), Some(_)) => {
                return Err(config_error(
                    "'home_bank' and 'home_shadow' are mutually exclusive".to_string(),
                ))
            }
            (Some(bank), None) => BankRestore::Fixed(bank),
            (None, Some(shadow)) => BankRestore::Shadow(parse_u16(shadow, "home_shadow")?),
            (None, None) => BankRestore::Fixed(1),
        };

        if let Some(config) = &self.palettes {
            let background = palettes(&config.background, "background")?;
            let object = palettes(&config.object, "object")?;
            request.palettes = Some(PaletteSet::new(&background, &object));
            request.palettes_at_boot = config.at_boot;
            request.palettes_at_hook = config.at_hook;
        }
        request.oam = self.oam.as_ref().map(OamConfig::request).transpose()?;
        request.palette_writes = self.palette_writes.as_ref().map(|writes| PaletteWriteRequest {
            scan_banks: writes.banks.clone(),
            registers: writes.registers.iter().map(|r| r.port()).collect(),
        });

        if self.fix_lcd_off {
            if self.game.as_deref() != Some("penta_dragon") {
                return Err(config_error("'fix_lcd_off' is only known for penta_dragon".to_string()));
            }
            request.extra_nops.push(penta_dragon_lcd_off_patch());
        }
        for nop in &self.nop {
            request.extra_nops.push(NopPatch {
                address: BankedAddress::parse(&nop.address)?,
                len: nop.len,
                expect: nop.expect.as_deref().map(parse_hex_bytes).transpose()?,
            });
        }
        for trace in &self.trace {
            request.trace_regions.push((
                parse_u16(&trace.start, "trace.start")?,
                parse_u16(&trace.end, "trace.end")?,
            ));
        }
        Ok(request)
    }
}
