//! Patch planner: turns a request into a complete, validated list of byte patches
//!
//! Planning never touches the ROM. It picks hook sites, lays the injected
//! data and code out in the free region, links everything, builds the
//! trampolines and checks that all of it fits. The patcher then only has to
//! write what the plan says.

use crate::codegen::assembler::{Assembled, Assembler, StackReg};
use crate::codegen::boot::{entry_redirect, BootHook, BootPlacement};
use crate::codegen::oam::{OamRewriter, PaletteSelection, VisibleRange, SPRITE_COUNT};
use crate::codegen::palette_loader::emit_palette_upload;
use crate::codegen::palette_write::{palette_write_call, PaletteWriteWrapper};
use crate::codegen::trampoline::{
    BankRestore, CallTarget, Displaced, DisplacedPlacement, Trampoline, TrampolineExit,
};
use crate::disassembler::CallGraph;
use crate::error::{hex_bytes, PatchError};
use crate::free_space::{verify_region, FreeRegion};
use crate::header::{CGB_COMPATIBLE, CGB_ONLY};
use crate::hooks::{
    match_palette_write, HookCatalogue, HookKind, HookPhase, HookSafety, HookSite, SpliceStrategy,
    DMG_PALETTE_REGISTERS, PALETTE_WRITE_LEN,
};
use crate::instruction::Instruction;
use crate::opcode_tables::Flow;
use crate::palette::{PaletteSet, TileLookupTable};
use crate::patcher::{validate_patches, Patch};
use crate::rom::{BankedAddress, RomImage, SWITCHABLE_WINDOW, WINDOW_END};
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::fmt::{Display, Error, Formatter};

pub const BG_PALETTES: &str = "bg_palettes";
pub const OBJ_PALETTES: &str = "obj_palettes";
pub const TILE_LOOKUP: &str = "tile_lookup";
pub const BOOT_LOADER: &str = "boot_loader";
pub const FRAME_ENTRY: &str = "frame_entry";
pub const BOOT_STUB: &str = "boot_stub";
pub const FRAME_STUB: &str = "frame_stub";
/// Banked palette upload called from palette write wrappers
pub const PALETTE_UPLOAD: &str = "palette_upload";
const OAM_REWRITER: &str = "oam_rewriter";

/// Shadow OAM tables the game is known or suspected to fill
pub const DEFAULT_SHADOW_BUFFERS: [u16; 2] = [0xC000, 0xC100];

/// Bytes an `entry_redirect` needs at a spliced site
const REDIRECT_LEN: usize = 3;

/// Run of bytes to overwrite with NOPs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NopPatch {
    pub address: BankedAddress,
    pub len: usize,
    /// Bytes that must be there before patching
    pub expect: Option<Vec<u8>>,
}

/// Which sprite tables the OAM rewriter should touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferTargeting {
    /// The table the game hands to DMA is known
    Declared(Vec<u16>),
    /// Not known; rewrite every candidate
    Unknown { candidates: Vec<u16> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OamSelection {
    Fixed(u8),
    TileRange { first: u8, last: u8, palette: u8 },
    Lookup(TileLookupTable),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OamRequest {
    pub selection: OamSelection,
    pub visibility: Option<VisibleRange>,
    pub targeting: BufferTargeting,
    pub sprite_count: u8,
    /// Call the DMA routine after rewriting
    pub call_dma: Option<u16>,
}

impl OamRequest {
    pub fn new(selection: OamSelection, targeting: BufferTargeting) -> Self {
        OamRequest {
            selection,
            visibility: Some(VisibleRange::default()),
            targeting,
            sprite_count: SPRITE_COUNT,
            call_dma: None,
        }
    }
}

/// Re-upload the CGB palettes whenever the game writes a DMG palette register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteWriteRequest {
    /// Banks scanned for `LD A,n; LDH [rr],A`; empty uses only listed sites
    pub scan_banks: Vec<u8>,
    /// Registers to look for, as `LDH` operands
    pub registers: Vec<u8>,
}

impl Default for PaletteWriteRequest {
    fn default() -> Self {
        PaletteWriteRequest {
            scan_banks: vec![0],
            registers: DMG_PALETTE_REGISTERS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub palettes: Option<PaletteSet>,
    /// Upload palettes once from the boot hook
    pub palettes_at_boot: bool,
    /// Upload palettes on every run of the frame hook
    pub palettes_at_hook: bool,
    pub oam: Option<OamRequest>,
    pub palette_writes: Option<PaletteWriteRequest>,
    /// Phase of the per-frame hook
    pub phase: HookPhase,
    pub allow_unsafe: bool,
    /// Banked region for injected data and code
    pub region: FreeRegion,
    /// Bank 0 region for stubs, needed by stub and call site hooks
    pub home_region: Option<FreeRegion>,
    /// How hooks re-map the game's bank after the injected call
    pub home: BankRestore,
    pub extra_nops: Vec<NopPatch>,
    pub cgb_flag: u8,
    /// Bank 0 code ranges scanned for callers of spliced hook sites
    pub trace_regions: Vec<(u16, u16)>,
}

impl PlanRequest {
    pub fn new(region: FreeRegion) -> Self {
        PlanRequest {
            palettes: None,
            palettes_at_boot: true,
            palettes_at_hook: false,
            oam: None,
            palette_writes: None,
            phase: HookPhase::InputPoll,
            allow_unsafe: false,
            region,
            home_region: None,
            home: BankRestore::Fixed(1),
            extra_nops: Vec::new(),
            cgb_flag: CGB_COMPATIBLE,
            trace_regions: Vec::new(),
        }
    }

    fn wants_boot(&self) -> bool {
        self.palettes.is_some() && self.palettes_at_boot
    }

    fn wants_frame(&self) -> bool {
        self.oam.is_some() || (self.palettes.is_some() && self.palettes_at_hook)
    }

    fn wants_palette_writes(&self) -> bool {
        self.palettes.is_some() && self.palette_writes.is_some()
    }

    fn validate(&self) -> Result<(), PatchError> {
        if self.cgb_flag != CGB_COMPATIBLE && self.cgb_flag != CGB_ONLY {
            return Err(PatchError::InvalidParameter(format!(
                "CGB flag {:#04x} must be 0x80 or 0xC0",
                self.cgb_flag
            )));
        }
        if self.palette_writes.is_some() && self.palettes.is_none() {
            return Err(PatchError::InvalidParameter(
                "palette write hooks need palettes to upload".to_string(),
            ));
        }
        if !self.wants_boot()
            && !self.wants_frame()
            && !self.wants_palette_writes()
            && self.extra_nops.is_empty()
        {
            return Err(PatchError::InvalidParameter(
                "nothing to inject: no palettes, OAM rewrite or NOP patches".to_string(),
            ));
        }
        if self.wants_frame() && matches!(self.phase, HookPhase::Boot | HookPhase::PaletteWrite) {
            return Err(PatchError::InvalidParameter(format!(
                "per-frame work cannot run from the {} phase",
                self.phase
            )));
        }
        if self.region.start.bank == 0 || !self.region.start.in_switchable_window() {
            return Err(PatchError::InvalidParameter(format!(
                "free region {} must be in a switchable bank",
                self.region
            )));
        }
        if let Some(home) = &self.home_region {
            if home.start.bank != 0 || home.start.address >= SWITCHABLE_WINDOW {
                return Err(PatchError::InvalidParameter(format!(
                    "home region {} must be in bank 0",
                    home
                )));
            }
        }
        Ok(())
    }
}

/// One block placed in a free region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub name: String,
    pub at: BankedAddress,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanNote {
    /// The DMA source is unknown so every candidate buffer is rewritten
    ConservativeBufferTargeting { candidates: Vec<u16> },
    UnsafeHook(String),
    /// The hook left `nops` bytes of its slot as NOPs
    HookPadding { hook: String, nops: usize },
    /// A palette write inside bytes another patch already owns was left alone
    SkippedPaletteWrite(String),
}

impl Display for PlanNote {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        match self {
            PlanNote::ConservativeBufferTargeting { candidates } => write!(
                f,
                "OAM source unknown, rewriting all of: {}",
                candidates
                    .iter()
                    .map(|c| format!("{:#06x}", c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            PlanNote::UnsafeHook(name) => write!(f, "hook '{}' is marked unsafe", name),
            PlanNote::HookPadding { hook, nops } => {
                write!(f, "hook '{}' padded with {} NOPs", hook, nops)
            }
            PlanNote::SkippedPaletteWrite(name) => {
                write!(f, "palette write '{}' overlaps another patch, left unhooked", name)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPlan {
    pub patches: Vec<Patch>,
    pub layout: Vec<Placement>,
    pub symbols: IndexMap<String, u16>,
    /// Per-frame hook
    pub hook: Option<HookSite>,
    pub boot_hook: Option<HookSite>,
    /// Every DMG palette write redirected through a wrapper
    pub palette_hooks: Vec<HookSite>,
    pub notes: Vec<PlanNote>,
    pub cgb_flag: u8,
}

impl PatchPlan {
    pub fn empty(cgb_flag: u8) -> Self {
        PatchPlan {
            patches: Vec::new(),
            layout: Vec::new(),
            symbols: IndexMap::new(),
            hook: None,
            boot_hook: None,
            palette_hooks: Vec::new(),
            notes: Vec::new(),
            cgb_flag,
        }
    }

    /// Bytes placed in free regions
    pub fn injected_len(&self) -> usize {
        self.layout.iter().map(|p| p.len).sum()
    }

    pub fn placement(&self, name: &str) -> Option<&Placement> {
        self.layout.iter().find(|p| p.name == name)
    }

    pub fn patch(&self, label: &str) -> Option<&Patch> {
        self.patches.iter().find(|p| p.label == label)
    }
}

impl Display for PatchPlan {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        if let Some(hook) = &self.boot_hook {
            writeln!(f, "Boot hook:  {}", hook)?;
        }
        if let Some(hook) = &self.hook {
            writeln!(f, "Frame hook: {}", hook)?;
        }
        for hook in &self.palette_hooks {
            writeln!(f, "Palette write hook: {}", hook)?;
        }
        writeln!(f, "Layout ({} bytes injected):", self.injected_len())?;
        for placement in &self.layout {
            writeln!(
                f,
                "  {}  {:<14} {} bytes",
                placement.at, placement.name, placement.len
            )?;
        }
        writeln!(f, "Patches:")?;
        for patch in &self.patches {
            writeln!(f, "  {}", patch)?;
        }
        for note in &self.notes {
            writeln!(f, "Note: {}", note)?;
        }
        write!(f, "CGB flag: {:#04x}", self.cgb_flag)
    }
}

/// How the chosen site hands over control
#[derive(Debug, Clone)]
enum HookPrep {
    /// Hook code sits at the site; the covered instructions move into the banked routine
    InPlace { covered: usize, displaced: Vec<u8> },
    /// Site jumps to a bank 0 stub that runs the covered instructions itself
    Stub {
        covered: usize,
        displaced: Vec<u8>,
        exit: TrampolineExit,
    },
    /// CALL operand retargeted to a stub that tail-jumps to the original target
    CallSite { original_target: u16 },
}

impl HookPrep {
    fn displaced_in_bank(&self) -> &[u8] {
        match self {
            HookPrep::InPlace { displaced, .. } => displaced,
            _ => &[],
        }
    }
}

/// A DMG palette write and the wrapper that takes its place
#[derive(Debug, Clone)]
struct PaletteWritePrep {
    site: HookSite,
    wrapper: PaletteWriteWrapper,
}

/// Where relocated instructions will execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunsIn {
    /// Inside the banked routine, called with another bank mapped
    BankedCall,
    /// In a bank 0 stub, at the same call depth as the original code
    HomeStub,
}

/// Whole instructions covering at least `min_len` bytes of a hook site
struct Cover {
    instructions: Vec<Instruction>,
    len: usize,
}

enum Block {
    Data { name: String, bytes: Vec<u8> },
    Code(Assembled),
}

impl Block {
    fn name(&self) -> &str {
        match self {
            Block::Data { name, .. } => name,
            Block::Code(code) => &code.name,
        }
    }

    fn len(&self) -> usize {
        match self {
            Block::Data { bytes, .. } => bytes.len(),
            Block::Code(code) => code.len(),
        }
    }

    fn link(&self, base: u16, symbols: &IndexMap<String, u16>) -> Result<Vec<u8>, PatchError> {
        match self {
            Block::Data { bytes, .. } => Ok(bytes.clone()),
            Block::Code(code) => code.link(base, symbols),
        }
    }
}

pub struct PatchPlanner {
    catalogue: HookCatalogue,
}

impl PatchPlanner {
    pub fn new(catalogue: HookCatalogue) -> Self {
        PatchPlanner { catalogue }
    }

    pub fn catalogue(&self) -> &HookCatalogue {
        &self.catalogue
    }

    pub fn plan(&self, rom: &RomImage, request: &PlanRequest) -> Result<PatchPlan, PatchError> {
        request.validate()?;
        let mut plan = PatchPlan::empty(request.cgb_flag);

        let catalogue = self.refined_catalogue(rom, request)?;
        if request.wants_boot() {
            plan.boot_hook = Some(catalogue.select(HookPhase::Boot, request.allow_unsafe)?.clone());
        }
        if request.wants_frame() {
            plan.hook = Some(catalogue.select(request.phase, request.allow_unsafe)?.clone());
        }
        for site in plan.boot_hook.iter().chain(plan.hook.iter()) {
            if site.safety == HookSafety::Unsafe {
                plan.notes.push(PlanNote::UnsafeHook(site.name.clone()));
            }
        }

        let boot_prep = match &plan.boot_hook {
            Some(site) => Some(self.prepare_boot(rom, site, request)?),
            None => None,
        };
        let frame_prep = match &plan.hook {
            Some(site) => Some(self.prepare_frame(rom, site, request)?),
            None => None,
        };
        let palette_preps = if request.wants_palette_writes() {
            let mut claimed = Vec::new();
            if let (Some(site), Some(prep)) = (&plan.boot_hook, &boot_prep) {
                claimed.push(claimed_span(site, prep)?);
            }
            if let (Some(site), Some(prep)) = (&plan.hook, &frame_prep) {
                claimed.push(claimed_span(site, prep)?);
            }
            for nop in &request.extra_nops {
                claimed.push((nop.address.to_offset()?, nop.len));
            }
            self.prepare_palette_writes(rom, &catalogue, request, &claimed, &mut plan)?
        } else {
            Vec::new()
        };

        // Banked region: data first, then code
        let mut blocks = Vec::new();
        if let Some(palettes) = &request.palettes {
            blocks.push(Block::Data {
                name: BG_PALETTES.to_string(),
                bytes: palettes.background.as_bytes().to_vec(),
            });
            blocks.push(Block::Data {
                name: OBJ_PALETTES.to_string(),
                bytes: palettes.object.as_bytes().to_vec(),
            });
        }
        if let Some(OamRequest {
            selection: OamSelection::Lookup(table),
            ..
        }) = &request.oam
        {
            blocks.push(Block::Data {
                name: TILE_LOOKUP.to_string(),
                bytes: table.as_bytes().to_vec(),
            });
        }
        if let Some(prep) = &boot_prep {
            blocks.push(Block::Code(self.boot_loader(prep)?));
        }
        if let Some(prep) = &frame_prep {
            blocks.push(Block::Code(self.frame_entry(prep, request, &mut plan.notes)?));
        }
        if !palette_preps.is_empty() {
            blocks.push(Block::Code(self.palette_upload()?));
        }

        let available = verify_region(rom, &request.region)?;
        let region_blocks = self.place(&blocks, &request.region, available, &mut plan)?;

        // Bank 0 stubs, linked against the banked symbols
        let mut stubs = Vec::new();
        if let (Some(HookPrep::Stub { displaced, exit, .. }), Some(site)) = (&boot_prep, &plan.boot_hook) {
            stubs.push(Block::Code(self.boot_stub(site, displaced, *exit, request)?));
        }
        if let Some(prep) = &frame_prep {
            match prep {
                HookPrep::Stub { displaced, exit, .. } => {
                    stubs.push(Block::Code(self.frame_stub(Some(displaced), *exit, request)?));
                }
                HookPrep::CallSite { original_target } => {
                    stubs.push(Block::Code(self.frame_stub(
                        None,
                        TrampolineExit::JumpTo(*original_target),
                        request,
                    )?));
                }
                HookPrep::InPlace { .. } => {}
            }
        }
        for prep in &palette_preps {
            let name = prep.wrapper.name();
            if stubs.iter().any(|b| b.name() == name) {
                continue;
            }
            let mut asm = Assembler::new(&name);
            prep.wrapper.emit(&mut asm)?;
            stubs.push(Block::Code(asm.finish()?));
        }
        let stub_blocks = if stubs.is_empty() {
            Vec::new()
        } else {
            let home = request.home_region.as_ref().ok_or_else(|| {
                PatchError::InvalidParameter(
                    "stub, call site and palette write hooks need a bank 0 home region".to_string(),
                )
            })?;
            let home_available = verify_region(rom, home)?;
            self.place(&stubs, home, home_available, &mut plan)?
        };

        for (block, placement) in blocks.iter().chain(stubs.iter()).zip(
            region_blocks.iter().chain(stub_blocks.iter()),
        ) {
            let bytes = block.link(placement.at.address, &plan.symbols)?;
            plan.patches
                .push(Patch::from_rom(rom, &placement.name, placement.at.to_offset()?, bytes)?);
        }
        plan.layout = region_blocks.into_iter().chain(stub_blocks).collect();

        if let (Some(site), Some(prep)) = (&plan.boot_hook, &boot_prep) {
            let patch = self.boot_site_patch(rom, site, prep, request, &plan.symbols, &mut plan.notes)?;
            plan.patches.push(patch);
        }
        if let (Some(site), Some(prep)) = (&plan.hook, &frame_prep) {
            let patch = self.frame_site_patch(rom, site, prep, request, &plan.symbols, &mut plan.notes)?;
            plan.patches.push(patch);
        }

        for prep in &palette_preps {
            let wrapper = symbol(&plan.symbols, &prep.wrapper.name())?;
            plan.patches.push(Patch::from_rom(
                rom,
                &prep.site.name,
                prep.site.at.to_offset()?,
                palette_write_call(wrapper),
            )?);
        }
        plan.palette_hooks = palette_preps.into_iter().map(|p| p.site).collect();

        for (i, nop) in request.extra_nops.iter().enumerate() {
            plan.patches.push(nop_patch(rom, i, nop)?);
        }

        validate_patches(&plan.patches, rom.len())?;

        info!(
            "Planned {} patches, {} bytes injected into {}",
            plan.patches.len(),
            plan.injected_len(),
            request.region
        );
        Ok(plan)
    }

    fn refined_catalogue(&self, rom: &RomImage, request: &PlanRequest) -> Result<HookCatalogue, PatchError> {
        let mut catalogue = self.catalogue.clone();
        if let Some(writes) = &request.palette_writes {
            catalogue.discover_palette_writes(rom, &writes.scan_banks, &writes.registers)?;
        }
        if request.trace_regions.is_empty() {
            return Ok(catalogue);
        }
        let disasm = rom.disassembler(0)?;
        let mut graph = CallGraph::default();
        for (start, end) in &request.trace_regions {
            graph.merge(disasm.trace_region(*start, *end));
        }
        catalogue.refine_with(&graph);
        Ok(catalogue)
    }

    /// Assign consecutive addresses in `region` and record the symbols
    fn place(
        &self,
        blocks: &[Block],
        region: &FreeRegion,
        available: usize,
        plan: &mut PatchPlan,
    ) -> Result<Vec<Placement>, PatchError> {
        let needed: usize = blocks.iter().map(|b| b.len()).sum();
        if needed > available {
            return Err(PatchError::InsufficientFreeSpace {
                region: region.to_string(),
                needed,
                available,
            });
        }

        let mut placements = Vec::new();
        let mut address = region.start.address;
        for block in blocks {
            debug!("Placing {} ({} bytes) at {:02X}:{:04X}", block.name(), block.len(), region.start.bank, address);
            plan.symbols.insert(block.name().to_string(), address);
            placements.push(Placement {
                name: block.name().to_string(),
                at: BankedAddress::new(region.start.bank, address),
                len: block.len(),
            });
            address += block.len() as u16;
        }
        Ok(placements)
    }

    fn site_trampoline(&self, request: &PlanRequest) -> Trampoline {
        let mut trampoline = Trampoline::new(
            request.region.start.bank,
            CallTarget::Symbol(FRAME_ENTRY.to_string()),
            request.home,
        );
        trampoline.exit = TrampolineExit::FallThrough;
        trampoline
    }

    fn boot_hook(&self, request: &PlanRequest, placement: BootPlacement, displaced: Vec<u8>, resume: u16) -> BootHook {
        BootHook {
            loader_bank: request.region.start.bank,
            loader: CallTarget::Symbol(BOOT_LOADER.to_string()),
            restore: request.home,
            displaced,
            resume,
            placement,
        }
    }

    fn prepare_boot(&self, rom: &RomImage, site: &HookSite, request: &PlanRequest) -> Result<HookPrep, PatchError> {
        match site.kind {
            HookKind::Splice {
                len,
                strategy: SpliceStrategy::InPlace,
            } => {
                let min_len = self.boot_hook(request, BootPlacement::JumpBack, Vec::new(), 0).size()?;
                let cover = cover_site(rom, site, min_len, len)?;
                relocate(&cover, site.at.address, RunsIn::BankedCall)?;
                Ok(HookPrep::InPlace {
                    covered: cover.len,
                    displaced: cover_bytes(&cover),
                })
            }
            HookKind::Splice {
                len,
                strategy: SpliceStrategy::Stub,
            } => {
                let cover = cover_site(rom, site, REDIRECT_LEN, len)?;
                let (displaced, exit) = relocate(&cover, site.at.address, RunsIn::HomeStub)?;
                if exit == TrampolineExit::Return {
                    return Err(PatchError::DisplacedNotRelocatable {
                        address: site.at.address,
                        reason: "boot entry returns inside the hooked span".to_string(),
                    });
                }
                Ok(HookPrep::Stub {
                    covered: cover.len,
                    displaced,
                    exit,
                })
            }
            HookKind::CallSite | HookKind::PaletteWrite { .. } => Err(PatchError::InvalidParameter(
                format!("boot hook {} must be a splice site", site.name),
            )),
        }
    }

    fn prepare_frame(&self, rom: &RomImage, site: &HookSite, request: &PlanRequest) -> Result<HookPrep, PatchError> {
        match site.kind {
            HookKind::Splice {
                len,
                strategy: SpliceStrategy::InPlace,
            } => {
                let min_len = self.site_trampoline(request).size()?;
                let cover = cover_site(rom, site, min_len, len)?;
                relocate(&cover, site.at.address, RunsIn::BankedCall)?;
                Ok(HookPrep::InPlace {
                    covered: cover.len,
                    displaced: cover_bytes(&cover),
                })
            }
            HookKind::Splice {
                len,
                strategy: SpliceStrategy::Stub,
            } => {
                let cover = cover_site(rom, site, REDIRECT_LEN, len)?;
                let (displaced, exit) = relocate(&cover, site.at.address, RunsIn::HomeStub)?;
                Ok(HookPrep::Stub {
                    covered: cover.len,
                    displaced,
                    exit,
                })
            }
            HookKind::CallSite => {
                let (memory, origin) = rom.bank(site.at.bank)?;
                let call = Instruction::decode(memory, origin, site.at.address)?;
                match (call.flow, call.target) {
                    (Flow::Call, Some(target)) | (Flow::ConditionalCall, Some(target)) => {
                        debug!("Call site {} targets {:#06x}", site.at, target);
                        Ok(HookPrep::CallSite {
                            original_target: target,
                        })
                    }
                    _ => Err(PatchError::InvalidParameter(format!(
                        "hook {} at {} is '{}', not a CALL",
                        site.name, site.at, call
                    ))),
                }
            }
            HookKind::PaletteWrite { .. } => Err(PatchError::InvalidParameter(format!(
                "hook {} is a palette write site, not a frame hook",
                site.name
            ))),
        }
    }

    /// Check every palette write site and build its wrapper.
    ///
    /// Sites inside `claimed` file spans are skipped with a note.
    fn prepare_palette_writes(
        &self,
        rom: &RomImage,
        catalogue: &HookCatalogue,
        request: &PlanRequest,
        claimed: &[(usize, usize)],
        plan: &mut PatchPlan,
    ) -> Result<Vec<PaletteWritePrep>, PatchError> {
        let mut preps = Vec::new();
        for site in catalogue.select_all(HookPhase::PaletteWrite, request.allow_unsafe) {
            let register = match site.kind {
                HookKind::PaletteWrite { register } => register,
                _ => {
                    return Err(PatchError::InvalidParameter(format!(
                        "hook {} in the palette_write phase must be a palette write site",
                        site.name
                    )))
                }
            };
            let offset = site.at.to_offset()?;
            if claimed
                .iter()
                .any(|(start, len)| offset < start + len && *start < offset + PALETTE_WRITE_LEN)
            {
                warn!("Palette write {} overlaps another patch, skipping", site);
                plan.notes.push(PlanNote::SkippedPaletteWrite(site.name.clone()));
                continue;
            }
            let bytes = rom.read(offset, PALETTE_WRITE_LEN)?;
            let (value, _) = match_palette_write(bytes, &[register]).ok_or_else(|| {
                PatchError::DisplacedNotRelocatable {
                    address: site.at.address,
                    reason: format!(
                        "expected LD A,n; LDH [FF{:02X}],A, found {}",
                        register,
                        hex_bytes(bytes)
                    ),
                }
            })?;
            if site.safety == HookSafety::Unsafe {
                plan.notes.push(PlanNote::UnsafeHook(site.name.clone()));
            }
            // code outside bank 0 runs with its own bank mapped
            let restore = if site.at.bank == 0 {
                request.home
            } else {
                BankRestore::Fixed(site.at.bank)
            };
            preps.push(PaletteWritePrep {
                site: site.clone(),
                wrapper: PaletteWriteWrapper {
                    register,
                    value,
                    loader_bank: request.region.start.bank,
                    loader: CallTarget::Symbol(PALETTE_UPLOAD.to_string()),
                    restore,
                },
            });
        }
        if preps.is_empty() {
            return Err(PatchError::NoHookForPhase(HookPhase::PaletteWrite.to_string()));
        }
        debug!("Hooking {} palette writes", preps.len());
        Ok(preps)
    }

    fn palette_upload(&self) -> Result<Assembled, PatchError> {
        let mut asm = Assembler::new(PALETTE_UPLOAD);
        asm.push(StackReg::AF).push(StackReg::BC).push(StackReg::HL);
        emit_palette_upload(&mut asm, BG_PALETTES, OBJ_PALETTES)?;
        asm.pop(StackReg::HL)
            .pop(StackReg::BC)
            .pop(StackReg::AF)
            .ret();
        asm.finish()
    }

    fn boot_loader(&self, prep: &HookPrep) -> Result<Assembled, PatchError> {
        let mut asm = Assembler::new(BOOT_LOADER);
        asm.raw(prep.displaced_in_bank())
            .push(StackReg::AF)
            .push(StackReg::BC)
            .push(StackReg::HL);
        emit_palette_upload(&mut asm, BG_PALETTES, OBJ_PALETTES)?;
        asm.pop(StackReg::HL)
            .pop(StackReg::BC)
            .pop(StackReg::AF)
            .ret();
        asm.finish()
    }

    fn frame_entry(
        &self,
        prep: &HookPrep,
        request: &PlanRequest,
        notes: &mut Vec<PlanNote>,
    ) -> Result<Assembled, PatchError> {
        let mut asm = Assembler::new(FRAME_ENTRY);
        asm.raw(prep.displaced_in_bank())
            .push(StackReg::AF)
            .push(StackReg::BC)
            .push(StackReg::DE)
            .push(StackReg::HL);
        if request.palettes.is_some() && request.palettes_at_hook {
            emit_palette_upload(&mut asm, BG_PALETTES, OBJ_PALETTES)?;
        }
        if request.oam.is_some() {
            asm.call_label(OAM_REWRITER);
        }
        asm.pop(StackReg::HL)
            .pop(StackReg::DE)
            .pop(StackReg::BC)
            .pop(StackReg::AF)
            .ret();

        if let Some(oam) = &request.oam {
            asm.label(OAM_REWRITER);
            oam_rewriter(oam, notes).emit(&mut asm)?;
        }
        asm.finish()
    }

    fn boot_stub(
        &self,
        site: &HookSite,
        displaced: &[u8],
        exit: TrampolineExit,
        request: &PlanRequest,
    ) -> Result<Assembled, PatchError> {
        let resume = match exit {
            TrampolineExit::JumpTo(address) => address,
            _ => site.at.address,
        };
        let hook = self.boot_hook(request, BootPlacement::InlineCopy, displaced.to_vec(), resume);
        let mut asm = Assembler::new(BOOT_STUB);
        hook.emit(&mut asm)?;
        asm.finish()
    }

    fn frame_stub(
        &self,
        displaced: Option<&Vec<u8>>,
        exit: TrampolineExit,
        request: &PlanRequest,
    ) -> Result<Assembled, PatchError> {
        let mut trampoline = Trampoline::new(
            request.region.start.bank,
            CallTarget::Symbol(FRAME_ENTRY.to_string()),
            request.home,
        );
        trampoline.displaced = displaced.map(|bytes| Displaced {
            bytes: bytes.clone(),
            placement: DisplacedPlacement::After,
        });
        trampoline.exit = exit;
        let mut asm = Assembler::new(FRAME_STUB);
        trampoline.emit(&mut asm)?;
        asm.finish()
    }

    fn boot_site_patch(
        &self,
        rom: &RomImage,
        site: &HookSite,
        prep: &HookPrep,
        request: &PlanRequest,
        symbols: &IndexMap<String, u16>,
        notes: &mut Vec<PlanNote>,
    ) -> Result<Patch, PatchError> {
        let bytes = match prep {
            HookPrep::InPlace { covered, .. } => {
                let resume = site.at.address + *covered as u16;
                let hook = self.boot_hook(request, BootPlacement::JumpBack, Vec::new(), resume);
                let mut asm = Assembler::new(&site.name);
                hook.emit(&mut asm)?;
                pad_to(asm.finish()?.link(site.at.address, symbols)?, *covered, site, notes)
            }
            HookPrep::Stub { covered, .. } => entry_redirect(symbol(symbols, BOOT_STUB)?, *covered)?,
            HookPrep::CallSite { .. } => {
                return Err(PatchError::InvalidParameter(format!(
                    "boot hook {} must be a splice site",
                    site.name
                )))
            }
        };
        Patch::from_rom(rom, &site.name, site.at.to_offset()?, bytes)
    }

    fn frame_site_patch(
        &self,
        rom: &RomImage,
        site: &HookSite,
        prep: &HookPrep,
        request: &PlanRequest,
        symbols: &IndexMap<String, u16>,
        notes: &mut Vec<PlanNote>,
    ) -> Result<Patch, PatchError> {
        let offset = site.at.to_offset()?;
        match prep {
            HookPrep::InPlace { covered, .. } => {
                let mut asm = Assembler::new(&site.name);
                self.site_trampoline(request).emit(&mut asm)?;
                let bytes = pad_to(asm.finish()?.link(site.at.address, symbols)?, *covered, site, notes);
                Patch::from_rom(rom, &site.name, offset, bytes)
            }
            HookPrep::Stub { covered, .. } => {
                let bytes = entry_redirect(symbol(symbols, FRAME_STUB)?, *covered)?;
                Patch::from_rom(rom, &site.name, offset, bytes)
            }
            HookPrep::CallSite { .. } => {
                // only the operand changes; the opcode stays
                let stub = symbol(symbols, FRAME_STUB)?;
                Patch::from_rom(rom, &site.name, offset + 1, stub.to_le_bytes().to_vec())
            }
        }
    }
}

/// File span `(offset, len)` a boot or frame hook rewrites at its site
fn claimed_span(site: &HookSite, prep: &HookPrep) -> Result<(usize, usize), PatchError> {
    let offset = site.at.to_offset()?;
    Ok(match prep {
        HookPrep::InPlace { covered, .. } | HookPrep::Stub { covered, .. } => (offset, *covered),
        HookPrep::CallSite { .. } => (offset, 3),
    })
}

fn symbol(symbols: &IndexMap<String, u16>, name: &str) -> Result<u16, PatchError> {
    symbols
        .get(name)
        .copied()
        .ok_or_else(|| PatchError::UnresolvedSymbol(name.to_string()))
}

fn pad_to(mut bytes: Vec<u8>, covered: usize, site: &HookSite, notes: &mut Vec<PlanNote>) -> Vec<u8> {
    let nops = covered.saturating_sub(bytes.len());
    if nops > 0 {
        debug!("Hook {} padded with {} NOPs", site.name, nops);
        notes.push(PlanNote::HookPadding {
            hook: site.name.clone(),
            nops,
        });
    }
    bytes.resize(covered, 0x00);
    bytes
}

fn oam_rewriter(oam: &OamRequest, notes: &mut Vec<PlanNote>) -> OamRewriter {
    let buffers = match &oam.targeting {
        BufferTargeting::Declared(buffers) => buffers.clone(),
        BufferTargeting::Unknown { candidates } => {
            let candidates = if candidates.is_empty() {
                DEFAULT_SHADOW_BUFFERS.to_vec()
            } else {
                candidates.clone()
            };
            warn!(
                "OAM DMA source unknown; rewriting {} candidate buffers",
                candidates.len()
            );
            notes.push(PlanNote::ConservativeBufferTargeting {
                candidates: candidates.clone(),
            });
            candidates
        }
    };
    let selection = match &oam.selection {
        OamSelection::Fixed(palette) => PaletteSelection::Fixed(*palette),
        OamSelection::TileRange {
            first,
            last,
            palette,
        } => PaletteSelection::TileRange {
            first: *first,
            last: *last,
            palette: *palette,
        },
        OamSelection::Lookup(_) => PaletteSelection::Lookup {
            table: TILE_LOOKUP.to_string(),
        },
    };
    let mut rewriter = OamRewriter::new(buffers, selection).finish_with_dma(oam.call_dma);
    rewriter.sprite_count = oam.sprite_count;
    rewriter.visibility = oam.visibility;
    rewriter
}

fn nop_patch(rom: &RomImage, index: usize, nop: &NopPatch) -> Result<Patch, PatchError> {
    let offset = nop.address.to_offset()?;
    let original = rom.read(offset, nop.len)?.to_vec();
    if let Some(expect) = &nop.expect {
        if expect != &original {
            return Err(PatchError::OriginalMismatch {
                offset,
                expected: expect.clone(),
                actual: original,
            });
        }
    }
    Ok(Patch::new(
        &format!("nop_{}_{}", index, nop.address),
        offset,
        original,
        vec![0x00; nop.len],
    ))
}

/// Decode whole instructions from the site until at least `min_len` bytes are covered
fn cover_site(rom: &RomImage, site: &HookSite, min_len: usize, budget: usize) -> Result<Cover, PatchError> {
    if min_len > budget {
        return Err(PatchError::HookBudgetExceeded {
            hook: site.name.clone(),
            needed: min_len,
            available: budget,
        });
    }
    let (memory, origin) = rom.bank(site.at.bank)?;
    let mut instructions = Vec::new();
    let mut len = 0;
    while len < min_len {
        let instruction = Instruction::decode(memory, origin, site.at.address + len as u16)?;
        len += instruction.len();
        instructions.push(instruction);
    }
    if len > budget {
        return Err(PatchError::HookBudgetExceeded {
            hook: site.name.clone(),
            needed: len,
            available: budget,
        });
    }
    debug!(
        "Hook {} covers {} bytes in {} instructions",
        site.name,
        len,
        instructions.len()
    );
    Ok(Cover { instructions, len })
}

fn cover_bytes(cover: &Cover) -> Vec<u8> {
    cover
        .instructions
        .iter()
        .flat_map(|i| i.bytes.iter().copied())
        .collect()
}

fn in_window(address: u16) -> bool {
    address >= SWITCHABLE_WINDOW && (address as u32) < WINDOW_END
}

/// Check that covered instructions still work at their new home.
///
/// Returns the bytes to copy and how control leaves them. A final RET or
/// `JP nn` is turned into the exit instead of being copied.
fn relocate(cover: &Cover, start: u16, runs_in: RunsIn) -> Result<(Vec<u8>, TrampolineExit), PatchError> {
    let end = start as u32 + cover.len as u32;
    let mut stack_depth: i32 = 0;
    let mut exit = TrampolineExit::JumpTo(end as u16);
    let mut copied = Vec::new();

    for (i, ins) in cover.instructions.iter().enumerate() {
        let last = i + 1 == cover.instructions.len();
        let fail = |reason: String| PatchError::DisplacedNotRelocatable {
            address: ins.address,
            reason,
        };

        if ins.is_raw() {
            return Err(fail(format!("byte {:02X} does not decode", ins.opcode())));
        }
        if ins.flow.is_relative() {
            if let Some(target) = ins.target {
                if (target as u32) < start as u32 || target as u32 >= end {
                    return Err(fail(format!(
                        "relative branch to {:#06x} leaves the displaced span",
                        target
                    )));
                }
            }
        }

        match runs_in {
            RunsIn::BankedCall => {
                match ins.flow {
                    Flow::Next
                    | Flow::Halt
                    | Flow::Call
                    | Flow::ConditionalCall
                    | Flow::Restart
                    | Flow::RelativeJump
                    | Flow::ConditionalRelativeJump => {}
                    _ => {
                        return Err(fail(format!(
                            "{} would leave the injected routine",
                            ins
                        )))
                    }
                }
                match ins.opcode() {
                    0x31 | 0xF9 | 0xE8 | 0xF8 | 0x08 => {
                        return Err(fail(format!("{} depends on the stack pointer", ins)))
                    }
                    0xFA | 0xEA => {
                        let address = u16::from_le_bytes([ins.bytes[1], ins.bytes[2]]);
                        if in_window(address) {
                            return Err(fail(format!(
                                "{} reads the switchable window with another bank mapped",
                                ins
                            )));
                        }
                    }
                    op if op & 0xCF == 0xC5 => stack_depth += 1,
                    op if op & 0xCF == 0xC1 => {
                        stack_depth -= 1;
                        if stack_depth < 0 {
                            return Err(fail(format!("{} would pop the return address", ins)));
                        }
                    }
                    _ => {}
                }
                if matches!(ins.flow, Flow::Call | Flow::ConditionalCall) {
                    if let Some(target) = ins.target.filter(|t| in_window(*t)) {
                        return Err(fail(format!(
                            "call to {:#06x} in the switchable window",
                            target
                        )));
                    }
                }
                copied.extend_from_slice(&ins.bytes);
            }
            RunsIn::HomeStub => {
                if ins.flow.is_terminal() {
                    if !last {
                        return Err(fail(format!("{} ends the code before the hook span does", ins)));
                    }
                    exit = match (ins.opcode(), ins.target) {
                        (0xC9, _) => TrampolineExit::Return,
                        (0xC3, Some(target)) => TrampolineExit::JumpTo(target),
                        _ => return Err(fail(format!("{} cannot be moved", ins))),
                    };
                } else {
                    copied.extend_from_slice(&ins.bytes);
                }
            }
        }
    }

    if stack_depth != 0 {
        return Err(PatchError::DisplacedNotRelocatable {
            address: start,
            reason: format!("leaves {} values on the stack", stack_depth),
        });
    }
    Ok((copied, exit))
}
