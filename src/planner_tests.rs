use crate::codegen::oam::DMA_ROUTINE;
use crate::error::PatchError;
use crate::free_space::FreeRegion;
use crate::hooks::{
    penta_dragon_lcd_off_patch, HookCatalogue, HookPhase, HookSite, SpliceStrategy, DMG_PALETTE_REGISTERS,
};
use crate::palette::{PaletteSet, TileLookupTable};
use crate::patcher::Patcher;
use crate::planner::*;
use crate::rom::{BankedAddress, RomImage};
use crate::test_utils::{blank_rom, MockCpu};
use test_log::test;

/// LD A,20; LD [C0F8],A; LD A,10; LD [C0F9],A; LD B,5; LD C,6; LD D,7; LD E,8
const INPUT_BODY: [u8; 18] = [
    0x3E, 0x20, 0xEA, 0xF8, 0xC0, 0x3E, 0x10, 0xEA, 0xF9, 0xC0, 0x06, 0x05, 0x0E, 0x06, 0x16, 0x07,
    0x1E, 0x08,
];

fn fixture_rom() -> RomImage {
    let mut data = blank_rom(16);
    // DI; LD SP,$DFFE; JP $0200
    data[0x0150..0x0157].copy_from_slice(&[0xF3, 0x31, 0xFE, 0xDF, 0xC3, 0x00, 0x02]);
    data[0x0824..0x0836].copy_from_slice(&INPUT_BODY);
    data[0x0836] = 0xC9;
    data[0x06D5..0x06D9].copy_from_slice(&[0xCD, 0x80, 0xFF, 0xC9]);
    data[0x3B69..0x3B81].fill(0x00);
    data[0x3B81] = 0xC9;
    data[0x0073..0x0079].copy_from_slice(&[0xF0, 0x40, 0xE6, 0x7F, 0xE0, 0x40]);
    RomImage::from_bytes(data).unwrap()
}

fn region() -> FreeRegion {
    FreeRegion::new(BankedAddress::new(13, 0x6D00), 0x400, 0xFF)
}

fn home() -> FreeRegion {
    FreeRegion::new(BankedAddress::new(0, 0x3E00), 0x100, 0xFF)
}

fn palettes() -> PaletteSet {
    PaletteSet::new(
        &[[0x7FFF, 0x03E0, 0x001F, 0x0000], [0x1F00, 0x0010, 0x0200, 0x4000]],
        &[[0x0000, 0x7C00, 0x03FF, 0x7FFF]],
    )
}

fn planner() -> PatchPlanner {
    PatchPlanner::new(HookCatalogue::penta_dragon())
}

fn patched(rom: &RomImage, plan: &PatchPlan) -> RomImage {
    let mut copy = rom.clone();
    Patcher::new().apply(&mut copy, plan).unwrap();
    copy
}

fn frame_request() -> PlanRequest {
    let mut request = PlanRequest::new(region());
    request.palettes = Some(palettes());
    request.palettes_at_boot = false;
    request.palettes_at_hook = true;
    request.oam = Some(OamRequest::new(
        OamSelection::Fixed(2),
        BufferTargeting::Declared(vec![0xC000]),
    ));
    request
}

#[test]
fn test_in_place_hook_layout() {
    let rom = fixture_rom();
    let plan = planner().plan(&rom, &frame_request()).unwrap();

    let names: Vec<&str> = plan.layout.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec![BG_PALETTES, OBJ_PALETTES, FRAME_ENTRY]);
    assert_eq!(plan.symbols[BG_PALETTES], 0x6D00);
    assert_eq!(plan.symbols[OBJ_PALETTES], 0x6D40);
    assert_eq!(plan.symbols[FRAME_ENTRY], 0x6D80);
    assert_eq!(plan.hook.as_ref().unwrap().name, "input_handler");
    assert!(plan.boot_hook.is_none());

    let site = plan.patch("input_handler").unwrap();
    assert_eq!(site.offset, 0x0824);
    assert_eq!(site.original, INPUT_BODY.to_vec());
    // PUSH AF; LD A,13; LD [2000],A; POP AF; CALL frame_entry
    assert_eq!(
        &site.replacement[..10],
        &[0xF5, 0x3E, 0x0D, 0xEA, 0x00, 0x20, 0xF1, 0xCD, 0x80, 0x6D]
    );
    assert_eq!(site.replacement.len(), 18);
    assert_eq!(site.replacement[17], 0x00);
    assert!(plan.notes.contains(&PlanNote::HookPadding {
        hook: "input_handler".to_string(),
        nops: 1
    }));

    // the covered instructions open the banked routine
    let entry = plan.patch(FRAME_ENTRY).unwrap();
    assert_eq!(&entry.replacement[..18], &INPUT_BODY);
}

#[test]
fn test_in_place_hook_runs_game_code_and_injection() {
    let rom = fixture_rom();
    let request = frame_request();
    let plan = planner().plan(&rom, &request).unwrap();
    let patched = patched(&rom, &plan);

    let mut cpu = MockCpu::with_rom(patched.into_bytes());
    cpu.load(0xC000, &[0x40, 0x10, 0x22, 0x80]);
    cpu.call(0x0824).unwrap();

    let set = palettes();
    assert_eq!(&cpu.bg_palette_ram[..], set.background.as_bytes());
    assert_eq!(&cpu.obj_palette_ram[..], set.object.as_bytes());
    assert_eq!(cpu.read(0xC003), 0x82);
    // displaced instructions still did their job
    assert_eq!(cpu.read(0xC0F8), 0x20);
    assert_eq!(cpu.read(0xC0F9), 0x10);
    assert_eq!((cpu.a, cpu.b, cpu.c, cpu.d, cpu.e), (0x10, 5, 6, 7, 8));
    assert_eq!(cpu.bank, 1);
    assert_eq!(cpu.bank_writes, vec![13, 1]);
}

#[test]
fn test_boot_stub_uploads_palettes_once() {
    let rom = fixture_rom();
    let mut request = PlanRequest::new(region());
    request.palettes = Some(palettes());
    request.home_region = Some(home());
    let plan = planner().plan(&rom, &request).unwrap();

    let names: Vec<&str> = plan.layout.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec![BG_PALETTES, OBJ_PALETTES, BOOT_LOADER, BOOT_STUB]);
    assert_eq!(plan.symbols[BOOT_STUB], 0x3E00);
    assert!(plan.hook.is_none());

    // DI and LD SP,nn are covered whole: 4 bytes become JP stub + NOP
    let site = plan.patch("boot_entry").unwrap();
    assert_eq!(site.replacement, vec![0xC3, 0x00, 0x3E, 0x00]);

    let mut cpu = MockCpu::with_rom(patched(&rom, &plan).into_bytes());
    cpu.run(0x0150, 0x0200).unwrap();
    assert_eq!(&cpu.bg_palette_ram[..], palettes().background.as_bytes());
    assert_eq!(cpu.sp, 0xDFFE);
    assert_eq!(cpu.bank_writes, vec![13, 1]);
}

#[test]
fn test_call_site_hook_runs_before_dma() {
    let rom = fixture_rom();
    let mut table = TileLookupTable::new();
    table.assign(0x05, 0x05, 3).unwrap();

    let mut request = PlanRequest::new(region());
    request.phase = HookPhase::PostDma;
    request.home_region = Some(home());
    request.oam = Some(OamRequest::new(
        OamSelection::Lookup(table),
        BufferTargeting::Unknown { candidates: Vec::new() },
    ));
    let plan = planner().plan(&rom, &request).unwrap();

    let names: Vec<&str> = plan.layout.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec![TILE_LOOKUP, FRAME_ENTRY, FRAME_STUB]);
    assert!(plan.notes.contains(&PlanNote::ConservativeBufferTargeting {
        candidates: DEFAULT_SHADOW_BUFFERS.to_vec()
    }));

    let site = plan.patch("vblank_dma_call").unwrap();
    assert_eq!(site.offset, 0x06D6);
    assert_eq!(site.replacement, vec![0x00, 0x3E]);

    let mut cpu = MockCpu::with_rom(patched(&rom, &plan).into_bytes());
    cpu.stubs.push(DMA_ROUTINE);
    for buffer in DEFAULT_SHADOW_BUFFERS {
        cpu.load(buffer, &[0x50, 0x08, 0x05, 0x10, 0x50, 0x10, 0x06, 0x10]);
    }
    cpu.call(0x06D5).unwrap();
    for buffer in DEFAULT_SHADOW_BUFFERS {
        assert_eq!(cpu.read(buffer + 3), 0x13);
        assert_eq!(cpu.read(buffer + 7), 0x10);
    }
    assert_eq!(cpu.stub_calls, vec![DMA_ROUTINE]);
    assert_eq!(cpu.bank, 1);
}

#[test]
fn test_stub_hooks_need_home_region() {
    let rom = fixture_rom();
    let mut request = PlanRequest::new(region());
    request.phase = HookPhase::PostDma;
    request.oam = Some(OamRequest::new(OamSelection::Fixed(1), BufferTargeting::Declared(vec![0xC000])));
    assert!(matches!(
        planner().plan(&rom, &request),
        Err(PatchError::InvalidParameter(_))
    ));
}

#[test]
fn test_insufficient_free_space() {
    let rom = fixture_rom();
    let mut request = frame_request();
    request.region.len = 0x40;
    match planner().plan(&rom, &request) {
        Err(PatchError::InsufficientFreeSpace { needed, available, .. }) => {
            assert_eq!(available, 0x40);
            assert!(needed > 0x80);
        }
        other => panic!("expected InsufficientFreeSpace, got {:?}", other),
    }

    // declared length is not trusted past the real pad run
    let mut data = fixture_rom().into_bytes();
    data[13 * 0x4000 + 0x2D00 + 0x50] = 0x12;
    let short = RomImage::from_bytes(data).unwrap();
    assert!(matches!(
        planner().plan(&short, &frame_request()),
        Err(PatchError::InsufficientFreeSpace { available: 0x50, .. })
    ));
}

#[test]
fn test_hook_budget_limits() {
    let rom = fixture_rom();
    let tight = PatchPlanner::new(HookCatalogue::new(vec![HookSite::splice(
        "tight",
        0x0824,
        HookPhase::InputPoll,
        8,
        SpliceStrategy::InPlace,
    )]));
    assert_eq!(
        tight.plan(&rom, &frame_request()).unwrap_err(),
        PatchError::HookBudgetExceeded {
            hook: "tight".to_string(),
            needed: 17,
            available: 8
        }
    );

    // 17 would do, but the instruction boundaries force 18
    let boundary = PatchPlanner::new(HookCatalogue::new(vec![HookSite::splice(
        "boundary",
        0x0824,
        HookPhase::InputPoll,
        17,
        SpliceStrategy::InPlace,
    )]));
    assert!(matches!(
        boundary.plan(&rom, &frame_request()),
        Err(PatchError::HookBudgetExceeded { needed: 18, available: 17, .. })
    ));
}

fn plan_site(code: &[u8], strategy: SpliceStrategy) -> Result<PatchPlan, PatchError> {
    let mut data = fixture_rom().into_bytes();
    data[0x0900..0x0900 + code.len()].copy_from_slice(code);
    let rom = RomImage::from_bytes(data).unwrap();
    let planner = PatchPlanner::new(HookCatalogue::new(vec![HookSite::splice(
        "site",
        0x0900,
        HookPhase::InputPoll,
        32,
        strategy,
    )]));
    let mut request = frame_request();
    request.home_region = Some(home());
    planner.plan(&rom, &request)
}

#[test]
fn test_displaced_code_relocation_rules() {
    let mut jr_out = vec![0x00, 0x00, 0x18, 0x30];
    jr_out.extend([0x00; 16]);
    assert!(matches!(
        plan_site(&jr_out, SpliceStrategy::InPlace),
        Err(PatchError::DisplacedNotRelocatable { address: 0x0902, .. })
    ));

    let mut banked_call = vec![0xCD, 0x67, 0x45];
    banked_call.extend([0x00; 16]);
    assert!(matches!(
        plan_site(&banked_call, SpliceStrategy::InPlace),
        Err(PatchError::DisplacedNotRelocatable { address: 0x0900, .. })
    ));
    // a bank 0 stub runs with the game's bank mapped, so the call is fine there
    assert!(plan_site(&banked_call, SpliceStrategy::Stub).is_ok());

    let mut stack = vec![0x31, 0xFE, 0xDF];
    stack.extend([0x00; 16]);
    assert!(matches!(
        plan_site(&stack, SpliceStrategy::InPlace),
        Err(PatchError::DisplacedNotRelocatable { .. })
    ));

    let mut early_ret = vec![0xAF, 0xC9];
    early_ret.extend([0x00; 16]);
    assert!(plan_site(&early_ret, SpliceStrategy::InPlace).is_err());
}

#[test]
fn test_stub_turns_final_ret_into_exit() {
    // LD A,1; RET
    let plan = plan_site(&[0x3E, 0x01, 0xC9], SpliceStrategy::Stub).unwrap();
    let stub = plan.patch(FRAME_STUB).unwrap();
    assert!(stub.replacement.ends_with(&[0xF1, 0x3E, 0x01, 0xC9]));
    let site = plan.patch("site").unwrap();
    assert_eq!(site.replacement[0], 0xC3);
    assert_eq!(site.replacement.len(), 3);
}

#[test]
fn test_unsafe_hooks_need_permission() {
    let rom = fixture_rom();
    let mut request = frame_request();
    request.phase = HookPhase::LevelLoad;
    assert_eq!(
        planner().plan(&rom, &request).unwrap_err(),
        PatchError::NoHookForPhase("level_load".to_string())
    );

    request.allow_unsafe = true;
    let plan = planner().plan(&rom, &request).unwrap();
    assert!(plan.notes.contains(&PlanNote::UnsafeHook("level_load".to_string())));
}

#[test]
fn test_traced_callers_demote_hook() {
    let mut data = fixture_rom().into_bytes();
    data[0x0300..0x0303].copy_from_slice(&[0xCD, 0x24, 0x08]);
    data[0x0310..0x0313].copy_from_slice(&[0xCD, 0x24, 0x08]);
    let rom = RomImage::from_bytes(data).unwrap();

    let mut request = frame_request();
    request.trace_regions = vec![(0x0300, 0x0320)];
    assert_eq!(
        planner().plan(&rom, &request).unwrap_err(),
        PatchError::NoHookForPhase("input_poll".to_string())
    );
}

#[test]
fn test_extra_nop_patches() {
    let rom = fixture_rom();
    let mut request = frame_request();
    request.extra_nops.push(penta_dragon_lcd_off_patch());
    let plan = planner().plan(&rom, &request).unwrap();
    let nop = plan.patches.iter().find(|p| p.offset == 0x0073).unwrap();
    assert_eq!(nop.replacement, vec![0x00; 6]);

    let mut request = frame_request();
    request.extra_nops.push(NopPatch {
        address: BankedAddress::new(0, 0x0073),
        len: 2,
        expect: Some(vec![0xAA, 0xBB]),
    });
    assert!(matches!(
        planner().plan(&rom, &request),
        Err(PatchError::OriginalMismatch { offset: 0x0073, .. })
    ));

    let mut request = frame_request();
    request.extra_nops.push(NopPatch {
        address: BankedAddress::new(0, 0x0143),
        len: 1,
        expect: None,
    });
    assert!(matches!(
        planner().plan(&rom, &request),
        Err(PatchError::PatchOverlap { offset: 0x0143, .. })
    ));
}

#[test]
fn test_request_validation() {
    let rom = fixture_rom();
    let mut request = frame_request();
    request.cgb_flag = 0x42;
    assert!(planner().plan(&rom, &request).is_err());

    let mut request = frame_request();
    request.region = FreeRegion::new(BankedAddress::new(0, 0x3E00), 0x100, 0xFF);
    assert!(planner().plan(&rom, &request).is_err());

    let request = PlanRequest::new(region());
    assert!(matches!(
        planner().plan(&rom, &request),
        Err(PatchError::InvalidParameter(_))
    ));
}

/// Fixture plus DMG palette writes: two identical BGP fades in bank 0, an
/// OBP0 write in bank 3 and an OBP1 write that a NOP patch will claim
fn palette_write_rom() -> RomImage {
    let mut data = fixture_rom().into_bytes();
    data[0x0400..0x0405].copy_from_slice(&[0x3E, 0xE4, 0xE0, 0x47, 0xC9]);
    data[0x0410..0x0415].copy_from_slice(&[0x3E, 0xE4, 0xE0, 0x47, 0xC9]);
    data[0x0420..0x0425].copy_from_slice(&[0x3E, 0x1B, 0xE0, 0x49, 0xC9]);
    let bank3 = 3 * 0x4000 + 0x0100;
    data[bank3..bank3 + 5].copy_from_slice(&[0x3E, 0xD2, 0xE0, 0x48, 0xC9]);
    RomImage::from_bytes(data).unwrap()
}

fn palette_write_request() -> PlanRequest {
    let mut request = PlanRequest::new(region());
    request.palettes = Some(palettes());
    request.palettes_at_boot = false;
    request.home_region = Some(home());
    request.palette_writes = Some(PaletteWriteRequest {
        scan_banks: vec![0, 3],
        registers: DMG_PALETTE_REGISTERS.to_vec(),
    });
    request.extra_nops.push(NopPatch {
        address: BankedAddress::new(0, 0x0420),
        len: 4,
        expect: None,
    });
    request
}

#[test]
fn test_palette_writes_redirected_through_wrappers() {
    let rom = palette_write_rom();
    let plan = planner().plan(&rom, &palette_write_request()).unwrap();

    let names: Vec<&str> = plan.layout.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(
        names,
        vec![BG_PALETTES, OBJ_PALETTES, PALETTE_UPLOAD, "dmg_write_47_e4_b01", "dmg_write_48_d2_b03"]
    );
    assert_eq!(plan.symbols[PALETTE_UPLOAD], 0x6D80);
    assert_eq!(plan.symbols["dmg_write_47_e4_b01"], 0x3E00);
    assert_eq!(plan.symbols["dmg_write_48_d2_b03"], 0x3E16);

    let hooked: Vec<&str> = plan.palette_hooks.iter().map(|h| h.name.as_str()).collect();
    assert_eq!(
        hooked,
        vec!["palette_write_00_0400", "palette_write_00_0410", "palette_write_03_4100"]
    );
    assert!(plan
        .notes
        .contains(&PlanNote::SkippedPaletteWrite("palette_write_00_0420".to_string())));

    // both fades share one wrapper
    assert_eq!(plan.patch("palette_write_00_0400").unwrap().replacement, vec![0xCD, 0x00, 0x3E, 0x00]);
    assert_eq!(plan.patch("palette_write_00_0410").unwrap().replacement, vec![0xCD, 0x00, 0x3E, 0x00]);
    let banked = plan.patch("palette_write_03_4100").unwrap();
    assert_eq!(banked.offset, 0xC100);
    assert_eq!(banked.replacement, vec![0xCD, 0x16, 0x3E, 0x00]);
    assert!(plan.to_string().contains("Palette write hook: palette_write_03_4100"));
}

#[test]
fn test_palette_write_hooks_run_dmg_write_then_upload() {
    let rom = palette_write_rom();
    let plan = planner().plan(&rom, &palette_write_request()).unwrap();
    let image = patched(&rom, &plan).into_bytes();

    let mut cpu = MockCpu::with_rom(image.clone());
    cpu.call(0x0410).unwrap();
    assert_eq!(cpu.read(0xFF47), 0xE4);
    assert_eq!(cpu.a, 0xE4);
    assert_eq!(&cpu.bg_palette_ram[..], palettes().background.as_bytes());
    assert_eq!(&cpu.obj_palette_ram[..], palettes().object.as_bytes());
    assert_eq!(cpu.bank_writes, vec![13, 1]);

    // a write in bank 3 gets bank 3 back, not the home bank
    let mut cpu = MockCpu::with_rom(image);
    cpu.bank = 3;
    cpu.call(0x4100).unwrap();
    assert_eq!(cpu.read(0xFF48), 0xD2);
    assert_eq!(&cpu.obj_palette_ram[..], palettes().object.as_bytes());
    assert_eq!(cpu.bank, 3);
    assert_eq!(cpu.bank_writes, vec![13, 3]);
}

#[test]
fn test_palette_write_failures() {
    let rom = palette_write_rom();

    let mut request = palette_write_request();
    request.palettes = None;
    assert!(matches!(
        planner().plan(&rom, &request),
        Err(PatchError::InvalidParameter(_))
    ));

    let mut request = palette_write_request();
    request.home_region = None;
    assert!(matches!(
        planner().plan(&rom, &request),
        Err(PatchError::InvalidParameter(_))
    ));

    let mut request = palette_write_request();
    request.palette_writes = Some(PaletteWriteRequest {
        scan_banks: vec![5],
        registers: DMG_PALETTE_REGISTERS.to_vec(),
    });
    assert_eq!(
        planner().plan(&rom, &request).unwrap_err(),
        PatchError::NoHookForPhase("palette_write".to_string())
    );

    // a listed site that is not a palette write
    let mut catalogue = HookCatalogue::penta_dragon();
    catalogue.push(HookSite::palette_write("fade", BankedAddress::new(0, 0x0500), 0x47));
    let mut request = palette_write_request();
    request.palette_writes = Some(PaletteWriteRequest {
        scan_banks: Vec::new(),
        registers: DMG_PALETTE_REGISTERS.to_vec(),
    });
    assert!(matches!(
        PatchPlanner::new(catalogue).plan(&rom, &request),
        Err(PatchError::DisplacedNotRelocatable { address: 0x0500, .. })
    ));

    let mut request = frame_request();
    request.phase = HookPhase::PaletteWrite;
    assert!(matches!(
        planner().plan(&rom, &request),
        Err(PatchError::InvalidParameter(_))
    ));
}

#[test]
fn test_plan_summary_lists_everything() {
    let rom = fixture_rom();
    let plan = planner().plan(&rom, &frame_request()).unwrap();
    let text = plan.to_string();
    assert!(text.contains("input_handler"));
    assert!(text.contains("0D:6D80"));
    assert!(text.contains("CGB flag: 0x80"));
}
