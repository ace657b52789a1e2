use crate::disassembler::*;
use crate::opcode_tables::Flow;
use test_log::test;

#[test]
fn test_stops_at_return() {
    let memory = vec![
        0xF5, // PUSH AF
        0x3E, 0x0D, // LD A,$0D
        0xEA, 0x00, 0x20, // LD [$2000],A
        0xF1, // POP AF
        0xC9, // RET
        0x00, 0x00, // never reached
    ];

    let records: Vec<_> = disassemble(&memory, 0, 64).collect();
    assert_eq!(records.len(), 5);
    assert_eq!(records[2].to_string(), "LD [$2000],A");
    assert_eq!(records.last().unwrap().mnemonic, "RET");
}

#[test]
fn test_conditional_jump_is_not_a_boundary() {
    let memory = vec![
        0xCA, 0x10, 0x00, // JP Z,$0010
        0xC3, 0x50, 0x01, // JP $0150
        0x00,
    ];

    let records: Vec<_> = disassemble(&memory, 0, 64).collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].flow, Flow::ConditionalJump);
    assert_eq!(records[1].target, Some(0x0150));
}

#[test]
fn test_byte_budget_ends_walk() {
    let memory = vec![0x00; 32];
    let records: Vec<_> = disassemble(&memory, 4, 10).collect();
    assert_eq!(records.len(), 10);
    assert_eq!(records[0].address, 4);
    assert_eq!(records[9].address, 13);
}

#[test]
fn test_data_bytes_do_not_stop_the_walk() {
    let memory = vec![0xDD, 0xFC, 0x00, 0xC9];
    let records: Vec<_> = disassemble(&memory, 0, 16).collect();
    assert_eq!(records.len(), 4);
    assert!(records[0].is_raw());
    assert!(records[1].is_raw());
    assert_eq!(records[2].mnemonic, "NOP");
}

#[test]
fn test_walk_is_not_restartable() {
    let memory = vec![0x00, 0xC9];
    let mut walk = disassemble(&memory, 0, 16);
    assert!(walk.next().is_some());
    assert!(walk.next().is_some());
    assert!(walk.next().is_none());
    assert!(walk.next().is_none());
}

#[test]
fn test_banked_window_origin() {
    // JR NZ back to the start of a loop placed at 0x6D00
    let memory = vec![0x2A, 0xE0, 0x69, 0x0D, 0x20, 0xFA, 0xC9];
    let disasm = Disassembler::with_origin(&memory, 0x6D00);
    let records: Vec<_> = disasm.disassemble(0x6D00, memory.len()).collect();
    let jr = &records[3];
    assert_eq!(jr.address, 0x6D04);
    assert_eq!(jr.target, Some(0x6D00));
}

#[test]
fn test_start_before_origin_yields_nothing() {
    let memory = vec![0x00; 4];
    let disasm = Disassembler::with_origin(&memory, 0x4000);
    assert_eq!(disasm.disassemble(0x3FFF, 4).count(), 0);
}

#[test]
fn test_trace_region_collects_all_variants() {
    let memory = vec![
        0xCD, 0x00, 0x6D, // CALL $6D00
        0x00, // NOP
        0xDC, 0x34, 0x12, // CALL C,$1234
        0xC2, 0x80, 0x01, // JP NZ,$0180
        0xC3, 0x50, 0x01, // JP $0150
        0xC9, // RET
        0x00, 0x00,
    ];

    let graph = trace_region(&memory, 0, 14);
    assert_eq!(graph.calls, vec![(0x0000, 0x6D00), (0x0004, 0x1234)]);
    assert_eq!(graph.jumps, vec![(0x0007, 0x0180), (0x000A, 0x0150)]);
}

#[test]
fn test_trace_region_reads_data_as_code() {
    // A table entry of CD happens to look like a call; the scan reports it anyway
    let memory = vec![0x01, 0xCD, 0x40, 0x00, 0x00];
    let graph = trace_region(&memory, 0, 4);
    assert_eq!(graph.calls, vec![(0x0001, 0x0040)]);
}

#[test]
fn test_callers_of() {
    let memory = vec![
        0xCD, 0x69, 0x3B, // CALL $3B69
        0xCD, 0x69, 0x3B, // CALL $3B69
        0xCD, 0x00, 0x40, // CALL $4000
        0x00, 0x00,
    ];
    let graph = trace_region(&memory, 0, 9);
    assert_eq!(graph.callers_of(0x3B69), vec![0x0000, 0x0003]);
    assert_eq!(graph.callers_of(0x4000), vec![0x0006]);
}

#[test]
fn test_callers_of_overlapping_traces() {
    let memory = vec![
        0xCD, 0x69, 0x3B, // CALL $3B69
        0x00, //
        0xCD, 0x69, 0x3B, // CALL $3B69
        0x00, 0x00,
    ];
    // second scan covers the first call again
    let mut graph = trace_region(&memory, 0, 7);
    graph.merge(trace_region(&memory, 0, 3));
    assert_eq!(graph.calls.len(), 3);
    assert_eq!(graph.callers_of(0x3B69), vec![0x0000, 0x0004]);
}

#[test]
fn test_listing_format() {
    let memory = vec![0x21, 0x80, 0x6C, 0xC9];
    let listing = disassemble_range(&memory, 0x6D00, 0x6D00, 0x6D04);
    assert!(listing.contains("0x6d00: 21 80 6C  LD HL,$6C80"));
    assert!(listing.contains("Disassembled 2 instructions (4 bytes)"));
}
