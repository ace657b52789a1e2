//! SM83 Opcode Constants
//!
//! Named encodings for every instruction the code generators emit.
//!
//! # Convention
//!
//! Register-encoded families are given as the BASE byte with the register,
//! pair or condition field cleared. The assembler ORs the field in:
//! - 8-bit register `r` (B C D E H L [HL] A = 0..7) at bits 5-3 (`r << 3`) or bits 2-0
//! - register pair `rr` (BC DE HL SP/AF = 0..3) at bits 5-4 (`rr << 4`)
//! - condition `cc` (NZ Z NC C = 0..3) at bits 4-3 (`cc << 3`)
//! - ALU operation (ADD ADC SUB SBC AND XOR OR CP = 0..7) at bits 5-3

/// NOP
pub const NOP: u8 = 0x00;

/// LD r,n8 (r << 3)
pub const LD_R_IMM: u8 = 0x06;

/// LD r,r' (dst << 3 | src); LD [HL],[HL] is HALT
pub const LD_R_R: u8 = 0x40;

/// LD rr,n16 (rr << 4)
pub const LD_RR_IMM: u8 = 0x01;

/// LD A,[HL+]
pub const LD_A_HLI: u8 = 0x2A;

/// LD [HL+],A
pub const LD_HLI_A: u8 = 0x22;

/// LD A,[DE]
pub const LD_A_DE: u8 = 0x1A;

/// LD [a16],A
pub const LD_MEM_A: u8 = 0xEA;

/// LD A,[a16]
pub const LD_A_MEM: u8 = 0xFA;

/// LDH [$FF00+a8],A
pub const LDH_STORE: u8 = 0xE0;

/// LDH A,[$FF00+a8]
pub const LDH_LOAD: u8 = 0xF0;

/// INC r (r << 3)
pub const INC_R: u8 = 0x04;

/// DEC r (r << 3)
pub const DEC_R: u8 = 0x05;

/// INC rr (rr << 4)
pub const INC_RR: u8 = 0x03;

/// DEC rr (rr << 4)
pub const DEC_RR: u8 = 0x0B;

/// ADD HL,rr (rr << 4)
pub const ADD_HL_RR: u8 = 0x09;

/// ALU A,r (op << 3 | r)
pub const ALU_R: u8 = 0x80;

/// ALU A,n8 (op << 3)
pub const ALU_IMM: u8 = 0xC6;

/// PUSH rr (rr << 4, AF = 3)
pub const PUSH: u8 = 0xC5;

/// POP rr (rr << 4, AF = 3)
pub const POP: u8 = 0xC1;

/// JR e8
pub const JR: u8 = 0x18;

/// JR cc,e8 (cc << 3)
pub const JR_COND: u8 = 0x20;

/// JP a16
pub const JP: u8 = 0xC3;

/// CALL a16
pub const CALL: u8 = 0xCD;

/// RET
pub const RET: u8 = 0xC9;

/// ALU operation field values
pub mod alu {
    pub const ADD: u8 = 0;
    pub const SUB: u8 = 2;
    pub const AND: u8 = 4;
    pub const XOR: u8 = 5;
    pub const OR: u8 = 6;
    pub const CP: u8 = 7;
}
