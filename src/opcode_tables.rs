//! SM83 opcode table
//!
//! One entry per base opcode byte, built once on first use. Each entry carries
//! the mnemonic, an operand template (`{}` marks where the decoded operand is
//! rendered), the operand encoding and the control-flow class the disassembler
//! and call tracer need. Bytes the CPU does not define decode as `DB`.

/// 8-bit register operand names in encoding order
pub const REG8: [&str; 8] = ["B", "C", "D", "E", "H", "L", "[HL]", "A"];

/// 16-bit register pair names used by LD/INC/DEC/ADD
pub const REG16: [&str; 4] = ["BC", "DE", "HL", "SP"];

/// 16-bit register pair names used by PUSH/POP
pub const REG16_STACK: [&str; 4] = ["BC", "DE", "HL", "AF"];

/// Branch condition names in encoding order
pub const CONDITIONS: [&str; 4] = ["NZ", "Z", "NC", "C"];

const ALU_OPS: [(&str, &str); 8] = [
    ("ADD", "A,"),
    ("ADC", "A,"),
    ("SUB", ""),
    ("SBC", "A,"),
    ("AND", ""),
    ("XOR", ""),
    ("OR", ""),
    ("CP", ""),
];

const ILLEGAL: [u8; 11] = [
    0xD3, 0xDB, 0xDD, 0xE3, 0xE4, 0xEB, 0xEC, 0xED, 0xF4, 0xFC, 0xFD,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    /// Unsigned immediate byte
    Imm8,
    /// Little-endian immediate word
    Imm16,
    /// Little-endian absolute address
    Addr16,
    /// Low byte of an address in page 0xFF (LDH)
    HighPage,
    /// Signed displacement relative to the next instruction
    Relative,
    /// Signed immediate byte (ADD SP / LD HL,SP+)
    SignedImm8,
    /// Second byte of a CB-prefixed instruction
    Prefix,
}

impl OperandKind {
    pub fn size(self) -> usize {
        match self {
            OperandKind::None => 0,
            OperandKind::Imm8
            | OperandKind::HighPage
            | OperandKind::Relative
            | OperandKind::SignedImm8
            | OperandKind::Prefix => 1,
            OperandKind::Imm16 | OperandKind::Addr16 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Next,
    Call,
    ConditionalCall,
    Jump,
    ConditionalJump,
    RelativeJump,
    ConditionalRelativeJump,
    IndirectJump,
    Return,
    ConditionalReturn,
    Restart,
    Halt,
}

impl Flow {
    /// Heuristic end of a routine: returns and unconditional absolute jumps
    pub fn is_terminal(self) -> bool {
        matches!(self, Flow::Return | Flow::Jump | Flow::IndirectJump)
    }

    pub fn is_relative(self) -> bool {
        matches!(self, Flow::RelativeJump | Flow::ConditionalRelativeJump)
    }
}

#[derive(Debug, Clone)]
pub struct OpcodeInfo {
    pub opcode: u8,
    pub mnemonic: &'static str,
    pub operands: String,
    pub kind: OperandKind,
    pub flow: Flow,
    pub defined: bool,
}

impl OpcodeInfo {
    fn new(opcode: u8, mnemonic: &'static str, operands: &str, kind: OperandKind, flow: Flow) -> Self {
        OpcodeInfo {
            opcode,
            mnemonic,
            operands: operands.to_string(),
            kind,
            flow,
            defined: true,
        }
    }

    fn simple(opcode: u8, mnemonic: &'static str, operands: &str) -> Self {
        Self::new(opcode, mnemonic, operands, OperandKind::None, Flow::Next)
    }

    fn undefined(opcode: u8) -> Self {
        OpcodeInfo {
            opcode,
            mnemonic: "DB",
            operands: String::new(),
            kind: OperandKind::None,
            flow: Flow::Next,
            defined: false,
        }
    }

    /// Total encoded length including the opcode byte
    pub fn length(&self) -> usize {
        1 + self.kind.size()
    }
}

lazy_static! {
    static ref OPCODES: Vec<OpcodeInfo> = build_table();
}

/// Look up a base opcode byte
pub fn opcode_info(opcode: u8) -> &'static OpcodeInfo {
    &OPCODES[opcode as usize]
}

/// Name a CB-prefixed operation from its second byte
pub fn cb_mnemonic(byte: u8) -> String {
    let reg = REG8[(byte & 0x07) as usize];
    let field = (byte >> 3) & 0x07;
    match byte >> 6 {
        0 => {
            let name = match field {
                0 => "RLC",
                1 => "RRC",
                2 => "RL",
                3 => "RR",
                4 => "SLA",
                5 => "SRA",
                6 => "SWAP",
                _ => "SRL",
            };
            format!("{} {}", name, reg)
        }
        1 => format!("BIT {},{}", field, reg),
        2 => format!("RES {},{}", field, reg),
        _ => format!("SET {},{}", field, reg),
    }
}

fn build_table() -> Vec<OpcodeInfo> {
    let mut table: Vec<OpcodeInfo> = (0..=255u8).map(OpcodeInfo::undefined).collect();
    let mut set = |info: OpcodeInfo| {
        let slot = info.opcode as usize;
        table[slot] = info;
    };

    // Block 0: loads, 16-bit arithmetic, rotates, relative jumps
    set(OpcodeInfo::simple(0x00, "NOP", ""));
    set(OpcodeInfo::new(0x10, "STOP", "", OperandKind::Imm8, Flow::Next));
    set(OpcodeInfo::new(0x08, "LD", "[{}],SP", OperandKind::Addr16, Flow::Next));
    for rr in 0..4u8 {
        let pair = REG16[rr as usize];
        set(OpcodeInfo::new(0x01 | rr << 4, "LD", &format!("{},{{}}", pair), OperandKind::Imm16, Flow::Next));
        set(OpcodeInfo::simple(0x03 | rr << 4, "INC", pair));
        set(OpcodeInfo::simple(0x0B | rr << 4, "DEC", pair));
        set(OpcodeInfo::simple(0x09 | rr << 4, "ADD", &format!("HL,{}", pair)));
    }
    set(OpcodeInfo::simple(0x02, "LD", "[BC],A"));
    set(OpcodeInfo::simple(0x12, "LD", "[DE],A"));
    set(OpcodeInfo::simple(0x22, "LD", "[HL+],A"));
    set(OpcodeInfo::simple(0x32, "LD", "[HL-],A"));
    set(OpcodeInfo::simple(0x0A, "LD", "A,[BC]"));
    set(OpcodeInfo::simple(0x1A, "LD", "A,[DE]"));
    set(OpcodeInfo::simple(0x2A, "LD", "A,[HL+]"));
    set(OpcodeInfo::simple(0x3A, "LD", "A,[HL-]"));
    for r in 0..8u8 {
        let reg = REG8[r as usize];
        set(OpcodeInfo::simple(0x04 | r << 3, "INC", reg));
        set(OpcodeInfo::simple(0x05 | r << 3, "DEC", reg));
        set(OpcodeInfo::new(0x06 | r << 3, "LD", &format!("{},{{}}", reg), OperandKind::Imm8, Flow::Next));
    }
    for (opcode, name) in [
        (0x07, "RLCA"),
        (0x0F, "RRCA"),
        (0x17, "RLA"),
        (0x1F, "RRA"),
        (0x27, "DAA"),
        (0x2F, "CPL"),
        (0x37, "SCF"),
        (0x3F, "CCF"),
    ] {
        set(OpcodeInfo::simple(opcode, name, ""));
    }
    set(OpcodeInfo::new(0x18, "JR", "{}", OperandKind::Relative, Flow::RelativeJump));
    for cc in 0..4u8 {
        set(OpcodeInfo::new(
            0x20 | cc << 3,
            "JR",
            &format!("{},{{}}", CONDITIONS[cc as usize]),
            OperandKind::Relative,
            Flow::ConditionalRelativeJump,
        ));
    }

    // Block 1: register to register loads, 0x76 is HALT
    for dst in 0..8u8 {
        for src in 0..8u8 {
            let opcode = 0x40 | dst << 3 | src;
            if opcode == 0x76 {
                set(OpcodeInfo::new(0x76, "HALT", "", OperandKind::None, Flow::Halt));
            } else {
                let operands = format!("{},{}", REG8[dst as usize], REG8[src as usize]);
                set(OpcodeInfo::simple(opcode, "LD", &operands));
            }
        }
    }

    // Block 2: 8-bit arithmetic against registers
    for (op, (name, prefix)) in ALU_OPS.iter().enumerate() {
        for r in 0..8u8 {
            let operands = format!("{}{}", prefix, REG8[r as usize]);
            set(OpcodeInfo::simple(0x80 | (op as u8) << 3 | r, *name, &operands));
        }
        set(OpcodeInfo::new(
            0xC6 | (op as u8) << 3,
            *name,
            &format!("{}{{}}", prefix),
            OperandKind::Imm8,
            Flow::Next,
        ));
    }

    // Block 3: control flow, stack, high page
    for cc in 0..4u8 {
        let cond = CONDITIONS[cc as usize];
        set(OpcodeInfo::new(0xC0 | cc << 3, "RET", cond, OperandKind::None, Flow::ConditionalReturn));
        set(OpcodeInfo::new(
            0xC2 | cc << 3,
            "JP",
            &format!("{},{{}}", cond),
            OperandKind::Addr16,
            Flow::ConditionalJump,
        ));
        set(OpcodeInfo::new(
            0xC4 | cc << 3,
            "CALL",
            &format!("{},{{}}", cond),
            OperandKind::Addr16,
            Flow::ConditionalCall,
        ));
    }
    for rr in 0..4u8 {
        let pair = REG16_STACK[rr as usize];
        set(OpcodeInfo::simple(0xC1 | rr << 4, "POP", pair));
        set(OpcodeInfo::simple(0xC5 | rr << 4, "PUSH", pair));
    }
    for n in 0..8u8 {
        let vector = format!("{:02X}H", n * 8);
        set(OpcodeInfo::new(0xC7 | n << 3, "RST", &vector, OperandKind::None, Flow::Restart));
    }
    set(OpcodeInfo::new(0xC3, "JP", "{}", OperandKind::Addr16, Flow::Jump));
    set(OpcodeInfo::new(0xE9, "JP", "HL", OperandKind::None, Flow::IndirectJump));
    set(OpcodeInfo::new(0xCD, "CALL", "{}", OperandKind::Addr16, Flow::Call));
    set(OpcodeInfo::new(0xC9, "RET", "", OperandKind::None, Flow::Return));
    set(OpcodeInfo::new(0xD9, "RETI", "", OperandKind::None, Flow::Return));
    set(OpcodeInfo::new(0xCB, "PREFIX", "{}", OperandKind::Prefix, Flow::Next));
    set(OpcodeInfo::new(0xE0, "LDH", "[{}],A", OperandKind::HighPage, Flow::Next));
    set(OpcodeInfo::new(0xF0, "LDH", "A,[{}]", OperandKind::HighPage, Flow::Next));
    set(OpcodeInfo::simple(0xE2, "LD", "[C],A"));
    set(OpcodeInfo::simple(0xF2, "LD", "A,[C]"));
    set(OpcodeInfo::new(0xE8, "ADD", "SP,{}", OperandKind::SignedImm8, Flow::Next));
    set(OpcodeInfo::new(0xF8, "LD", "HL,SP{}", OperandKind::SignedImm8, Flow::Next));
    set(OpcodeInfo::new(0xEA, "LD", "[{}],A", OperandKind::Addr16, Flow::Next));
    set(OpcodeInfo::new(0xFA, "LD", "A,[{}]", OperandKind::Addr16, Flow::Next));
    set(OpcodeInfo::simple(0xF9, "LD", "SP,HL"));
    set(OpcodeInfo::simple(0xF3, "DI", ""));
    set(OpcodeInfo::simple(0xFB, "EI", ""));

    for opcode in ILLEGAL {
        set(OpcodeInfo::undefined(opcode));
    }

    table
}
