/// assembler.rs
/// Symbolic SM83 instruction builder with label and relocation tracking
///
/// Generators describe code as a sequence of operations instead of literal
/// bytes. Relative branches are resolved when the block is finished, so the
/// finished bytes are position independent apart from the recorded
/// relocations, which are filled in once the block has a final address.
use crate::codegen::opcodes::{self, alu};
use crate::error::PatchError;
use crate::rom::{BANK_SELECT_REGISTER, SWITCHABLE_WINDOW, WINDOW_END};
use indexmap::IndexMap;
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg8 {
    B = 0,
    C = 1,
    D = 2,
    E = 3,
    H = 4,
    L = 5,
    /// Memory at [HL]
    HlInd = 6,
    A = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg16 {
    BC = 0,
    DE = 1,
    HL = 2,
    SP = 3,
}

/// Register pairs as PUSH/POP encode them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackReg {
    BC = 0,
    DE = 1,
    HL = 2,
    AF = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    NZ = 0,
    Z = 1,
    NC = 2,
    C = 3,
}

/// Where a relocated operand points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocationTarget {
    /// Byte offset of a label inside the same block
    Local(usize),
    /// Named address supplied at link time
    Symbol(String),
}

/// 16-bit operand that needs the final address of its target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub at: usize,
    pub target: RelocationTarget,
}

#[derive(Debug, Clone)]
enum Fixup {
    Relative { at: usize, label: String },
    Absolute { at: usize, label: String },
}

pub struct Assembler {
    name: String,
    code: Vec<u8>,
    labels: IndexMap<String, usize>,
    fixups: Vec<Fixup>,
    relocations: Vec<Relocation>,
    errors: Vec<PatchError>,
}

/// A finished block: bytes with every branch resolved and the relocations still to apply
#[derive(Debug, Clone)]
pub struct Assembled {
    pub name: String,
    pub bytes: Vec<u8>,
    pub labels: IndexMap<String, usize>,
    pub relocations: Vec<Relocation>,
}

impl Assembler {
    pub fn new(name: &str) -> Self {
        Assembler {
            name: name.to_string(),
            code: Vec::new(),
            labels: IndexMap::new(),
            fixups: Vec::new(),
            relocations: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Current emission offset from the start of the block
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn label(&mut self, name: &str) -> &mut Self {
        if self.labels.contains_key(name) {
            self.errors.push(PatchError::DuplicateLabel(name.to_string()));
        } else {
            self.labels.insert(name.to_string(), self.code.len());
        }
        self
    }

    fn byte(&mut self, byte: u8) -> &mut Self {
        self.code.push(byte);
        self
    }

    fn word(&mut self, word: u16) -> &mut Self {
        self.code.extend_from_slice(&word.to_le_bytes());
        self
    }

    fn symbol_word(&mut self, symbol: &str) -> &mut Self {
        self.relocations.push(Relocation {
            at: self.code.len(),
            target: RelocationTarget::Symbol(symbol.to_string()),
        });
        self.word(0)
    }

    fn label_word(&mut self, label: &str) -> &mut Self {
        self.fixups.push(Fixup::Absolute {
            at: self.code.len(),
            label: label.to_string(),
        });
        self.word(0)
    }

    /// Copy bytes through verbatim (displaced original code, data)
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.byte(opcodes::NOP)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.byte(opcodes::RET)
    }

    pub fn ld_r_imm(&mut self, reg: Reg8, value: u8) -> &mut Self {
        self.byte(opcodes::LD_R_IMM | (reg as u8) << 3).byte(value)
    }

    pub fn ld_r_r(&mut self, dst: Reg8, src: Reg8) -> &mut Self {
        if dst == Reg8::HlInd && src == Reg8::HlInd {
            self.errors.push(PatchError::InvalidParameter(
                "LD [HL],[HL] does not exist (encodes HALT)".to_string(),
            ));
        }
        self.byte(opcodes::LD_R_R | (dst as u8) << 3 | src as u8)
    }

    pub fn ld_rr_imm(&mut self, pair: Reg16, value: u16) -> &mut Self {
        self.byte(opcodes::LD_RR_IMM | (pair as u8) << 4).word(value)
    }

    /// LD rr,symbol where the symbol's address is known only at link time
    pub fn ld_rr_symbol(&mut self, pair: Reg16, symbol: &str) -> &mut Self {
        self.byte(opcodes::LD_RR_IMM | (pair as u8) << 4)
            .symbol_word(symbol)
    }

    /// LD rr,label for a label inside this block
    pub fn ld_rr_label(&mut self, pair: Reg16, label: &str) -> &mut Self {
        self.byte(opcodes::LD_RR_IMM | (pair as u8) << 4)
            .label_word(label)
    }

    pub fn ld_a_hli(&mut self) -> &mut Self {
        self.byte(opcodes::LD_A_HLI)
    }

    pub fn ld_hli_a(&mut self) -> &mut Self {
        self.byte(opcodes::LD_HLI_A)
    }

    pub fn ld_a_de(&mut self) -> &mut Self {
        self.byte(opcodes::LD_A_DE)
    }

    pub fn ld_mem_a(&mut self, address: u16) -> &mut Self {
        self.byte(opcodes::LD_MEM_A).word(address)
    }

    pub fn ld_a_mem(&mut self, address: u16) -> &mut Self {
        self.byte(opcodes::LD_A_MEM).word(address)
    }

    /// LDH [port],A for a port in the 0xFF00 page
    pub fn ldh_store(&mut self, port: u16) -> &mut Self {
        self.check_high_page(port);
        self.byte(opcodes::LDH_STORE).byte(port as u8)
    }

    pub fn ldh_load(&mut self, port: u16) -> &mut Self {
        self.check_high_page(port);
        self.byte(opcodes::LDH_LOAD).byte(port as u8)
    }

    fn check_high_page(&mut self, port: u16) {
        if port & 0xFF00 != 0xFF00 {
            self.errors.push(PatchError::InvalidParameter(format!(
                "LDH cannot reach {:#06x}",
                port
            )));
        }
    }

    pub fn inc_r(&mut self, reg: Reg8) -> &mut Self {
        self.byte(opcodes::INC_R | (reg as u8) << 3)
    }

    pub fn dec_r(&mut self, reg: Reg8) -> &mut Self {
        self.byte(opcodes::DEC_R | (reg as u8) << 3)
    }

    pub fn inc_rr(&mut self, pair: Reg16) -> &mut Self {
        self.byte(opcodes::INC_RR | (pair as u8) << 4)
    }

    pub fn dec_rr(&mut self, pair: Reg16) -> &mut Self {
        self.byte(opcodes::DEC_RR | (pair as u8) << 4)
    }

    pub fn add_hl_rr(&mut self, pair: Reg16) -> &mut Self {
        self.byte(opcodes::ADD_HL_RR | (pair as u8) << 4)
    }

    pub fn alu_imm(&mut self, op: u8, value: u8) -> &mut Self {
        self.byte(opcodes::ALU_IMM | (op & 7) << 3).byte(value)
    }

    pub fn alu_r(&mut self, op: u8, reg: Reg8) -> &mut Self {
        self.byte(opcodes::ALU_R | (op & 7) << 3 | reg as u8)
    }

    pub fn and_imm(&mut self, value: u8) -> &mut Self {
        self.alu_imm(alu::AND, value)
    }

    pub fn or_imm(&mut self, value: u8) -> &mut Self {
        self.alu_imm(alu::OR, value)
    }

    pub fn cp_imm(&mut self, value: u8) -> &mut Self {
        self.alu_imm(alu::CP, value)
    }

    pub fn push(&mut self, pair: StackReg) -> &mut Self {
        self.byte(opcodes::PUSH | (pair as u8) << 4)
    }

    pub fn pop(&mut self, pair: StackReg) -> &mut Self {
        self.byte(opcodes::POP | (pair as u8) << 4)
    }

    pub fn jr(&mut self, label: &str) -> &mut Self {
        self.byte(opcodes::JR).relative(label)
    }

    pub fn jr_cond(&mut self, cond: Condition, label: &str) -> &mut Self {
        self.byte(opcodes::JR_COND | (cond as u8) << 3).relative(label)
    }

    fn relative(&mut self, label: &str) -> &mut Self {
        self.fixups.push(Fixup::Relative {
            at: self.code.len(),
            label: label.to_string(),
        });
        self.byte(0)
    }

    pub fn jp(&mut self, address: u16) -> &mut Self {
        self.byte(opcodes::JP).word(address)
    }

    pub fn jp_label(&mut self, label: &str) -> &mut Self {
        self.byte(opcodes::JP).label_word(label)
    }

    pub fn jp_symbol(&mut self, symbol: &str) -> &mut Self {
        self.byte(opcodes::JP).symbol_word(symbol)
    }

    pub fn call(&mut self, address: u16) -> &mut Self {
        self.byte(opcodes::CALL).word(address)
    }

    pub fn call_label(&mut self, label: &str) -> &mut Self {
        self.byte(opcodes::CALL).label_word(label)
    }

    pub fn call_symbol(&mut self, symbol: &str) -> &mut Self {
        self.byte(opcodes::CALL).symbol_word(symbol)
    }

    /// LD A,bank; LD [BANK_SELECT_REGISTER],A
    pub fn select_bank(&mut self, bank: u8) -> &mut Self {
        self.ld_r_imm(Reg8::A, bank).ld_mem_a(BANK_SELECT_REGISTER)
    }

    /// Resolve branches and label references
    pub fn finish(self) -> Result<Assembled, PatchError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }

        let mut bytes = self.code;
        let mut relocations = self.relocations;

        for fixup in &self.fixups {
            match fixup {
                Fixup::Relative { at, label } => {
                    let target = *self
                        .labels
                        .get(label)
                        .ok_or_else(|| PatchError::UndefinedLabel(label.clone()))?;
                    // Displacement counts from the byte after the operand
                    let displacement = target as i32 - (*at as i32 + 1);
                    if !(-128..=127).contains(&displacement) {
                        return Err(PatchError::BranchOutOfRange {
                            label: label.clone(),
                            displacement,
                        });
                    }
                    bytes[*at] = displacement as i8 as u8;
                }
                Fixup::Absolute { at, label } => {
                    let target = *self
                        .labels
                        .get(label)
                        .ok_or_else(|| PatchError::UndefinedLabel(label.clone()))?;
                    relocations.push(Relocation {
                        at: *at,
                        target: RelocationTarget::Local(target),
                    });
                }
            }
        }

        relocations.sort_by_key(|r| r.at);
        debug!(
            "Assembled '{}': {} bytes, {} labels, {} relocations",
            self.name,
            bytes.len(),
            self.labels.len(),
            relocations.len()
        );

        Ok(Assembled {
            name: self.name,
            bytes,
            labels: self.labels,
            relocations,
        })
    }
}

impl Assembled {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn label(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// External symbols this block needs at link time
    pub fn symbols(&self) -> Vec<&str> {
        self.relocations
            .iter()
            .filter_map(|r| match &r.target {
                RelocationTarget::Symbol(s) => Some(s.as_str()),
                RelocationTarget::Local(_) => None,
            })
            .collect()
    }

    /// Produce final bytes for a block placed at CPU address `base`.
    ///
    /// The block must sit entirely inside one mapping window: bank 0, the
    /// switchable window, or the RAM above it.
    pub fn link(&self, base: u16, symbols: &IndexMap<String, u16>) -> Result<Vec<u8>, PatchError> {
        let end = base as u32 + self.bytes.len() as u32;
        let window_end = if base < SWITCHABLE_WINDOW {
            SWITCHABLE_WINDOW as u32
        } else if (base as u32) < WINDOW_END {
            WINDOW_END
        } else {
            0x10000
        };
        if end > window_end {
            return Err(PatchError::AddressOutOfRange(format!(
                "block '{}' at {:#06x} ({} bytes) leaves its mapping window",
                self.name,
                base,
                self.bytes.len()
            )));
        }

        let mut bytes = self.bytes.clone();
        for relocation in &self.relocations {
            let address = match &relocation.target {
                RelocationTarget::Local(offset) => base + *offset as u16,
                RelocationTarget::Symbol(symbol) => *symbols
                    .get(symbol)
                    .ok_or_else(|| PatchError::UnresolvedSymbol(symbol.clone()))?,
            };
            bytes[relocation.at..relocation.at + 2].copy_from_slice(&address.to_le_bytes());
        }
        Ok(bytes)
    }
}
