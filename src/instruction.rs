use crate::error::PatchError;
use crate::opcode_tables::{cb_mnemonic, opcode_info, Flow, OperandKind};
use log::debug;
use std::fmt::{Display, Error, Formatter};

/// A decoded SM83 instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// CPU address of the first byte
    pub address: u16,
    /// Raw encoded bytes
    pub bytes: Vec<u8>,
    /// Mnemonic ("DB" for bytes that do not decode)
    pub mnemonic: String,
    /// Rendered operand text
    pub operands: String,
    /// Control-flow class of the opcode
    pub flow: Flow,
    /// Absolute branch, call or restart target when the instruction has one
    pub target: Option<u16>,
}

impl Instruction {
    /// Decode the instruction at CPU address `addr`, where `memory[0]` sits at `origin`.
    ///
    /// Bytes that are not a defined opcode, or an instruction whose operands
    /// would run past the end of `memory`, decode as a one byte `DB` record.
    pub fn decode(memory: &[u8], origin: u16, addr: u16) -> Result<Self, PatchError> {
        let offset = addr
            .checked_sub(origin)
            .map(|o| o as usize)
            .filter(|o| *o < memory.len())
            .ok_or_else(|| {
                PatchError::AddressOutOfRange(format!(
                    "{:#06x} outside buffer {:#06x}+{:#x}",
                    addr,
                    origin,
                    memory.len()
                ))
            })?;

        let opcode = memory[offset];
        let info = opcode_info(opcode);
        let length = info.length();

        if !info.defined || offset + length > memory.len() {
            if info.defined {
                debug!(
                    "Truncated {} at {:#06x}: needs {} bytes, {} left",
                    info.mnemonic,
                    addr,
                    length,
                    memory.len() - offset
                );
            }
            return Ok(Self::raw(addr, opcode));
        }

        let bytes = memory[offset..offset + length].to_vec();
        let mut target = None;
        let mut mnemonic = info.mnemonic.to_string();

        let rendered = match info.kind {
            OperandKind::None => String::new(),
            OperandKind::Imm8 => format!("${:02X}", bytes[1]),
            OperandKind::HighPage => format!("$FF{:02X}", bytes[1]),
            OperandKind::SignedImm8 => format!("{:+}", bytes[1] as i8),
            OperandKind::Imm16 | OperandKind::Addr16 => {
                let word = u16::from_le_bytes([bytes[1], bytes[2]]);
                if matches!(
                    info.flow,
                    Flow::Call | Flow::ConditionalCall | Flow::Jump | Flow::ConditionalJump
                ) {
                    target = Some(word);
                }
                format!("${:04X}", word)
            }
            OperandKind::Relative => {
                let dest = relative_target(addr, bytes[1]);
                target = Some(dest);
                format!("${:04X}", dest)
            }
            OperandKind::Prefix => {
                let name = cb_mnemonic(bytes[1]);
                let (op, args) = name.split_once(' ').unwrap_or((name.as_str(), ""));
                mnemonic = op.to_string();
                args.to_string()
            }
        };

        if info.flow == Flow::Restart {
            target = Some((opcode & 0x38) as u16);
        }

        let operands = if info.kind == OperandKind::Prefix {
            rendered
        } else {
            info.operands.replace("{}", &rendered)
        };

        Ok(Instruction {
            address: addr,
            bytes,
            mnemonic,
            operands,
            flow: info.flow,
            target,
        })
    }

    /// One byte placeholder for data or undecodable input
    pub fn raw(addr: u16, byte: u8) -> Self {
        Instruction {
            address: addr,
            bytes: vec![byte],
            mnemonic: "DB".to_string(),
            operands: format!("{:02X}h", byte),
            flow: Flow::Next,
            target: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    pub fn is_raw(&self) -> bool {
        self.mnemonic == "DB"
    }

    /// Address of the byte following this instruction
    pub fn next_address(&self) -> u16 {
        self.address.wrapping_add(self.len() as u16)
    }
}

/// Target of a relative branch: the signed displacement counts from the
/// address following the two byte instruction
pub fn relative_target(addr: u16, displacement: u8) -> u16 {
    addr.wrapping_add(2)
        .wrapping_add(displacement as i8 as i16 as u16)
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        if self.operands.is_empty() {
            write!(f, "{}", self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.operands)
        }
    }
}
