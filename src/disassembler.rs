use crate::instruction::Instruction;
use log::debug;
use std::fmt::Write;

/// Opcodes that record a call in `trace_region`: CALL and CALL cc
const CALL_OPCODES: [u8; 5] = [0xCD, 0xC4, 0xCC, 0xD4, 0xDC];

/// Opcodes that record a jump in `trace_region`: JP and JP cc
const JUMP_OPCODES: [u8; 5] = [0xC3, 0xC2, 0xCA, 0xD2, 0xDA];

pub struct Disassembler<'a> {
    memory: &'a [u8],
    origin: u16,
}

/// Lazy walk over a byte buffer, one instruction per step.
///
/// Stops once the byte budget is spent, the buffer ends, or right after a
/// return or unconditional absolute jump has been yielded. The cursor only
/// moves forward; a new walk needs a new `Disassembly`.
pub struct Disassembly<'a> {
    memory: &'a [u8],
    origin: u16,
    cursor: u32,
    end: u32,
    finished: bool,
}

/// CALL and JP edges found by a sequential scan, as (source, target) pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallGraph {
    pub calls: Vec<(u16, u16)>,
    pub jumps: Vec<(u16, u16)>,
}

impl CallGraph {
    /// Distinct call sites that reach `target`
    pub fn callers_of(&self, target: u16) -> Vec<u16> {
        let mut callers: Vec<u16> = self
            .calls
            .iter()
            .filter(|(_, dest)| *dest == target)
            .map(|(src, _)| *src)
            .collect();
        callers.sort_unstable();
        callers.dedup();
        callers
    }

    pub fn merge(&mut self, other: CallGraph) {
        self.calls.extend(other.calls);
        self.jumps.extend(other.jumps);
    }
}

impl<'a> Disassembler<'a> {
    pub fn new(memory: &'a [u8]) -> Self {
        Disassembler { memory, origin: 0 }
    }

    /// Disassembler over a window whose first byte sits at CPU address `origin`
    pub fn with_origin(memory: &'a [u8], origin: u16) -> Self {
        Disassembler { memory, origin }
    }

    /// Decode from `start_address` until `max_bytes` are consumed or a routine ends
    pub fn disassemble(&self, start_address: u16, max_bytes: usize) -> Disassembly<'a> {
        let window_end = self.origin as u32 + self.memory.len() as u32;
        let end = (start_address as u32 + max_bytes as u32).min(window_end);
        Disassembly {
            memory: self.memory,
            origin: self.origin,
            cursor: start_address as u32,
            end,
            finished: (start_address as u32) < self.origin as u32,
        }
    }

    /// Scan `start..end` byte by byte for CALL/JP opcodes without following control flow.
    ///
    /// The scan cannot tell code from data, so the region must already be known to be code.
    pub fn trace_region(&self, start_address: u16, end_address: u16) -> CallGraph {
        let mut graph = CallGraph::default();
        let mut addr = start_address as u32;
        let base = self.origin as u32;

        while addr < end_address as u32 {
            if addr < base {
                addr += 1;
                continue;
            }
            let offset = (addr - base) as usize;
            if offset + 2 >= self.memory.len() {
                break;
            }
            let byte = self.memory[offset];
            let target = u16::from_le_bytes([self.memory[offset + 1], self.memory[offset + 2]]);

            if CALL_OPCODES.contains(&byte) {
                graph.calls.push((addr as u16, target));
                addr += 3;
            } else if JUMP_OPCODES.contains(&byte) {
                graph.jumps.push((addr as u16, target));
                addr += 3;
            } else {
                addr += 1;
            }
        }

        debug!(
            "Traced {:#06x}-{:#06x}: {} calls, {} jumps",
            start_address,
            end_address,
            graph.calls.len(),
            graph.jumps.len()
        );
        graph
    }

    /// Render a listing: address, raw bytes, mnemonic
    pub fn format_listing(&self, start_address: u16, max_bytes: usize) -> String {
        let mut output = String::new();
        let mut count = 0;
        let mut bytes = 0;

        writeln!(&mut output, "Disassembly starting at {:#06x}:", start_address).unwrap();
        writeln!(&mut output).unwrap();

        for instruction in self.disassemble(start_address, max_bytes) {
            writeln!(&mut output, "{}", format_instruction(&instruction)).unwrap();
            count += 1;
            bytes += instruction.len();
        }

        writeln!(
            &mut output,
            "\nDisassembled {} instructions ({} bytes)",
            count, bytes
        )
        .unwrap();
        output
    }
}

impl<'a> Iterator for Disassembly<'a> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Instruction> {
        if self.finished || self.cursor >= self.end || self.cursor > u16::MAX as u32 {
            return None;
        }

        let instruction = match Instruction::decode(self.memory, self.origin, self.cursor as u16) {
            Ok(instruction) => instruction,
            Err(e) => {
                debug!("Disassembly stopped: {}", e);
                self.finished = true;
                return None;
            }
        };

        self.cursor += instruction.len() as u32;
        if instruction.flow.is_terminal() {
            self.finished = true;
        }
        Some(instruction)
    }
}

/// Format a single instruction as `0xaddr: bytes  text`
pub fn format_instruction(instruction: &Instruction) -> String {
    let hex = instruction
        .bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{:#06x}: {:<9} {}", instruction.address, hex, instruction)
}

/// Decode `buffer` (first byte at address 0) from `start_address`
pub fn disassemble(buffer: &[u8], start_address: u16, max_bytes: usize) -> Disassembly<'_> {
    Disassembler::new(buffer).disassemble(start_address, max_bytes)
}

/// Sequential CALL/JP scan over `buffer` (first byte at address 0)
pub fn trace_region(buffer: &[u8], start_address: u16, end_address: u16) -> CallGraph {
    Disassembler::new(buffer).trace_region(start_address, end_address)
}

/// Convenience function to produce a listing for a window at `origin`
pub fn disassemble_range(memory: &[u8], origin: u16, start: u16, end: u16) -> String {
    let disassembler = Disassembler::with_origin(memory, origin);
    disassembler.format_listing(start, end.saturating_sub(start) as usize)
}
