//! Banked ROM image
//!
//! Bank 0 is always mapped at 0x0000-0x3FFF. Every other bank is reached
//! through the 0x4000-0x7FFF window after its number is written to the bank
//! select register.

use crate::disassembler::Disassembler;
use crate::error::PatchError;
use crate::header::{self, Header};
use log::debug;
use std::fmt::{Display, Error, Formatter};
use std::fs;
use std::path::Path;

pub const BANK_SIZE: usize = 0x4000;
pub const SWITCHABLE_WINDOW: u16 = 0x4000;
pub const WINDOW_END: u32 = 0x8000;
/// MBC1-style ROM bank select register
pub const BANK_SELECT_REGISTER: u16 = 0x2000;

/// A CPU address together with the bank that must be mapped for it to be valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BankedAddress {
    pub bank: u8,
    pub address: u16,
}

impl BankedAddress {
    pub fn new(bank: u8, address: u16) -> Self {
        BankedAddress { bank, address }
    }

    pub fn in_switchable_window(&self) -> bool {
        self.address >= SWITCHABLE_WINDOW && (self.address as u32) < WINDOW_END
    }

    /// File offset of this address
    pub fn to_offset(self) -> Result<usize, PatchError> {
        match self.address {
            0x0000..=0x3FFF if self.bank == 0 => Ok(self.address as usize),
            0x4000..=0x7FFF if self.bank >= 1 => {
                Ok(self.bank as usize * BANK_SIZE + (self.address - SWITCHABLE_WINDOW) as usize)
            }
            _ => Err(PatchError::AddressOutOfRange(format!(
                "{} is not a ROM address",
                self
            ))),
        }
    }

    pub fn from_offset(offset: usize) -> Result<Self, PatchError> {
        if offset < BANK_SIZE {
            return Ok(BankedAddress::new(0, offset as u16));
        }
        let bank = offset / BANK_SIZE;
        if bank > u8::MAX as usize {
            return Err(PatchError::AddressOutOfRange(format!(
                "offset {:#x} is beyond bank 0xFF",
                offset
            )));
        }
        Ok(BankedAddress::new(
            bank as u8,
            SWITCHABLE_WINDOW + (offset % BANK_SIZE) as u16,
        ))
    }

    /// Parse `bank:addr` (both hex) or a bare bank 0 address, with optional `0x` prefixes
    pub fn parse(text: &str) -> Result<Self, PatchError> {
        let hex = |s: &str| -> Result<u32, PatchError> {
            let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
            u32::from_str_radix(digits, 16)
                .map_err(|_| PatchError::Config(format!("invalid hex number '{}'", s)))
        };
        let (bank, address) = match text.split_once(':') {
            Some((bank, address)) => (hex(bank)?, hex(address)?),
            None => (0, hex(text)?),
        };
        if bank > 0xFF || address > 0xFFFF {
            return Err(PatchError::Config(format!("address '{}' out of range", text)));
        }
        Ok(BankedAddress::new(bank as u8, address as u16))
    }
}

impl Display for BankedAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{:02X}:{:04X}", self.bank, self.address)
    }
}

/// Owned ROM image of fixed size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomImage {
    data: Vec<u8>,
}

impl RomImage {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, PatchError> {
        if data.len() < 2 * BANK_SIZE || data.len() % BANK_SIZE != 0 {
            return Err(PatchError::InvalidRomSize(data.len()));
        }
        Ok(RomImage { data })
    }

    pub fn load(path: &Path) -> Result<Self, PatchError> {
        let data = fs::read(path)?;
        debug!("Loaded {} bytes from {}", data.len(), path.display());
        Self::from_bytes(data)
    }

    pub fn save(&self, path: &Path) -> Result<(), PatchError> {
        fs::write(path, &self.data)?;
        debug!("Wrote {} bytes to {}", self.data.len(), path.display());
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bank_count(&self) -> usize {
        self.data.len() / BANK_SIZE
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8], PatchError> {
        self.check_span(offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    pub fn read_at(&self, addr: BankedAddress, len: usize) -> Result<&[u8], PatchError> {
        let offset = addr.to_offset()?;
        if offset % BANK_SIZE + len > BANK_SIZE {
            return Err(PatchError::AddressOutOfRange(format!(
                "{} + {:#x} crosses a bank boundary",
                addr, len
            )));
        }
        self.read(offset, len)
    }

    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), PatchError> {
        self.check_span(offset, bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn check_span(&self, offset: usize, len: usize) -> Result<(), PatchError> {
        if offset.checked_add(len).map_or(true, |end| end > self.data.len()) {
            return Err(PatchError::PatchOutOfBounds {
                offset,
                len,
                rom_len: self.data.len(),
            });
        }
        Ok(())
    }

    /// A bank's bytes and the CPU address its first byte is mapped at
    pub fn bank(&self, bank: u8) -> Result<(&[u8], u16), PatchError> {
        let index = bank as usize;
        if index >= self.bank_count() {
            return Err(PatchError::AddressOutOfRange(format!(
                "bank {:#04x} of {} banks",
                bank,
                self.bank_count()
            )));
        }
        let origin = if bank == 0 { 0 } else { SWITCHABLE_WINDOW };
        Ok((&self.data[index * BANK_SIZE..(index + 1) * BANK_SIZE], origin))
    }

    pub fn disassembler(&self, bank: u8) -> Result<Disassembler<'_>, PatchError> {
        let (memory, origin) = self.bank(bank)?;
        Ok(Disassembler::with_origin(memory, origin))
    }

    pub fn header(&self) -> Result<Header, PatchError> {
        Header::parse(&self.data)
    }

    pub fn cgb_flag(&self) -> u8 {
        self.data[header::CGB_FLAG]
    }

    pub fn set_cgb_flag(&mut self, flag: u8) {
        self.data[header::CGB_FLAG] = flag;
    }

    pub fn header_checksum(&self) -> u8 {
        self.data[header::HEADER_CHECKSUM]
    }

    pub fn verify_header_checksum(&self) -> bool {
        header::header_checksum(&self.data) == self.header_checksum()
    }

    /// Recompute and store the header checksum, returning the new value
    pub fn update_header_checksum(&mut self) -> u8 {
        let checksum = header::header_checksum(&self.data);
        self.data[header::HEADER_CHECKSUM] = checksum;
        checksum
    }

    /// Recompute and store the big-endian global checksum
    pub fn update_global_checksum(&mut self) -> u16 {
        let checksum = header::global_checksum(&self.data);
        let [hi, lo] = checksum.to_be_bytes();
        self.data[header::GLOBAL_CHECKSUM] = hi;
        self.data[header::GLOBAL_CHECKSUM + 1] = lo;
        checksum
    }

    /// Address the entry point jumps to, when it follows the usual `NOP; JP nn` shape
    pub fn entry_jump_target(&self) -> Option<u16> {
        let disasm = Disassembler::new(&self.data[..BANK_SIZE]);
        disasm
            .disassemble(header::ENTRY_POINT, 4)
            .find(|ins| ins.opcode() == 0xC3)
            .and_then(|ins| ins.target)
    }
}
