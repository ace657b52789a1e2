use std::fmt::Display;
use std::fmt::Error;
use std::fmt::Formatter;
use std::ops::RangeInclusive;

use crate::error::PatchError;

/// Post boot ROM entry point
pub const ENTRY_POINT: u16 = 0x0100;
pub const TITLE_START: usize = 0x0134;
pub const TITLE_END: usize = 0x0143;
pub const CGB_FLAG: usize = 0x0143;
pub const CARTRIDGE_TYPE: usize = 0x0147;
pub const ROM_SIZE: usize = 0x0148;
pub const RAM_SIZE: usize = 0x0149;
pub const HEADER_CHECKSUM: usize = 0x014D;
pub const GLOBAL_CHECKSUM: usize = 0x014E;
pub const HEADER_END: usize = 0x0150;

/// Bytes covered by the header checksum
pub const CHECKSUM_RANGE: RangeInclusive<usize> = 0x0134..=0x014C;

/// Works on both DMG and CGB hardware
pub const CGB_COMPATIBLE: u8 = 0x80;
/// Refuses to run on DMG hardware
pub const CGB_ONLY: u8 = 0xC0;

pub struct Header {
    pub title: String,
    pub cgb_flag: u8,
    pub cartridge_type: u8,
    pub rom_size_code: u8,
    pub ram_size_code: u8,
    pub header_checksum: u8,
    pub global_checksum: u16,
    pub computed_header_checksum: u8,
    pub computed_global_checksum: u16,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Header, PatchError> {
        if bytes.len() < HEADER_END {
            return Err(PatchError::InvalidRomSize(bytes.len()));
        }

        Ok(Header {
            title: bytes[TITLE_START..TITLE_END]
                .iter()
                .take_while(|b| **b != 0)
                .map(|b| *b as char)
                .collect(),
            cgb_flag: bytes[CGB_FLAG],
            cartridge_type: bytes[CARTRIDGE_TYPE],
            rom_size_code: bytes[ROM_SIZE],
            ram_size_code: bytes[RAM_SIZE],
            header_checksum: bytes[HEADER_CHECKSUM],
            global_checksum: u16::from_be_bytes([bytes[GLOBAL_CHECKSUM], bytes[GLOBAL_CHECKSUM + 1]]),
            computed_header_checksum: header_checksum(bytes),
            computed_global_checksum: global_checksum(bytes),
        })
    }

    pub fn header_checksum_valid(&self) -> bool {
        self.header_checksum == self.computed_header_checksum
    }

    pub fn global_checksum_valid(&self) -> bool {
        self.global_checksum == self.computed_global_checksum
    }

    pub fn color_support(&self) -> &'static str {
        match self.cgb_flag {
            CGB_ONLY => "CGB only",
            CGB_COMPATIBLE => "CGB enhanced",
            _ => "DMG",
        }
    }

    /// ROM size declared by the header byte (32KiB << code)
    pub fn declared_rom_size(&self) -> Option<usize> {
        if self.rom_size_code <= 8 {
            Some(0x8000 << self.rom_size_code)
        } else {
            None
        }
    }
}

/// Header checksum over 0x0134..=0x014C: `chk = chk - byte - 1`
pub fn header_checksum(bytes: &[u8]) -> u8 {
    bytes[CHECKSUM_RANGE]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_sub(*b).wrapping_sub(1))
}

/// 16-bit sum of every byte in the image except the global checksum itself
pub fn global_checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != GLOBAL_CHECKSUM && *i != GLOBAL_CHECKSUM + 1)
        .fold(0u16, |acc, (_, b)| acc.wrapping_add(*b as u16))
}

impl Display for Header {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(
            f,
            "
Title:                    {}
Color support:            {} ({:#04x})
Cartridge type:           {:#04x}
ROM size code:            {:#04x}
RAM size code:            {:#04x}
Header checksum:          {:#04x} ({})
Global checksum:          {:#06x} ({})
",
            self.title,
            self.color_support(),
            self.cgb_flag,
            self.cartridge_type,
            self.rom_size_code,
            self.ram_size_code,
            self.header_checksum,
            if self.header_checksum_valid() { "ok" } else { "BAD" },
            self.global_checksum,
            if self.global_checksum_valid() { "ok" } else { "BAD" },
        )
    }
}
