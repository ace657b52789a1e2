// Patch Pipeline Error Handling

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    // Image errors
    InvalidRomSize(usize),
    AddressOutOfRange(String),

    // Assembly errors
    BranchOutOfRange { label: String, displacement: i32 },
    UndefinedLabel(String),
    DuplicateLabel(String),
    UnresolvedSymbol(String),

    // Generator parameter errors
    PaletteSize { target: String, start: usize, len: usize },
    InvalidPaletteIndex(u8),
    InvalidParameter(String),

    // Planning errors
    InsufficientFreeSpace { region: String, needed: usize, available: usize },
    HookBudgetExceeded { hook: String, needed: usize, available: usize },
    NoHookForPhase(String),
    DisplacedNotRelocatable { address: u16, reason: String },
    PatchOverlap { first: String, second: String, offset: usize },

    // Apply errors
    PatchOutOfBounds { offset: usize, len: usize, rom_len: usize },
    OriginalMismatch { offset: usize, expected: Vec<u8>, actual: Vec<u8> },

    // Configuration and IO errors
    Config(String),
    IOError(String),
}

/// Render a byte run as space separated hex pairs
pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PatchError::InvalidRomSize(len) => {
                write!(
                    f,
                    "Invalid ROM size {:#x}: must be a multiple of 0x4000 and at least 0x8000",
                    len
                )
            }
            PatchError::AddressOutOfRange(msg) => {
                write!(f, "Address out of range: {}", msg)
            }
            PatchError::BranchOutOfRange { label, displacement } => {
                write!(
                    f,
                    "Relative branch to '{}' needs displacement {} (allowed -128..=127)",
                    label, displacement
                )
            }
            PatchError::UndefinedLabel(label) => {
                write!(f, "Undefined label '{}'", label)
            }
            PatchError::DuplicateLabel(label) => {
                write!(f, "Duplicate label '{}'", label)
            }
            PatchError::UnresolvedSymbol(symbol) => {
                write!(f, "Unresolved symbol '{}' at link time", symbol)
            }
            PatchError::PaletteSize { target, start, len } => {
                write!(
                    f,
                    "{} palette upload of {} bytes from index {} does not fit 64 bytes of palette RAM",
                    target, len, start
                )
            }
            PatchError::InvalidPaletteIndex(index) => {
                write!(f, "Palette index {} out of range (0-7)", index)
            }
            PatchError::InvalidParameter(msg) => {
                write!(f, "Invalid generator parameter: {}", msg)
            }
            PatchError::InsufficientFreeSpace {
                region,
                needed,
                available,
            } => {
                write!(
                    f,
                    "Free region {} holds {} bytes but the layout needs {}",
                    region, available, needed
                )
            }
            PatchError::HookBudgetExceeded {
                hook,
                needed,
                available,
            } => {
                write!(
                    f,
                    "Hook '{}' has room for {} bytes but the trampoline is {} bytes",
                    hook, available, needed
                )
            }
            PatchError::NoHookForPhase(phase) => {
                write!(f, "No usable hook site for phase {}", phase)
            }
            PatchError::DisplacedNotRelocatable { address, reason } => {
                write!(
                    f,
                    "Displaced code at {:#06x} cannot be relocated: {}",
                    address, reason
                )
            }
            PatchError::PatchOverlap {
                first,
                second,
                offset,
            } => {
                write!(
                    f,
                    "Patches '{}' and '{}' overlap at offset {:#07x}",
                    first, second, offset
                )
            }
            PatchError::PatchOutOfBounds {
                offset,
                len,
                rom_len,
            } => {
                write!(
                    f,
                    "Patch at offset {:#07x} ({} bytes) runs past the end of a {:#x} byte ROM",
                    offset, len, rom_len
                )
            }
            PatchError::OriginalMismatch {
                offset,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Original bytes at offset {:#07x} do not match: expected [{}], found [{}]",
                    offset,
                    hex_bytes(expected),
                    hex_bytes(actual)
                )
            }
            PatchError::Config(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            PatchError::IOError(msg) => {
                write!(f, "IO error: {}", msg)
            }
        }
    }
}

impl std::error::Error for PatchError {}

impl From<std::io::Error> for PatchError {
    fn from(err: std::io::Error) -> Self {
        PatchError::IOError(err.to_string())
    }
}

impl From<toml::de::Error> for PatchError {
    fn from(err: toml::de::Error) -> Self {
        PatchError::Config(err.to_string())
    }
}
