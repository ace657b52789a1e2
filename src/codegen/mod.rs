// Code generation for injected SM83 routines
// Every generator emits through the Assembler so branches and addresses are
// resolved in one place.

pub mod assembler;
pub mod boot;
pub mod oam;
pub mod opcodes;
pub mod palette_loader;
pub mod palette_write;
pub mod trampoline;


pub use assembler::{Assembled, Assembler, Condition, Reg16, Reg8, StackReg};
pub use boot::{entry_redirect, BootHook, BootPlacement};
pub use oam::{OamRewriter, PaletteSelection, VisibleRange};
pub use palette_loader::{PaletteLoader, PaletteSource, PaletteTarget};
pub use palette_write::{palette_write_call, PaletteWriteWrapper};
pub use trampoline::{BankRestore, CallTarget, Displaced, DisplacedPlacement, Trampoline, TrampolineExit};
