/// palette_write.rs
/// Wrappers standing in for the game's own DMG palette writes
use crate::codegen::assembler::Assembler;
use crate::codegen::opcodes;
use crate::codegen::trampoline::{
    BankRestore, CallTarget, Displaced, DisplacedPlacement, Trampoline, TrampolineExit,
};
use crate::error::PatchError;

/// LD A,n8
const LD_A_IMM: u8 = opcodes::LD_R_IMM | (7 << 3);

/// Does the original `LD A,value; LDH [FF00+register],A`, then calls the
/// banked palette upload. A and the flags come back as the original write
/// left them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaletteWriteWrapper {
    pub register: u8,
    pub value: u8,
    pub loader_bank: u8,
    pub loader: CallTarget,
    /// Bank mapped at the hooked write
    pub restore: BankRestore,
}

impl PaletteWriteWrapper {
    /// The instructions the site gives up
    pub fn original(&self) -> [u8; 4] {
        [LD_A_IMM, self.value, opcodes::LDH_STORE, self.register]
    }

    /// Sites writing the same value to the same register from the same bank
    /// share one wrapper
    pub fn name(&self) -> String {
        let restore = match self.restore {
            BankRestore::Fixed(bank) => format!("b{:02x}", bank),
            BankRestore::Shadow(address) => format!("s{:04x}", address),
        };
        format!("dmg_write_{:02x}_{:02x}_{}", self.register, self.value, restore)
    }

    fn trampoline(&self) -> Trampoline {
        let mut trampoline = Trampoline::new(self.loader_bank, self.loader.clone(), self.restore);
        trampoline.displaced = Some(Displaced {
            bytes: self.original().to_vec(),
            placement: DisplacedPlacement::Before,
        });
        trampoline.exit = TrampolineExit::Return;
        trampoline
    }

    pub fn emit(&self, asm: &mut Assembler) -> Result<(), PatchError> {
        if !(0x47..=0x49).contains(&self.register) {
            return Err(PatchError::InvalidParameter(format!(
                "FF{:02X} is not a DMG palette register",
                self.register
            )));
        }
        self.trampoline().emit(asm)
    }

    pub fn size(&self) -> Result<usize, PatchError> {
        self.trampoline().size()
    }
}

/// `CALL wrapper; NOP`, the same length as the write it replaces
pub fn palette_write_call(wrapper: u16) -> Vec<u8> {
    let [lo, hi] = wrapper.to_le_bytes();
    vec![opcodes::CALL, lo, hi, opcodes::NOP]
}
