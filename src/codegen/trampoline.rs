/// trampoline.rs
/// Bank switching dispatchers from a hook site into banked injected code
use crate::codegen::assembler::{Assembler, StackReg};
use crate::error::PatchError;
use crate::rom::BANK_SELECT_REGISTER;

/// How the trampoline puts the caller's bank back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankRestore {
    /// Always map this bank afterwards
    Fixed(u8),
    /// Re-select whatever bank the game's own shadow variable at this address records
    Shadow(u16),
}

/// Call target of a trampoline or hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Address(u16),
    Symbol(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplacedPlacement {
    /// Run the original instructions before the injected call
    Before,
    /// Run them after the bank has been restored
    After,
}

/// Original instructions overwritten by the hook, copied verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Displaced {
    pub bytes: Vec<u8>,
    pub placement: DisplacedPlacement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineExit {
    Return,
    /// Continue with whatever follows the trampoline
    FallThrough,
    JumpTo(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trampoline {
    pub target_bank: u8,
    pub target: CallTarget,
    pub restore: BankRestore,
    /// Pushed before the bank switch, popped in reverse afterwards
    pub saved: Vec<StackReg>,
    /// Keep A and flags intact across both bank switches
    pub preserve_a: bool,
    pub displaced: Option<Displaced>,
    pub exit: TrampolineExit,
}

impl Trampoline {
    pub fn new(target_bank: u8, target: CallTarget, restore: BankRestore) -> Self {
        Trampoline {
            target_bank,
            target,
            restore,
            saved: Vec::new(),
            preserve_a: true,
            displaced: None,
            exit: TrampolineExit::Return,
        }
    }

    pub fn emit(&self, asm: &mut Assembler) -> Result<(), PatchError> {
        if self.target_bank == 0 {
            return Err(PatchError::InvalidParameter(
                "trampoline target is in bank 0; call it directly".to_string(),
            ));
        }

        if let Some(Displaced {
            bytes,
            placement: DisplacedPlacement::Before,
        }) = &self.displaced
        {
            asm.raw(bytes);
        }

        for reg in &self.saved {
            asm.push(*reg);
        }

        if self.preserve_a {
            asm.push(StackReg::AF);
        }
        asm.select_bank(self.target_bank);
        if self.preserve_a {
            asm.pop(StackReg::AF);
        }

        emit_call(asm, &self.target);

        if self.preserve_a {
            asm.push(StackReg::AF);
        }
        emit_restore(asm, self.restore);
        if self.preserve_a {
            asm.pop(StackReg::AF);
        }

        for reg in self.saved.iter().rev() {
            asm.pop(*reg);
        }

        if let Some(Displaced {
            bytes,
            placement: DisplacedPlacement::After,
        }) = &self.displaced
        {
            asm.raw(bytes);
        }

        match self.exit {
            TrampolineExit::Return => {
                asm.ret();
            }
            TrampolineExit::FallThrough => {}
            TrampolineExit::JumpTo(address) => {
                asm.jp(address);
            }
        }
        Ok(())
    }

    /// Encoded size; independent of where the code ends up
    pub fn size(&self) -> Result<usize, PatchError> {
        let mut asm = Assembler::new("trampoline_size");
        self.emit(&mut asm)?;
        Ok(asm.finish()?.len())
    }
}

pub fn emit_call(asm: &mut Assembler, target: &CallTarget) {
    match target {
        CallTarget::Address(address) => {
            asm.call(*address);
        }
        CallTarget::Symbol(symbol) => {
            asm.call_symbol(symbol);
        }
    }
}

pub fn emit_restore(asm: &mut Assembler, restore: BankRestore) {
    match restore {
        BankRestore::Fixed(bank) => {
            asm.select_bank(bank);
        }
        BankRestore::Shadow(address) => {
            asm.ld_a_mem(address).ld_mem_a(BANK_SELECT_REGISTER);
        }
    }
}
