/// boot.rs
/// One-shot hook at the program entry that uploads palettes before the game starts
use crate::codegen::assembler::{Assembler, StackReg};
use crate::codegen::opcodes;
use crate::codegen::trampoline::{emit_call, emit_restore, BankRestore, CallTarget};
use crate::error::PatchError;

/// Where the entry instructions overwritten by the hook end up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPlacement {
    /// Hook sits at the entry site; the covered instructions run inside the
    /// banked loader and the hook jumps to the first instruction past them
    JumpBack,
    /// Entry site jumps to a stub holding the hook plus a verbatim copy of
    /// the covered instructions, which then jumps past them
    InlineCopy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootHook {
    pub loader_bank: u8,
    pub loader: CallTarget,
    pub restore: BankRestore,
    /// Covered entry instructions, only emitted for `InlineCopy`
    pub displaced: Vec<u8>,
    /// First original instruction after the covered span
    pub resume: u16,
    pub placement: BootPlacement,
}

impl BootHook {
    pub fn emit(&self, asm: &mut Assembler) -> Result<(), PatchError> {
        if self.loader_bank == 0 {
            return Err(PatchError::InvalidParameter(
                "boot loader must live in a switchable bank".to_string(),
            ));
        }
        // A carries the hardware identification byte at boot
        asm.push(StackReg::AF)
            .select_bank(self.loader_bank)
            .pop(StackReg::AF);
        emit_call(asm, &self.loader);
        asm.push(StackReg::AF);
        emit_restore(asm, self.restore);
        asm.pop(StackReg::AF);
        if self.placement == BootPlacement::InlineCopy {
            asm.raw(&self.displaced);
        }
        asm.jp(self.resume);
        Ok(())
    }

    pub fn size(&self) -> Result<usize, PatchError> {
        let mut asm = Assembler::new("boot_hook_size");
        self.emit(&mut asm)?;
        Ok(asm.finish()?.len())
    }
}

/// `JP stub` followed by NOPs filling the rest of a covered span
pub fn entry_redirect(stub: u16, covered_len: usize) -> Result<Vec<u8>, PatchError> {
    if covered_len < 3 {
        return Err(PatchError::HookBudgetExceeded {
            hook: format!("redirect to {:#06x}", stub),
            needed: 3,
            available: covered_len,
        });
    }
    let [lo, hi] = stub.to_le_bytes();
    let mut bytes = vec![opcodes::JP, lo, hi];
    bytes.resize(covered_len, opcodes::NOP);
    Ok(bytes)
}
