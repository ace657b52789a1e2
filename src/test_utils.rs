// Test utilities: a minimal SM83 model for running generated code
//
// Covers only the instructions the code generators emit plus a few common
// ones found in displaced game code. Palette ports and the MBC bank register
// are modeled so tests can observe what injected code does to the hardware.

pub const FLAG_Z: u8 = 0x80;
pub const FLAG_N: u8 = 0x40;
pub const FLAG_H: u8 = 0x20;
pub const FLAG_C: u8 = 0x10;

/// Return address pushed by `call`; reaching it ends the run
const RETURN_SENTINEL: u16 = 0xFFFE;
const STEP_LIMIT: usize = 1_000_000;

pub struct MockCpu {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub sp: u16,
    pub pc: u16,
    /// Flat 64KiB address space used for everything the ROM does not cover
    pub memory: Vec<u8>,
    /// Banked cartridge ROM; when empty, 0x0000-0x7FFF reads come from `memory`
    pub rom: Vec<u8>,
    pub bank: u8,
    pub bank_writes: Vec<u8>,
    pub bg_palette_ram: [u8; 64],
    pub obj_palette_ram: [u8; 64],
    pub bcps: u8,
    pub ocps: u8,
    /// Addresses treated as external routines: calls are recorded and return immediately
    pub stubs: Vec<u16>,
    pub stub_calls: Vec<u16>,
    pub steps: usize,
}

impl MockCpu {
    pub fn new() -> Self {
        MockCpu {
            a: 0,
            f: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            sp: 0xDFF0,
            pc: 0,
            memory: vec![0u8; 0x10000],
            rom: Vec::new(),
            bank: 1,
            bank_writes: Vec::new(),
            bg_palette_ram: [0; 64],
            obj_palette_ram: [0; 64],
            bcps: 0,
            ocps: 0,
            stubs: Vec::new(),
            stub_calls: Vec::new(),
            steps: 0,
        }
    }

    /// CPU with a banked cartridge image mapped
    pub fn with_rom(rom: Vec<u8>) -> Self {
        let mut cpu = Self::new();
        cpu.rom = rom;
        cpu
    }

    pub fn load(&mut self, address: u16, bytes: &[u8]) {
        let start = address as usize;
        self.memory[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read(&self, address: u16) -> u8 {
        if !self.rom.is_empty() && address < 0x8000 {
            let offset = if address < 0x4000 {
                address as usize
            } else {
                self.bank as usize * 0x4000 + (address as usize - 0x4000)
            };
            return self.rom.get(offset).copied().unwrap_or(0xFF);
        }
        self.memory[address as usize]
    }

    pub fn write(&mut self, address: u16, value: u8) {
        match address {
            0x2000..=0x3FFF if !self.rom.is_empty() => {
                self.bank = if value == 0 { 1 } else { value };
                self.bank_writes.push(value);
            }
            0x0000..=0x7FFF if !self.rom.is_empty() => {}
            0xFF68 => self.bcps = value,
            0xFF69 => {
                self.bg_palette_ram[(self.bcps & 0x3F) as usize] = value;
                if self.bcps & 0x80 != 0 {
                    self.bcps = 0x80 | (self.bcps.wrapping_add(1) & 0x3F);
                }
            }
            0xFF6A => self.ocps = value,
            0xFF6B => {
                self.obj_palette_ram[(self.ocps & 0x3F) as usize] = value;
                if self.ocps & 0x80 != 0 {
                    self.ocps = 0x80 | (self.ocps.wrapping_add(1) & 0x3F);
                }
            }
            _ => self.memory[address as usize] = value,
        }
    }

    pub fn hl(&self) -> u16 {
        u16::from_be_bytes([self.h, self.l])
    }

    fn set_hl(&mut self, value: u16) {
        [self.h, self.l] = value.to_be_bytes();
    }

    fn pair(&self, index: u8, stack: bool) -> u16 {
        match index {
            0 => u16::from_be_bytes([self.b, self.c]),
            1 => u16::from_be_bytes([self.d, self.e]),
            2 => self.hl(),
            _ if stack => u16::from_be_bytes([self.a, self.f]),
            _ => self.sp,
        }
    }

    fn set_pair(&mut self, index: u8, value: u16, stack: bool) {
        let [hi, lo] = value.to_be_bytes();
        match index {
            0 => [self.b, self.c] = [hi, lo],
            1 => [self.d, self.e] = [hi, lo],
            2 => self.set_hl(value),
            _ if stack => [self.a, self.f] = [hi, lo & 0xF0],
            _ => self.sp = value,
        }
    }

    fn reg(&self, index: u8) -> u8 {
        match index {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => self.read(self.hl()),
            _ => self.a,
        }
    }

    fn set_reg(&mut self, index: u8, value: u8) {
        match index {
            0 => self.b = value,
            1 => self.c = value,
            2 => self.d = value,
            3 => self.e = value,
            4 => self.h = value,
            5 => self.l = value,
            6 => self.write(self.hl(), value),
            _ => self.a = value,
        }
    }

    pub fn push16(&mut self, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.sp = self.sp.wrapping_sub(1);
        self.write(self.sp, hi);
        self.sp = self.sp.wrapping_sub(1);
        self.write(self.sp, lo);
    }

    pub fn pop16(&mut self) -> u16 {
        let lo = self.read(self.sp);
        self.sp = self.sp.wrapping_add(1);
        let hi = self.read(self.sp);
        self.sp = self.sp.wrapping_add(1);
        u16::from_be_bytes([hi, lo])
    }

    fn fetch(&mut self) -> u8 {
        let byte = self.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        byte
    }

    fn fetch16(&mut self) -> u16 {
        let lo = self.fetch();
        let hi = self.fetch();
        u16::from_le_bytes([lo, hi])
    }

    fn flag(&self, mask: u8) -> bool {
        self.f & mask != 0
    }

    fn condition(&self, cc: u8) -> bool {
        match cc & 3 {
            0 => !self.flag(FLAG_Z),
            1 => self.flag(FLAG_Z),
            2 => !self.flag(FLAG_C),
            _ => self.flag(FLAG_C),
        }
    }

    fn alu(&mut self, op: u8, value: u8) -> Result<(), String> {
        let a = self.a;
        let (result, flags) = match op {
            0 => {
                let (r, carry) = a.overflowing_add(value);
                (r, if carry { FLAG_C } else { 0 })
            }
            2 | 7 => {
                let r = a.wrapping_sub(value);
                (r, FLAG_N | if a < value { FLAG_C } else { 0 })
            }
            4 => (a & value, FLAG_H),
            5 => (a ^ value, 0),
            6 => (a | value, 0),
            _ => return Err(format!("ALU op {} not modeled", op)),
        };
        self.f = flags | if result == 0 { FLAG_Z } else { 0 };
        if op != 7 {
            self.a = result;
        }
        Ok(())
    }

    /// Execute one instruction
    pub fn step(&mut self) -> Result<(), String> {
        let at = self.pc;

        if self.stubs.contains(&at) {
            self.stub_calls.push(at);
            self.pc = self.pop16();
            return Ok(());
        }

        let opcode = self.fetch();
        self.steps += 1;

        match opcode {
            0x00 | 0xF3 | 0xFB => {}
            0x76 => return Err(format!("HALT at {:#06x}", at)),
            0x01 | 0x11 | 0x21 | 0x31 => {
                let value = self.fetch16();
                self.set_pair(opcode >> 4, value, false);
            }
            0x02 => self.write(self.pair(0, false), self.a),
            0x12 => self.write(self.pair(1, false), self.a),
            0x0A => self.a = self.read(self.pair(0, false)),
            0x1A => self.a = self.read(self.pair(1, false)),
            0x22 => {
                let hl = self.hl();
                self.write(hl, self.a);
                self.set_hl(hl.wrapping_add(1));
            }
            0x2A => {
                let hl = self.hl();
                self.a = self.read(hl);
                self.set_hl(hl.wrapping_add(1));
            }
            op if op & 0xC7 == 0x03 => {
                let index = (op >> 4) & 3;
                let value = self.pair(index, false);
                let value = if op & 0x08 == 0 {
                    value.wrapping_add(1)
                } else {
                    value.wrapping_sub(1)
                };
                self.set_pair(index, value, false);
            }
            op if op & 0xCF == 0x09 => {
                let (sum, carry) = self.hl().overflowing_add(self.pair((op >> 4) & 3, false));
                self.set_hl(sum);
                self.f = (self.f & FLAG_Z) | if carry { FLAG_C } else { 0 };
            }
            op if op < 0x40 && op & 0x07 == 0x04 => {
                let r = (op >> 3) & 7;
                let value = self.reg(r).wrapping_add(1);
                self.set_reg(r, value);
                self.f = (self.f & FLAG_C)
                    | if value == 0 { FLAG_Z } else { 0 }
                    | if value & 0x0F == 0 { FLAG_H } else { 0 };
            }
            op if op < 0x40 && op & 0x07 == 0x05 => {
                let r = (op >> 3) & 7;
                let value = self.reg(r).wrapping_sub(1);
                self.set_reg(r, value);
                self.f = (self.f & FLAG_C)
                    | FLAG_N
                    | if value == 0 { FLAG_Z } else { 0 }
                    | if value & 0x0F == 0x0F { FLAG_H } else { 0 };
            }
            op if op < 0x40 && op & 0x07 == 0x06 => {
                let value = self.fetch();
                self.set_reg((op >> 3) & 7, value);
            }
            0x18 => {
                let disp = self.fetch() as i8;
                self.pc = self.pc.wrapping_add(disp as i16 as u16);
            }
            op if op & 0xE7 == 0x20 => {
                let disp = self.fetch() as i8;
                if self.condition(op >> 3) {
                    self.pc = self.pc.wrapping_add(disp as i16 as u16);
                }
            }
            0x40..=0x7F => {
                let value = self.reg(opcode & 7);
                self.set_reg((opcode >> 3) & 7, value);
            }
            0x80..=0xBF => {
                let value = self.reg(opcode & 7);
                self.alu((opcode >> 3) & 7, value)?;
            }
            op if op & 0xC7 == 0xC6 => {
                let value = self.fetch();
                self.alu((op >> 3) & 7, value)?;
            }
            op if op & 0xCF == 0xC5 => {
                let value = self.pair((op >> 4) & 3, true);
                self.push16(value);
            }
            op if op & 0xCF == 0xC1 => {
                let value = self.pop16();
                self.set_pair((op >> 4) & 3, value, true);
            }
            0xC3 => self.pc = self.fetch16(),
            op if op & 0xE7 == 0xC2 => {
                let target = self.fetch16();
                if self.condition(op >> 3) {
                    self.pc = target;
                }
            }
            0xCD => {
                let target = self.fetch16();
                self.push16(self.pc);
                self.pc = target;
            }
            0xC9 => self.pc = self.pop16(),
            op if op & 0xE7 == 0xC0 => {
                if self.condition(op >> 3) {
                    self.pc = self.pop16();
                }
            }
            0xE0 => {
                let port = 0xFF00 | self.fetch() as u16;
                self.write(port, self.a);
            }
            0xF0 => {
                let port = 0xFF00 | self.fetch() as u16;
                self.a = self.read(port);
            }
            0xEA => {
                let address = self.fetch16();
                self.write(address, self.a);
            }
            0xFA => {
                let address = self.fetch16();
                self.a = self.read(address);
            }
            _ => return Err(format!("opcode {:02X} at {:#06x} not modeled", opcode, at)),
        }
        Ok(())
    }

    /// Call `entry` as a subroutine and run until it returns
    pub fn call(&mut self, entry: u16) -> Result<(), String> {
        let sp = self.sp;
        self.push16(RETURN_SENTINEL);
        self.pc = entry;
        self.run_until(RETURN_SENTINEL)?;
        if self.sp != sp {
            return Err(format!("stack unbalanced: {:#06x} -> {:#06x}", sp, self.sp));
        }
        Ok(())
    }

    /// Run from `entry` until the program counter reaches `stop`
    pub fn run(&mut self, entry: u16, stop: u16) -> Result<(), String> {
        self.pc = entry;
        self.run_until(stop)
    }

    fn run_until(&mut self, stop: u16) -> Result<(), String> {
        for _ in 0..STEP_LIMIT {
            if self.pc == stop {
                return Ok(());
            }
            self.step()?;
        }
        Err(format!("no exit after {} steps, pc={:#06x}", STEP_LIMIT, self.pc))
    }
}

impl Default for MockCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Blank banked ROM with the usual `NOP; JP $0150` entry
pub fn blank_rom(banks: usize) -> Vec<u8> {
    let mut rom = vec![0xFFu8; banks * 0x4000];
    rom[0x0100..0x0104].copy_from_slice(&[0x00, 0xC3, 0x50, 0x01]);
    rom[0x0134..0x0150].fill(0x00);
    rom[0x0134..0x013F].copy_from_slice(b"TESTPATCHER");
    rom[0x0147] = 0x01;
    rom[0x0148] = match banks {
        2 => 0x00,
        4 => 0x01,
        8 => 0x02,
        16 => 0x03,
        _ => 0x04,
    };
    rom
}
