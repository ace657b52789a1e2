#![crate_name = "chromapatch"]
#![allow(dead_code)]

#[macro_use]
extern crate lazy_static;

pub mod codegen;
pub mod config;
pub mod disassembler;
pub mod error;
pub mod free_space;
pub mod header;
pub mod hooks;
pub mod instruction;
pub mod ips;
pub mod opcode_tables;
pub mod palette;
pub mod patcher;
pub mod planner;
pub mod rom;

#[cfg(test)]
pub mod test_utils;

#[cfg(test)]
mod disassembler_tests;
#[cfg(test)]
mod planner_tests;

/*
Layout of a typical retrofit in a 256KiB cartridge
Bank 0  0000-00FF  restart and interrupt vectors
        0100-014F  entry point and cartridge header
        0150       entry code, boot hook site
        3E00-3FFF  pad run holding boot, frame and palette write stubs
Bank 0D 6D00       background palette set, 64 bytes
        6D40       object palette set, 64 bytes
        6D80       tile lookup table, 256 bytes (lookup mode only)
        ....       boot loader, frame entry, OAM rewriter
*/
