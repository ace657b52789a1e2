use chromapatch::rom::{BankedAddress, RomImage};
use log::debug;
use std::env;
use std::path::Path;

fn parse_hex(text: &str) -> Result<u16, String> {
    u16::from_str_radix(text.trim_start_matches("0x"), 16).map_err(|_| format!("Invalid hex value: {}", text))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <rom> <bank>:<addr> [max_bytes] [--trace end]", args[0]);
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  {} penta.gb 00:0824 0x40", args[0]);
        eprintln!("  {} penta.gb 00:0150 --trace 0x0400", args[0]);
        std::process::exit(1);
    }

    let rom = RomImage::load(Path::new(&args[1]))?;
    let start = BankedAddress::parse(&args[2])?;
    debug!("Loaded {} bytes, {} banks", rom.len(), rom.bank_count());

    let mut max_bytes = 0x40usize;
    let mut trace_end = None;
    let mut i = 3;
    while i < args.len() {
        match args[i].as_str() {
            "--trace" => {
                i += 1;
                let end = args.get(i).ok_or("--trace needs an end address")?;
                trace_end = Some(parse_hex(end)?);
            }
            arg => max_bytes = parse_hex(arg)? as usize,
        }
        i += 1;
    }

    println!("{}", rom.header()?);

    let disasm = rom.disassembler(start.bank)?;
    match trace_end {
        Some(end) => {
            let graph = disasm.trace_region(start.address, end);
            println!("Calls in {}-{:04X}:", start, end);
            for (from, to) in &graph.calls {
                println!("  {:04X} -> {:04X}", from, to);
            }
            println!("Jumps:");
            for (from, to) in &graph.jumps {
                println!("  {:04X} -> {:04X}", from, to);
            }
        }
        None => print!("{}", disasm.format_listing(start.address, max_bytes)),
    }

    Ok(())
}
