use chromapatch::config::PlanConfig;
use chromapatch::error::PatchError;
use chromapatch::free_space::{find_free_space, DEFAULT_PAD_BYTES};
use chromapatch::ips::build_ips;
use chromapatch::patcher::Patcher;
use chromapatch::planner::PatchPlanner;
use chromapatch::rom::RomImage;
use log::{debug, info};
use std::env;
use std::fs;
use std::path::PathBuf;

struct Options {
    rom: PathBuf,
    config: Option<PathBuf>,
    output: Option<PathBuf>,
    ips: Option<PathBuf>,
    dry_run: bool,
    keep_global_checksum: bool,
    list_free: Option<usize>,
}

fn usage(program: &str) {
    eprintln!("chromapatch - Game Boy Color palette retrofit patcher");
    eprintln!();
    eprintln!(
        "Usage: {} <rom> --config <plan.toml> --output <out.gbc> [--ips <out.ips>] [--dry-run]",
        program
    );
    eprintln!("       {} <rom> --list-free [min_len]", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <file>         TOML plan describing palettes, OAM rewrite and hooks");
    eprintln!("  --output <file>         Where to write the patched ROM");
    eprintln!("  --ips <file>            Also write the changes as an IPS patch");
    eprintln!("  --dry-run               Plan and apply in memory only; write nothing");
    eprintln!("  --keep-global-checksum  Leave the global checksum as it was");
    eprintln!("  --list-free [min_len]   List pad byte runs of at least min_len bytes (hex, default 0x100)");
}

fn take_value(args: &[String], i: &mut usize) -> Result<PathBuf, String> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .map(PathBuf::from)
        .ok_or_else(|| format!("{} needs a value", flag))
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        rom: PathBuf::new(),
        config: None,
        output: None,
        ips: None,
        dry_run: false,
        keep_global_checksum: false,
        list_free: None,
    };
    let mut rom = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => options.config = Some(take_value(args, &mut i)?),
            "--output" | "-o" => options.output = Some(take_value(args, &mut i)?),
            "--ips" => options.ips = Some(take_value(args, &mut i)?),
            "--dry-run" => options.dry_run = true,
            "--keep-global-checksum" => options.keep_global_checksum = true,
            "--list-free" => {
                let min_len = match args.get(i + 1) {
                    Some(arg) if !arg.starts_with('-') => {
                        i += 1;
                        usize::from_str_radix(arg.trim_start_matches("0x"), 16)
                            .map_err(|_| format!("Invalid length: {}", arg))?
                    }
                    _ => 0x100,
                };
                options.list_free = Some(min_len);
            }
            arg if !arg.starts_with('-') && rom.is_none() => rom = Some(PathBuf::from(arg)),
            arg => return Err(format!("Unknown option: {}", arg)),
        }
        i += 1;
    }

    options.rom = rom.ok_or_else(|| "No ROM file given".to_string())?;
    if options.list_free.is_none() {
        if options.config.is_none() {
            return Err("--config is required".to_string());
        }
        if options.output.is_none() && !options.dry_run {
            return Err("--output is required unless --dry-run is given".to_string());
        }
    }
    Ok(options)
}

fn list_free(rom: &RomImage, min_len: usize) {
    let regions = find_free_space(rom, min_len, &DEFAULT_PAD_BYTES);
    println!("{} free regions of at least {:#x} bytes:", regions.len(), min_len);
    for region in regions {
        println!("  {}", region);
    }
}

fn run(options: &Options) -> Result<(), PatchError> {
    let original = RomImage::load(&options.rom)?;
    debug!("Loaded {} banks from {}", original.bank_count(), options.rom.display());

    if let Some(min_len) = options.list_free {
        list_free(&original, min_len);
        return Ok(());
    }

    let config_path = options
        .config
        .as_ref()
        .ok_or_else(|| PatchError::Config("no plan file".to_string()))?;
    let config = PlanConfig::load(config_path)?;
    let planner = PatchPlanner::new(config.catalogue()?);
    let plan = planner.plan(&original, &config.request()?)?;
    println!("{}", plan);

    let mut patched = original.clone();
    let patcher = Patcher {
        update_global_checksum: !options.keep_global_checksum,
    };
    let report = patcher.apply(&mut patched, &plan)?;
    println!("{}", report);

    // output files are only written once every step has succeeded
    let ips = match &options.ips {
        Some(_) => Some(build_ips(original.as_bytes(), patched.as_bytes())?),
        None => None,
    };
    if options.dry_run {
        info!("Dry run, nothing written");
        return Ok(());
    }
    if let Some(output) = &options.output {
        patched.save(output)?;
        info!("Wrote {}", output.display());
    }
    if let (Some(path), Some(bytes)) = (&options.ips, ips) {
        fs::write(path, bytes)?;
        info!("Wrote {}", path.display());
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.iter().any(|a| a == "-h" || a == "--help") {
        usage(&args[0]);
        std::process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            eprintln!("Try '{} --help' for help", args[0]);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&options) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
