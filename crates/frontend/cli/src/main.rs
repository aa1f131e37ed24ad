use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crater_core::logging::{LogCategory, LogLevel, LogConfig};
use crater_gg::{GameGear, Rom, Save};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

#[derive(Parser)]
#[command(name = "crater", about = "Sega Game Gear emulator and Z80 toolchain")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args)]
struct LoggingArgs {
    /// Global log level (off, error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// CPU log level (trace enables instruction tracing)
    #[arg(long, global = true)]
    log_cpu: Option<String>,

    /// Bus/mapper log level
    #[arg(long, global = true)]
    log_bus: Option<String>,

    /// VDP log level
    #[arg(long, global = true)]
    log_vdp: Option<String>,

    /// PSG log level
    #[arg(long, global = true)]
    log_psg: Option<String>,

    /// Interrupt log level
    #[arg(long, global = true)]
    log_interrupts: Option<String>,

    /// Assembler/disassembler log level
    #[arg(long, global = true)]
    log_asm: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a ROM image headlessly
    Run {
        /// Path to the ROM image
        rom: PathBuf,

        /// Path for persistent cartridge RAM
        #[arg(long)]
        save: Option<PathBuf>,

        /// Stop after this many frames (0 runs until SIGINT)
        #[arg(long, default_value_t = 0)]
        frames: u64,

        /// Write a JSON machine-state dump on exit
        #[arg(long)]
        dump: Option<PathBuf>,

        /// Suppress the exit status line
        #[arg(long, default_value_t = false)]
        quiet: bool,
    },

    /// Print ROM header information
    Info {
        /// Path to the ROM image
        rom: PathBuf,

        /// Emit machine-readable JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Disassemble a ROM image into Z80 source
    Disasm {
        /// Path to the ROM image
        rom: PathBuf,
        /// Destination source file
        output: PathBuf,
    },

    /// Assemble Z80 source into a ROM image
    Asm {
        /// Source file
        source: PathBuf,
        /// Destination ROM image
        output: PathBuf,
    },
}

fn apply_logging(args: &LoggingArgs) -> Result<()> {
    let config = LogConfig::global();
    let pairs = [
        (&args.log_cpu, Some(LogCategory::Cpu)),
        (&args.log_bus, Some(LogCategory::Bus)),
        (&args.log_vdp, Some(LogCategory::Vdp)),
        (&args.log_psg, Some(LogCategory::Psg)),
        (&args.log_interrupts, Some(LogCategory::Interrupts)),
        (&args.log_asm, Some(LogCategory::Asm)),
        (&args.log_level, None),
    ];
    for (value, category) in pairs {
        if let Some(text) = value {
            let level = LogLevel::parse(text)
                .with_context(|| format!("unrecognized log level '{}'", text))?;
            match category {
                Some(category) => config.set_level(category, level),
                None => config.set_global_level(level),
            }
        }
    }
    Ok(())
}

fn run(
    rom_path: PathBuf,
    save_path: Option<PathBuf>,
    frames: u64,
    dump: Option<PathBuf>,
    quiet: bool,
) -> Result<()> {
    let rom = Rom::open(&rom_path)
        .with_context(|| format!("couldn't load ROM image '{}'", rom_path.display()))?;

    let mut gg = GameGear::new();
    gg.load_rom(&rom);

    if let Some(save_path) = save_path {
        let save = Save::init(&save_path, &rom)
            .with_context(|| format!("couldn't load save file '{}'", save_path.display()))?;
        gg.load_save(save);
    }

    // The SIGINT hook flips the power flag and nothing else; the frame
    // loop notices at its next boundary.
    let power = gg.power_handle();
    ctrlc::set_handler(move || {
        power.store(false, Ordering::SeqCst);
    })
    .context("couldn't install the SIGINT handler")?;

    let mut frame_count = 0u64;
    gg.simulate(|gg| {
        frame_count += 1;
        if frames != 0 && frame_count >= frames {
            gg.power_off();
        }
    });

    if !quiet {
        match gg.exception_message() {
            Some(message) => eprintln!("caught exception: {}", message),
            None => eprintln!("stopped after {} frames", frame_count),
        }
    }

    if let Some(dump_path) = dump {
        let state = gg.debug_state();
        let mut file = File::create(&dump_path)
            .with_context(|| format!("couldn't create '{}'", dump_path.display()))?;
        writeln!(file, "{}", serde_json::to_string_pretty(&state)?)?;
    }

    if gg.exception_message().is_some() {
        anyhow::bail!("emulation stopped on a machine exception");
    }
    Ok(())
}

fn info(rom_path: PathBuf, json: bool) -> Result<()> {
    let rom = Rom::open(&rom_path)
        .with_context(|| format!("couldn't load ROM image '{}'", rom_path.display()))?;
    let info = rom.info();

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("{}:", info.name);
    if info.checksum_valid {
        println!("  checksum:      0x{:04X} (valid)", info.reported_checksum);
    } else {
        println!(
            "  checksum:      0x{:04X} (invalid, expected 0x{:04X})",
            info.reported_checksum, info.expected_checksum
        );
    }
    println!(
        "  product code:  {} ({})",
        info.product_code,
        info.product.as_deref().unwrap_or("unknown")
    );
    println!("  version:       {}", info.version);
    println!(
        "  region code:   {} ({})",
        info.region_code,
        info.region.unwrap_or("unknown")
    );
    println!("  size:          {} bytes", info.size);
    Ok(())
}

fn disasm(rom_path: PathBuf, output: PathBuf) -> Result<()> {
    let rom = Rom::open(&rom_path)
        .with_context(|| format!("couldn't load ROM image '{}'", rom_path.display()))?;
    let source = crater_asm::disassemble(&rom);
    std::fs::write(&output, source)
        .with_context(|| format!("couldn't write '{}'", output.display()))?;
    log::info!("disassembled {} -> {}", rom_path.display(), output.display());
    Ok(())
}

fn asm(source_path: PathBuf, output: PathBuf) -> Result<()> {
    let source = std::fs::read_to_string(&source_path)
        .with_context(|| format!("couldn't read '{}'", source_path.display()))?;
    let image = crater_asm::assemble(&source)
        .map_err(|err| anyhow::anyhow!("{}: {}", source_path.display(), err))?;
    std::fs::write(&output, image)
        .with_context(|| format!("couldn't write '{}'", output.display()))?;
    log::info!("assembled {} -> {}", source_path.display(), output.display());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    apply_logging(&cli.logging)?;

    match cli.command {
        Command::Run {
            rom,
            save,
            frames,
            dump,
            quiet,
        } => run(rom, save, frames, dump, quiet),
        Command::Info { rom, json } => info(rom, json),
        Command::Disasm { rom, output } => disasm(rom, output),
        Command::Asm { source, output } => asm(source, output),
    }
}
