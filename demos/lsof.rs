use std::fs::File;
use std::io::{self, BufWriter, Write};

use clap::{command, Arg, ArgAction, ArgGroup, ArgMatches};
use log::{error, info};
use simplelog::{ColorChoice, LevelFilter, TermLogger, TerminalMode};

use memflow::architecture::x86::x64;
use memflow::prelude::v1::*;

use memflow_lsof::{
    dump_lsof, KernelImage, LsofConfig, MemflowMemory, PointerWidth, Ramdump, SnapshotMemory,
    SymbolTable, TypeLayout,
};

fn main() -> Result<()> {
    let matches = command!()
        .about("Lists the open files of every task in a Linux kernel memory image")
        .arg(
            Arg::new("core")
                .long("core")
                .value_name("VMCORE")
                .help("ELF core file of the kernel"),
        )
        .arg(
            Arg::new("connector")
                .long("connector")
                .short('c')
                .value_name("NAME")
                .help("memflow connector providing physical memory"),
        )
        .arg(
            Arg::new("connector-args")
                .long("connector-args")
                .value_name("ARGS")
                .default_value(""),
        )
        .arg(
            Arg::new("dtb")
                .long("dtb")
                .value_name("ADDR")
                .requires("connector")
                .help("physical address of the kernel page tables (x64)"),
        )
        .group(
            ArgGroup::new("source")
                .args(["core", "connector"])
                .required(true),
        )
        .arg(Arg::new("vmlinux").long("vmlinux").value_name("FILE"))
        .arg(Arg::new("system-map").long("system-map").value_name("FILE"))
        .group(
            ArgGroup::new("symbols")
                .args(["vmlinux", "system-map"])
                .required(true),
        )
        .arg(
            Arg::new("layout")
                .long("layout")
                .value_name("FILE")
                .required(true)
                .help("structure offsets, one `type.field offset` per line"),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .short('o')
                .value_name("FILE"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count),
        )
        .get_matches();

    let level = match matches.get_count("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    TermLogger::init(
        level,
        simplelog::Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .ok();

    let layout = TypeLayout::parse(&String::from_utf8_lossy(&read_file(
        required(&matches, "layout")?,
    )?))?;
    if layout.is_empty() {
        error!("layout file has no entries");
        return Err(Error(ErrorOrigin::Args, ErrorKind::InvalidArgument));
    }

    let symbols = match matches.get_one::<String>("vmlinux") {
        Some(path) => SymbolTable::from_elf(&read_file(path)?)?,
        None => SymbolTable::from_system_map(&String::from_utf8_lossy(&read_file(
            required(&matches, "system-map")?,
        )?))?,
    };
    if symbols.is_empty() {
        error!("no symbols loaded");
        return Err(Error(ErrorOrigin::Args, ErrorKind::InvalidArgument));
    }

    let output = matches.get_one::<String>("output");

    if let Some(path) = matches.get_one::<String>("core") {
        let (mem, width) = SnapshotMemory::from_elf_core(&read_file(path)?)?;
        let mut dump = Ramdump::new(mem, layout, symbols, width)?;
        return run(&mut dump, output);
    }

    let dtb = required(&matches, "dtb")?;
    let dtb = u64::from_str_radix(dtb.trim_start_matches("0x"), 16).map_err(|_| {
        error!("invalid dtb: {}", dtb);
        Error(ErrorOrigin::Args, ErrorKind::InvalidArgument)
    })?;

    let mut inventory = Inventory::scan();

    let connector = inventory
        .builder()
        .connector(required(&matches, "connector")?)
        .args(required(&matches, "connector-args")?.parse()?)
        .build()?;

    let mem = VirtualDma::new(connector, x64::ARCH, x64::new_translator(Address::from(dtb)));

    let mut dump = Ramdump::new(MemflowMemory(mem), layout, symbols, PointerWidth::Bits64)?;

    run(&mut dump, output)
}

fn required<'a>(matches: &'a ArgMatches, id: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(id)
        .map(String::as_str)
        .ok_or(Error(ErrorOrigin::Args, ErrorKind::InvalidArgument))
}

fn read_file(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        error!("unable to read {}: {}", path, e);
        Error(ErrorOrigin::Other, ErrorKind::UnableToReadFile)
    })
}

fn run<I: KernelImage>(dump: &mut I, output: Option<&String>) -> Result<()> {
    let config = LsofConfig::default();

    match output {
        Some(path) => {
            let file = File::create(path).map_err(|e| {
                error!("unable to create {}: {}", path, e);
                Error(ErrorOrigin::Other, ErrorKind::UnableToWriteFile)
            })?;
            let mut out = BufWriter::new(file);
            dump_lsof(dump, &config, &mut out)?;
            out.flush()
                .map_err(|_| Error(ErrorOrigin::Other, ErrorKind::UnableToWriteFile))?;
            info!("report written to {}", path);
            Ok(())
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            dump_lsof(dump, &config, &mut out)
        }
    }
}
