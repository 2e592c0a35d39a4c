use anyhow::{Context, Result};
use cosmold::archive;
use cosmold::link::{self, Libc, LinkOptions};
use cosmold::nm::{self, NmFormat};
use cosmold::objdump;
use cosmold::strip::{self, StripMode};
use log::LevelFilter;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(
    name = "cosmold",
    about = "Static ELF64 linker with archive and inspection utilities"
)]
struct Opt {
    /// More output; repeat for debug output
    #[structopt(short = "v", parse(from_occurrences), global = true)]
    verbose: u8,

    /// Errors only
    #[structopt(short = "q", long = "quiet", global = true)]
    quiet: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Link relocatable objects and archives into an executable
    Link(LinkArgs),

    /// Create, list and modify static archives
    Ar(ArCommand),

    /// List symbols
    Nm(NmArgs),

    /// Dump sections, symbols and relocations
    Objdump(ObjdumpArgs),

    /// Remove symbol or debug sections
    Strip(StripArgs),
}

#[derive(StructOpt)]
struct LinkArgs {
    /// Input object files and archives
    #[structopt(parse(from_os_str), required = true)]
    inputs: Vec<PathBuf>,

    /// Output executable path
    #[structopt(short = "o", parse(from_os_str))]
    output: PathBuf,

    /// Add a library search directory
    #[structopt(short = "L", parse(from_os_str), number_of_values = 1)]
    search_dirs: Vec<PathBuf>,

    /// Link against libNAME.a
    #[structopt(short = "l", number_of_values = 1)]
    libraries: Vec<String>,

    /// libc backend (only `cosmo' is implemented)
    #[structopt(long = "libc", default_value = "cosmo")]
    libc: Libc,

    /// Drop objects not reachable from the entry point
    #[structopt(long = "gc-sections")]
    gc_sections: bool,

    /// Print the resolved symbol table
    #[structopt(long = "dump-symbols")]
    dump_symbols: bool,

    /// Print the sorted relocation batch
    #[structopt(long = "dump-relocations")]
    dump_relocations: bool,

    /// Trace archive extraction rounds
    #[structopt(long = "trace-resolve")]
    trace_resolve: bool,
}

#[derive(StructOpt)]
enum ArCommand {
    /// Create an archive from object files
    Create {
        #[structopt(parse(from_os_str))]
        archive: PathBuf,
        #[structopt(parse(from_os_str), required = true)]
        inputs: Vec<PathBuf>,
    },

    /// List archive members
    List {
        #[structopt(parse(from_os_str))]
        archive: PathBuf,
        /// Show modes, sizes and dates too
        #[structopt(short = "v")]
        verbose: bool,
    },

    /// Extract members (all of them by default)
    Extract {
        #[structopt(parse(from_os_str))]
        archive: PathBuf,
        members: Vec<String>,
        /// Directory to extract into
        #[structopt(short = "C", parse(from_os_str), default_value = ".")]
        directory: PathBuf,
    },

    /// Delete one member
    Delete {
        #[structopt(parse(from_os_str))]
        archive: PathBuf,
        member: String,
    },

    /// Print the symbol index the linker would use
    Index {
        #[structopt(parse(from_os_str))]
        archive: PathBuf,
    },
}

#[derive(StructOpt)]
struct NmArgs {
    /// Input files
    #[structopt(parse(from_os_str), required = true)]
    inputs: Vec<PathBuf>,

    /// Output format: bsd, posix or sysv
    #[structopt(long = "format", short = "f", default_value = "bsd")]
    format: NmFormat,
}

#[derive(StructOpt)]
struct ObjdumpArgs {
    #[structopt(parse(from_os_str))]
    input: PathBuf,
}

#[derive(StructOpt)]
struct StripArgs {
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    /// Write the stripped file here instead of in place
    #[structopt(short = "o", parse(from_os_str))]
    output: Option<PathBuf>,

    /// Remove only debug sections
    #[structopt(long = "strip-debug")]
    strip_debug: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    // LINKER_DEBUG wins over everything the command line says
    let level = if std::env::var_os("LINKER_DEBUG").map_or(false, |v| !v.is_empty()) {
        LevelFilter::Trace
    } else if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        }
    };
    env_logger::Builder::new().filter_level(level).init();
}

fn run_ar(command: ArCommand) -> Result<()> {
    match command {
        ArCommand::Create { archive, inputs } => {
            let paths: Vec<&std::path::Path> = inputs.iter().map(|p| p.as_path()).collect();
            archive::create(&archive, &paths)?;
        }
        ArCommand::List { archive, verbose } => {
            for member in archive::list(&archive)? {
                if verbose {
                    println!(
                        "{:o} {}/{} {:>10} {:>12} {}",
                        member.mode, member.uid, member.gid, member.size, member.mtime, member.name
                    );
                } else {
                    println!("{}", member.name);
                }
            }
        }
        ArCommand::Extract {
            archive,
            members,
            directory,
        } => {
            if members.is_empty() {
                for name in archive::extract_all(&archive, &directory)? {
                    println!("x - {}", name);
                }
            } else {
                for name in &members {
                    archive::extract_member(&archive, name, &directory.join(name))?;
                    println!("x - {}", name);
                }
            }
        }
        ArCommand::Delete { archive, member } => {
            archive::delete_member(&archive, &member)?;
        }
        ArCommand::Index { archive } => {
            let data = std::fs::read(&archive)
                .with_context(|| format!("cannot read {}", archive.display()))?;
            let index = archive::build_index(&data, &archive.display().to_string())?;
            for entry in &index.entries {
                println!("{:<32} {}", entry.symbol, entry.member);
            }
        }
    }
    Ok(())
}

#[paw::main]
fn main(opt: Opt) -> Result<()> {
    init_logging(opt.verbose, opt.quiet);

    match opt.command {
        Command::Link(args) => {
            let mut options = LinkOptions::new(args.inputs, args.output);
            options.search_dirs = args.search_dirs;
            options.libraries = args.libraries;
            options.libc = args.libc;
            options.gc_sections = args.gc_sections;
            options.dump_symbols = args.dump_symbols;
            options.dump_relocations = args.dump_relocations;
            options.trace_resolve = args.trace_resolve;
            link::link(&options)?;
        }
        Command::Ar(command) => run_ar(command)?,
        Command::Nm(args) => {
            let many = args.inputs.len() > 1;
            for input in &args.inputs {
                if many {
                    println!("\n{}:", input.display());
                }
                print!("{}", nm::format_file(input, args.format)?);
            }
        }
        Command::Objdump(args) => {
            print!("{}", objdump::format_file(&args.input)?);
        }
        Command::Strip(args) => {
            let mode = if args.strip_debug {
                StripMode::Debug
            } else {
                StripMode::All
            };
            let output = args.output.clone().unwrap_or_else(|| args.input.clone());
            strip::strip(&args.input, &output, mode)?;
        }
    }
    Ok(())
}
