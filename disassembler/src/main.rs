use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use serde::{Deserialize, Serialize};

use ashen_script::disasm::{disassemble, Listing};
use ashen_script::registry::NativeRegistry;
use ashen_script::{compile, Program};

/// Sidecar written next to the listing so tooling can locate both halves.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub source_file: PathBuf,
    pub disassembly_file: PathBuf,
    pub event_count: usize,
    pub trigger_count: usize,
    pub global_count: usize,
}

/// Compile a script source file and dump a yaml instruction listing.
#[derive(ClapParser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, required = true)]
    input: PathBuf,

    #[arg(short, long, required = true)]
    output: PathBuf,
}

fn write_listing(
    input: &PathBuf,
    output: &PathBuf,
    program: &Program,
    listings: &[Listing],
) -> Result<()> {
    if !output.exists() {
        fs::create_dir_all(output)?;
    }

    let disassembly_path = output.join("disassembly.yaml");
    let writer = fs::File::create(disassembly_path)?;
    serde_yaml::to_writer(writer, listings)?;

    let manifest = ProjectManifest {
        source_file: input.clone(),
        disassembly_file: PathBuf::from("disassembly.yaml"),
        event_count: program.events.len(),
        trigger_count: program.triggers.len(),
        global_count: program.globals.len(),
    };
    let writer = fs::File::create(output.join("project.yaml"))?;
    serde_yaml::to_writer(writer, &manifest)?;

    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let source = fs::read_to_string(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    // Stand-alone disassembly has no host, so only the pure-language subset
    // of scripts compiles here; natives need the host's registry snapshot.
    let externs = NativeRegistry::new().externs();
    let program = compile(&source, &externs)
        .with_context(|| format!("compiling {}", args.input.display()))?;
    let listings = disassemble(&program, &externs)?;
    log::info!(
        "{}: {} events, {} listings",
        args.input.display(),
        program.events.len(),
        listings.len()
    );
    write_listing(&args.input, &args.output, &program, &listings)?;

    Ok(())
}
