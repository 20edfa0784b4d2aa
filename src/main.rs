use anyhow::{bail, Result};
use clap::Parser;
use log::info;
use std::io;
use std::path;

use opcheck::color::ColorMode;
use opcheck::ops::{register_standard_schemas, standard_registry};
use opcheck::pprint::pprint;
use opcheck::runtime::{Runtime, RuntimeConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Specification file to validate against the reference operations
    spec: path::PathBuf,

    #[command(flatten)]
    runtime: RuntimeConfig,

    /// Check each operation call against its schema
    #[arg(long)]
    validate_schema: bool,

    /// Color mode
    #[arg(long, value_enum, default_value_t = ColorMode::Auto)]
    color: ColorMode,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut registry = standard_registry();
    if args.validate_schema {
        register_standard_schemas(&mut registry)?;
        registry.validate_schema(true);
    }

    let mut runtime = Runtime::new(registry, args.runtime);
    runtime.parse_et_file(&args.spec)?;
    info!("Loaded {}:\n{}", args.spec.display(), runtime);

    let records = runtime.validate_all(&mut io::stdout().lock())?;
    pprint(&records, args.color.enabled());

    let failed = records.iter().filter(|r| !r.passed()).count();
    if failed > 0 {
        bail!(
            "{failed} of {} rank assignments failed validation",
            records.len()
        );
    }
    Ok(())
}
