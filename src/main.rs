use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use wasm2cs::Config;

/// Translate a Go-compiled WebAssembly module into C# source files.
#[derive(Parser)]
#[command(name = "wasm2cs", version)]
struct Cli {
    /// The WebAssembly module to translate
    #[arg(value_name = "MODULE")]
    module: PathBuf,

    /// Directory the C# units are written to
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,

    /// Namespace of the generated classes
    #[arg(long, default_value = "Wasm")]
    namespace: String,

    /// Defined functions per generated file
    #[arg(long, default_value_t = 64)]
    group_size: usize,

    /// Worker threads; defaults to one per CPU
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Skip Mem.cs and Import.cs
    #[arg(long)]
    no_runtime: bool,

    /// Replace an import's body with the C# in FILE
    #[arg(long = "override", value_name = "NAME=FILE")]
    overrides: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = Config::default()
        .namespace(cli.namespace)
        .out_dir(&cli.out_dir)
        .group_size(cli.group_size)
        .runtime_support(!cli.no_runtime);
    if let Some(jobs) = cli.jobs {
        config = config.threads(jobs);
    }
    for pair in &cli.overrides {
        let (name, file) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("override {pair:?} is not of the form NAME=FILE"))?;
        let body = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read override body: {file}"))?;
        config = config.override_import(name, body);
    }

    let bytes = std::fs::read(&cli.module)
        .with_context(|| format!("failed to read Wasm module: {}", cli.module.display()))?;
    let paths = wasm2cs::translate(&bytes, &config)?;
    for path in paths {
        println!("{}", path.display());
    }
    Ok(())
}
