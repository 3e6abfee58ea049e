#[cfg(not(feature = "cli"))]
compile_error!("The `isam` binary requires the `cli` feature. Build with `--features cli`.");

use std::fs::File;
use std::io::Write;
use std::process;

use clap::Parser;

use isam::cli;
use isam::cli::app::{Cli, ColorMode, Commands};
use isam::IsamError;

fn main() {
    let cli = Cli::parse();

    match cli.color {
        ColorMode::Always => colored::control::set_override(true),
        ColorMode::Never => colored::control::set_override(false),
        ColorMode::Auto => {}
    }

    let writer_result: Result<Box<dyn Write>, IsamError> = match &cli.output {
        Some(path) => File::create(path)
            .map(|f| Box::new(f) as Box<dyn Write>)
            .map_err(|e| IsamError::Io(format!("Cannot create {}: {}", path, e))),
        None => Ok(Box::new(std::io::stdout()) as Box<dyn Write>),
    };

    let mut writer = match writer_result {
        Ok(w) => w,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Dump { file, pages, keys, page } => cli::dump::execute(
            &cli::dump::DumpOptions { file, pages, keys, page },
            &mut writer,
        ),

        Commands::Check { file, fix } => {
            match cli::check::execute(&cli::check::CheckOptions { file, fix }, &mut writer) {
                Ok(true) => Ok(()),
                Ok(false) => process::exit(2),
                Err(e) => Err(e),
            }
        }

        Commands::Info { file, json } => {
            cli::info::execute(&cli::info::InfoOptions { file, json }, &mut writer)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
