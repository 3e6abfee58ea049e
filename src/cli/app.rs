use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "isam")]
#[command(about = "BT64 / NDX index file toolkit")]
#[command(version)]
pub struct Cli {
    /// Control colored output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Write output to a file instead of stdout
    #[arg(short, long, global = true)]
    pub output: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Walk an index and print every level and leaf
    Dump {
        /// Path to the index file
        file: String,

        /// Dump raw pages as well (NDX)
        #[arg(short, long)]
        pages: bool,

        /// Dump decoded keys per page (NDX)
        #[arg(short, long)]
        keys: bool,

        /// Dump a single page by number (NDX)
        #[arg(long)]
        page: Option<u32>,
    },

    /// Run the integrity checker
    Check {
        /// Path to the index file
        file: String,

        /// Repair header counters the file length proves wrong
        #[arg(long)]
        fix: bool,
    },

    /// Print the header summary
    Info {
        /// Path to the index file
        file: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}
