//! Command-line surface (spec.md §4.12, ambient): `run`, `config`,
//! `replay-features`. Grounded on the teacher's `main.rs` `Cli`/`Commands`
//! derive-based layout.

pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "momentum-strategy-engine", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the strategy engine against wired-up event sources.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the loaded, secret-masked configuration and exit.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Read a previously written feature log and print summary statistics.
    ReplayFeatures {
        path: PathBuf,
    },
}
