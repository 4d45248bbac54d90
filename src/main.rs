mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{
    admin,
    query::{self, AutocompleteArgs, QueryArgs},
};

#[derive(Parser)]
#[command(author, version, about = "tagdbx aggregate inspection CLI")]
struct Cli {
    /// Path to the configuration file. Defaults to ~/.config/tagdbx/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the visible tags of a rule
    Tags(QueryArgs),
    /// List the visible tags of a rule with their counts
    Weights(QueryArgs),
    /// Prefix-search the visible tags of a real-time rule
    Autocomplete(AutocompleteArgs),
    /// List every backing collection with its bookkeeping record
    Collections,
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    match command {
        Commands::Tags(args) => query::tags(config, args)?,
        Commands::Weights(args) => query::weights(config, args)?,
        Commands::Autocomplete(args) => query::autocomplete(config, args)?,
        Commands::Collections => admin::collections(config)?,
        Commands::Config => admin::show_config(config)?,
    }

    Ok(())
}
