use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use tagdbx::{config::load_or_default, logging, AutocompleteOptions, TagEngine};

#[derive(Args)]
pub struct QueryArgs {
    /// Entity type the rule belongs to
    pub entity: String,

    /// Rule name or context name to query
    pub rule: String,

    /// Restrict the result to one group bucket
    #[arg(long)]
    pub group: Option<String>,
}

#[derive(Args)]
pub struct AutocompleteArgs {
    /// Entity type the rule belongs to
    pub entity: String,

    /// Rule name or context name to query
    pub rule: String,

    /// Tag prefix to match
    pub prefix: String,

    /// Order results by descending count
    #[arg(long)]
    pub sort_by_count: bool,

    /// Cap the number of results; 0 means unlimited
    #[arg(long, default_value_t = 0)]
    pub max: i64,
}

pub fn tags(config_path: Option<PathBuf>, args: QueryArgs) -> Result<()> {
    let engine = open_engine(config_path)?;
    let registry = engine.registry(&args.entity)?;
    for tag in registry.tags_for(&args.rule, args.group.as_deref())? {
        println!("{tag}");
    }
    Ok(())
}

pub fn weights(config_path: Option<PathBuf>, args: QueryArgs) -> Result<()> {
    let engine = open_engine(config_path)?;
    let registry = engine.registry(&args.entity)?;
    for (tag, count) in registry.tags_with_weight_for(&args.rule, args.group.as_deref())? {
        println!("tag={tag} count={count}");
    }
    Ok(())
}

pub fn autocomplete(config_path: Option<PathBuf>, args: AutocompleteArgs) -> Result<()> {
    let engine = open_engine(config_path)?;
    let registry = engine.registry(&args.entity)?;
    let options = AutocompleteOptions {
        sort_by_count: args.sort_by_count,
        max: args.max,
    };
    for (tag, count) in registry.autocomplete_for(&args.rule, &args.prefix, options)? {
        println!("tag={tag} count={count}");
    }
    Ok(())
}

fn open_engine(config_path: Option<PathBuf>) -> Result<TagEngine> {
    let (config, _) = load_or_default(config_path)?;
    logging::init(config.log_file.as_deref())?;
    Ok(TagEngine::open(&config)?)
}
