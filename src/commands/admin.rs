use std::path::PathBuf;

use anyhow::Result;

use tagdbx::{config::load_or_default, logging, TagEngine};

pub fn collections(config_path: Option<PathBuf>) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    logging::init(config.log_file.as_deref())?;
    let engine = TagEngine::open(&config)?;

    for (collection, meta) in engine.store().list_metas()? {
        let records = engine.store().records(&collection)?;
        let visible = records.iter().filter(|record| record.count > 0).count();
        let recalculated = meta
            .recalculated_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "collection={} database={} rule={} records={} visible={} recalculated_at={}",
            collection.name,
            collection.database,
            meta.rule,
            records.len(),
            visible,
            recalculated
        );
    }
    Ok(())
}

pub fn show_config(config_path: Option<PathBuf>) -> Result<()> {
    let (config, path) = load_or_default(config_path)?;
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
