use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    context::ContextSpec,
    error::{Result, TagError},
    rule::{CollectionRef, RuleOptions},
};

pub const DEFAULT_CACHE_CAPACITY: usize = 1_024;
const CONFIG_DIR: &str = ".config/tagdbx";
const CONFIG_FILE: &str = "config.toml";

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// Engine configuration: where counts live, how large the read cache is,
/// and the declared entity types with their tag contexts and aggregation
/// rules. Rules are validated when the engine is built, not when the
/// file is parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default, rename = "entity")]
    pub entities: Vec<EntityConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            log_file: None,
            entities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, rename = "context")]
    pub contexts: Vec<ContextConfig>,
    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
}

/// One `[[entity.rule]]` block. An empty `contexts` list declares the
/// rule for every context of the entity type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<CollectionRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn counts_path(&self) -> PathBuf {
        self.data_dir.join("counts")
    }
}

impl ContextConfig {
    pub fn to_spec(&self) -> ContextSpec {
        ContextSpec {
            name: self.name.clone(),
            field: self.field.clone(),
            separator: self.separator.clone(),
        }
    }
}

impl RuleConfig {
    pub fn to_options(&self) -> RuleOptions {
        RuleOptions {
            name: self.name.clone(),
            strategy: self.strategy.clone(),
            group_by: self.group_by.clone(),
            scope: self.scope.clone(),
            collection: self.collection.clone(),
            collection_name: self.collection_name.clone(),
            database: self.database.clone(),
        }
    }
}

/// Loads the configuration from the given path, or from the default
/// location, falling back to defaults when no file exists. Returns the
/// path it settled on so callers can report it.
pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };
    if path.exists() {
        Ok((Config::load(&path)?, path))
    } else {
        Ok((Config::default(), path))
    }
}

fn default_config_path() -> Result<PathBuf> {
    let home = env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| TagError::Config("HOME is not set; pass --config".into()))?;
    Ok(home.join(CONFIG_DIR).join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let raw = r#"
            data_dir = "/var/lib/tagdbx"
            cache_capacity = 64

            [[entity]]
            name = "article"
            collection = "articles"

            [[entity.context]]
            name = "tags"

            [[entity.context]]
            name = "artists"
            field = "a"
            separator = ", "

            [[entity.rule]]
            contexts = ["tags"]
            group_by = "user"

            [[entity.rule]]
            contexts = ["artists"]
            strategy = "batch_recompute"
        "#;

        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/tagdbx"));
        assert_eq!(config.cache_capacity, 64);
        assert_eq!(config.entities.len(), 1);

        let entity = &config.entities[0];
        assert_eq!(entity.contexts.len(), 2);
        assert_eq!(entity.contexts[1].separator.as_deref(), Some(", "));
        assert_eq!(entity.rules.len(), 2);
        assert_eq!(entity.rules[0].group_by.as_deref(), Some("user"));
        assert_eq!(entity.rules[1].strategy.as_deref(), Some("batch_recompute"));
    }

    #[test]
    fn defaults_apply_when_fields_are_missing() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert!(config.entities.is_empty());
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.entities.push(EntityConfig {
            name: "article".into(),
            collection: None,
            database: None,
            contexts: vec![ContextConfig {
                name: Some("tags".into()),
                ..ContextConfig::default()
            }],
            rules: vec![RuleConfig::default()],
        });
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.entities.len(), 1);
        assert_eq!(loaded.entities[0].name, "article");
        assert_eq!(loaded.entities[0].contexts.len(), 1);
    }
}
