use serde::{Deserialize, Serialize};

use crate::{
    context::TagContext,
    entity::EntityDescriptor,
    error::{Result, TagError},
    filter::{self, FilterExpr},
};

pub const DEFAULT_STRATEGY: StrategyKind = StrategyKind::RealTime;

/// Maintenance algorithm backing an aggregation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RealTime,
    BatchRecompute,
}

impl StrategyKind {
    /// Lower-snake-case identifier, used for the `{strategy}` name token
    /// and in configuration files.
    pub fn token(&self) -> &'static str {
        match self {
            StrategyKind::RealTime => "real_time",
            StrategyKind::BatchRecompute => "batch_recompute",
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "real_time" | "realtime" => Ok(StrategyKind::RealTime),
            "batch_recompute" | "batch" => Ok(StrategyKind::BatchRecompute),
            other => Err(TagError::InvalidStrategy(other.to_string())),
        }
    }
}

/// Resolved storage location for a rule's aggregate records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRef {
    pub database: String,
    pub name: String,
}

/// Declaration-time options for an aggregation rule. `name` and
/// `collection_name` may carry the tokens `{context}`, `{group_by}` and
/// `{strategy}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleOptions {
    pub name: Option<String>,
    pub strategy: Option<String>,
    pub group_by: Option<String>,
    pub scope: Option<String>,
    pub collection: Option<CollectionRef>,
    pub collection_name: Option<String>,
    pub database: Option<String>,
}

/// Immutable configuration of one aggregation target: which context's
/// tags are counted, how records are bucketed and filtered, which
/// strategy maintains them, and where they are stored.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub context: TagContext,
    pub group_by: Option<String>,
    pub scope: Option<FilterExpr>,
    pub strategy: StrategyKind,
    pub collection: CollectionRef,
}

impl Rule {
    pub fn resolve(
        entity: &EntityDescriptor,
        context: &TagContext,
        options: RuleOptions,
    ) -> Result<Self> {
        let strategy = match options.strategy.as_deref() {
            Some(raw) => StrategyKind::parse(raw)?,
            None => DEFAULT_STRATEGY,
        };

        if strategy == StrategyKind::BatchRecompute {
            if options.group_by.is_some() {
                return Err(TagError::UnsupportedOption(
                    "group_by is not available for the batch_recompute strategy".into(),
                ));
            }
            if options.scope.is_some() {
                return Err(TagError::UnsupportedOption(
                    "scope is not available for the batch_recompute strategy".into(),
                ));
            }
        }

        let scope = options
            .scope
            .as_deref()
            .map(filter::parse_shorthand)
            .transpose()
            .map_err(|err| TagError::Config(format!("invalid scope filter: {err}")))?;

        let tokens = Tokens {
            context: &context.name,
            group_by: options.group_by.as_deref().unwrap_or(""),
            strategy: strategy.token(),
        };

        let name = match options.name.as_deref() {
            Some(raw) => tokens.substitute(raw),
            None => tokens.substitute(&default_raw_name(
                options.group_by.is_some(),
                scope.is_some(),
                strategy,
            )),
        };

        let collection = match options.collection {
            Some(collection) => collection,
            None => {
                let collection_name = match options.collection_name.as_deref() {
                    Some(raw) => tokens.substitute(raw),
                    None => format!("{}_{}_aggregation", entity.collection, name),
                };
                let database = options
                    .database
                    .unwrap_or_else(|| entity.database.clone());
                CollectionRef {
                    database,
                    name: collection_name,
                }
            }
        };

        Ok(Self {
            name,
            context: context.clone(),
            group_by: options.group_by,
            scope,
            strategy,
            collection,
        })
    }
}

struct Tokens<'a> {
    context: &'a str,
    group_by: &'a str,
    strategy: &'a str,
}

impl Tokens<'_> {
    fn substitute(&self, raw: &str) -> String {
        raw.replace("{context}", self.context)
            .replace("{group_by}", self.group_by)
            .replace("{strategy}", self.strategy)
    }
}

fn default_raw_name(grouped: bool, scoped: bool, strategy: StrategyKind) -> String {
    let mut raw = String::from("{context}");
    if grouped {
        raw.push_str("_by_{group_by}");
    }
    if scoped {
        raw.push_str("_with_scope");
    }
    if strategy != DEFAULT_STRATEGY {
        raw.push_str("_via_{strategy}");
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSpec;

    fn entity() -> EntityDescriptor {
        EntityDescriptor::new("article").with_collection("articles")
    }

    fn context(name: &str) -> TagContext {
        TagContext::new(ContextSpec {
            name: Some(name.to_string()),
            field: None,
            separator: None,
        })
    }

    #[test]
    fn default_name_is_the_context_name() {
        let rule = Rule::resolve(&entity(), &context("keywords"), RuleOptions::default()).unwrap();
        assert_eq!(rule.name, "keywords");
        assert_eq!(rule.strategy, StrategyKind::RealTime);
        assert_eq!(rule.collection.database, "default");
        assert_eq!(rule.collection.name, "articles_keywords_aggregation");
    }

    #[test]
    fn default_name_accumulates_qualifiers() {
        let options = RuleOptions {
            group_by: Some("user".into()),
            scope: Some(r#"author = "joe""#.into()),
            ..RuleOptions::default()
        };
        let rule = Rule::resolve(&entity(), &context("keywords"), options).unwrap();
        assert_eq!(rule.name, "keywords_by_user_with_scope");

        let options = RuleOptions {
            strategy: Some("batch_recompute".into()),
            ..RuleOptions::default()
        };
        let rule = Rule::resolve(&entity(), &context("keywords"), options).unwrap();
        assert_eq!(rule.name, "keywords_via_batch_recompute");
        assert_eq!(
            rule.collection.name,
            "articles_keywords_via_batch_recompute_aggregation"
        );
    }

    #[test]
    fn explicit_names_are_detokenized() {
        let options = RuleOptions {
            name: Some("joes_{context}_by_{group_by}".into()),
            group_by: Some("category".into()),
            collection_name: Some("{context}_counts".into()),
            ..RuleOptions::default()
        };
        let rule = Rule::resolve(&entity(), &context("keywords"), options).unwrap();
        assert_eq!(rule.name, "joes_keywords_by_category");
        assert_eq!(rule.collection.name, "keywords_counts");
    }

    #[test]
    fn explicit_collection_wins_over_name_and_database() {
        let options = RuleOptions {
            collection: Some(CollectionRef {
                database: "analytics".into(),
                name: "clouds".into(),
            }),
            collection_name: Some("ignored".into()),
            database: Some("ignored".into()),
            ..RuleOptions::default()
        };
        let rule = Rule::resolve(&entity(), &context("tags"), options).unwrap();
        assert_eq!(rule.collection.database, "analytics");
        assert_eq!(rule.collection.name, "clouds");
    }

    #[test]
    fn explicit_database_wins_over_entity_default() {
        let options = RuleOptions {
            database: Some("analytics".into()),
            ..RuleOptions::default()
        };
        let rule = Rule::resolve(&entity(), &context("tags"), options).unwrap();
        assert_eq!(rule.collection.database, "analytics");
    }

    #[test]
    fn batch_recompute_rejects_group_by_and_scope() {
        let options = RuleOptions {
            strategy: Some("batch_recompute".into()),
            group_by: Some("user".into()),
            ..RuleOptions::default()
        };
        assert!(matches!(
            Rule::resolve(&entity(), &context("tags"), options),
            Err(TagError::UnsupportedOption(_))
        ));

        let options = RuleOptions {
            strategy: Some("batch".into()),
            scope: Some(r#"author = "joe""#.into()),
            ..RuleOptions::default()
        };
        assert!(matches!(
            Rule::resolve(&entity(), &context("tags"), options),
            Err(TagError::UnsupportedOption(_))
        ));
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let options = RuleOptions {
            strategy: Some("map_reduce_v2".into()),
            ..RuleOptions::default()
        };
        assert!(matches!(
            Rule::resolve(&entity(), &context("tags"), options),
            Err(TagError::InvalidStrategy(_))
        ));
    }

    #[test]
    fn invalid_scope_filter_is_a_config_error() {
        let options = RuleOptions {
            scope: Some("author ~ joe".into()),
            ..RuleOptions::default()
        };
        assert!(matches!(
            Rule::resolve(&entity(), &context("tags"), options),
            Err(TagError::Config(_))
        ));
    }
}
