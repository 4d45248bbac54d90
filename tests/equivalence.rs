use std::{path::Path, sync::Arc};

use anyhow::Result;
use serde_json::json;
use tagdbx::{
    config::{Config, ContextConfig, EntityConfig, RuleConfig},
    EntitySnapshot, InMemorySource, TagEngine, TypeRegistry,
};

fn open_engine(dir: &Path, rules: Vec<RuleConfig>) -> Result<(TagEngine, Arc<InMemorySource>)> {
    let config = Config {
        data_dir: dir.to_path_buf(),
        cache_capacity: 64,
        log_file: None,
        entities: vec![EntityConfig {
            name: "article".into(),
            collection: Some("articles".into()),
            database: None,
            contexts: vec![ContextConfig {
                name: Some("tags".into()),
                ..ContextConfig::default()
            }],
            rules,
        }],
    };
    let mut engine = TagEngine::open(&config)?;
    let source = Arc::new(InMemorySource::new());
    engine.register_source("article", source.clone())?;
    Ok((engine, source))
}

fn save(
    registry: &TypeRegistry,
    source: &InMemorySource,
    id: &str,
    snapshot: EntitySnapshot,
) -> Result<()> {
    let before = source.upsert(id, snapshot.clone());
    registry.on_entity_saved(before.as_ref(), &snapshot)?;
    Ok(())
}

fn destroy(registry: &TypeRegistry, source: &InMemorySource, id: &str) -> Result<()> {
    if let Some(before) = source.remove(id) {
        registry.on_entity_destroyed(&before)?;
    }
    Ok(())
}

fn churn(registry: &TypeRegistry, source: &InMemorySource) -> Result<()> {
    save(registry, source, "a", EntitySnapshot::new().with("tags", json!("food ant bee")))?;
    save(registry, source, "b", EntitySnapshot::new().with("tags", json!("juice food bee zip")))?;
    save(registry, source, "c", EntitySnapshot::new().with("tags", json!("honey strip food")))?;
    let updated = source.get("a").unwrap().with("tags", json!("ant honey shoe"));
    save(registry, source, "a", updated)?;
    destroy(registry, source, "b")?;
    save(registry, source, "d", EntitySnapshot::new().with("tags", json!("zip zip food")))?;
    let updated = source.get("c").unwrap().with("tags", json!(""));
    save(registry, source, "c", updated)?;
    Ok(())
}

#[test]
fn recalculation_matches_the_incremental_result() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (engine, source) = open_engine(dir.path(), vec![RuleConfig::default()])?;
    let registry = engine.registry("article")?;

    churn(registry, &source)?;
    let incremental = registry.tags_with_weight_for("tags", None)?;

    registry.recalculate(None)?;
    let recalculated = registry.tags_with_weight_for("tags", None)?;

    assert_eq!(incremental, recalculated);
    assert_eq!(
        recalculated,
        vec![
            ("ant".to_string(), 1),
            ("food".to_string(), 1),
            ("honey".to_string(), 1),
            ("shoe".to_string(), 1),
            ("zip".to_string(), 1),
        ]
    );
    Ok(())
}

#[test]
fn recalculation_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (engine, source) = open_engine(dir.path(), vec![RuleConfig::default()])?;
    let registry = engine.registry("article")?;

    churn(registry, &source)?;
    registry.recalculate(None)?;
    let first = registry.tags_with_weight_for("tags", None)?;
    registry.recalculate(None)?;
    let second = registry.tags_with_weight_for("tags", None)?;

    assert_eq!(first, second);
    Ok(())
}

#[test]
fn batch_strategy_tracks_the_real_time_strategy() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let rules = vec![
        RuleConfig {
            contexts: vec!["tags".into()],
            ..RuleConfig::default()
        },
        RuleConfig {
            contexts: vec!["tags".into()],
            strategy: Some("batch_recompute".into()),
            ..RuleConfig::default()
        },
    ];
    let (engine, source) = open_engine(dir.path(), rules)?;
    let registry = engine.registry("article")?;

    churn(registry, &source)?;

    let real_time = registry.tags_with_weight_for("tags", None)?;
    let batch = registry.tags_with_weight_for("tags_via_batch_recompute", None)?;
    assert_eq!(real_time, batch);
    Ok(())
}

#[test]
fn recalculation_corrects_drift() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (engine, source) = open_engine(dir.path(), vec![RuleConfig::default()])?;
    let registry = engine.registry("article")?;

    save(registry, &source, "a", EntitySnapshot::new().with("tags", json!("food ant")))?;

    // Simulate a lost update drifting the stored counts.
    let collection = tagdbx::CollectionRef {
        database: "default".into(),
        name: registry.aggregation_collection_for("tags")?,
    };
    engine.store().adjust(&collection, None, "food", 5)?;
    engine.store().adjust(&collection, None, "phantom", 2)?;

    registry.recalculate(None)?;
    assert_eq!(
        registry.tags_with_weight_for("tags", None)?,
        vec![("ant".to_string(), 1), ("food".to_string(), 1)]
    );
    // The rebuild replaces the collection, so the phantom record is gone
    // entirely, not just invisible.
    assert_eq!(engine.store().raw_count(&collection, None, "phantom")?, None);
    Ok(())
}

#[test]
fn removing_the_last_occurrence_hides_the_tag_but_keeps_the_record() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (engine, source) = open_engine(dir.path(), vec![RuleConfig::default()])?;
    let registry = engine.registry("article")?;

    save(registry, &source, "a", EntitySnapshot::new().with("tags", json!("food ant")))?;
    let updated = source.get("a").unwrap().with("tags", json!("ant"));
    save(registry, &source, "a", updated)?;

    assert_eq!(registry.tags_for("tags", None)?, vec!["ant"]);

    let collection = tagdbx::CollectionRef {
        database: "default".into(),
        name: registry.aggregation_collection_for("tags")?,
    };
    assert_eq!(engine.store().raw_count(&collection, None, "food")?, Some(0));
    Ok(())
}

#[test]
fn grouped_rules_recalculate_into_the_same_buckets() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let rules = vec![RuleConfig {
        contexts: vec!["tags".into()],
        group_by: Some("user".into()),
        ..RuleConfig::default()
    }];
    let (engine, source) = open_engine(dir.path(), rules)?;
    let registry = engine.registry("article")?;

    save(
        registry,
        &source,
        "a",
        EntitySnapshot::new().with("user", json!("user1")).with("tags", json!("food ant")),
    )?;
    save(
        registry,
        &source,
        "b",
        EntitySnapshot::new().with("user", json!("user2")).with("tags", json!("food")),
    )?;

    let user1 = registry.tags_with_weight_for("tags", Some("user1"))?;
    let user2 = registry.tags_with_weight_for("tags", Some("user2"))?;

    registry.recalculate(None)?;
    assert_eq!(registry.tags_with_weight_for("tags", Some("user1"))?, user1);
    assert_eq!(registry.tags_with_weight_for("tags", Some("user2"))?, user2);
    Ok(())
}

#[test]
fn scoped_rules_follow_entities_across_the_scope_boundary() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let rules = vec![RuleConfig {
        contexts: vec!["tags".into()],
        scope: Some(r#"author = "joe""#.into()),
        ..RuleConfig::default()
    }];
    let (engine, source) = open_engine(dir.path(), rules)?;
    let registry = engine.registry("article")?;

    save(
        registry,
        &source,
        "a",
        EntitySnapshot::new().with("author", json!("joe")).with("tags", json!("food ant")),
    )?;
    save(
        registry,
        &source,
        "b",
        EntitySnapshot::new().with("author", json!("ann")).with("tags", json!("food")),
    )?;

    // Only the in-scope entity contributes.
    assert_eq!(
        registry.tags_with_weight_for("tags_with_scope", None)?,
        vec![("ant".to_string(), 1), ("food".to_string(), 1)]
    );

    // Entity a leaves the scope; its tags are withdrawn.
    let updated = source.get("a").unwrap().with("author", json!("ann"));
    save(registry, &source, "a", updated)?;
    assert!(registry.tags_for("tags_with_scope", None)?.is_empty());

    // Entity b enters the scope; recalculation agrees with the
    // incremental result.
    let updated = source.get("b").unwrap().with("author", json!("joe"));
    save(registry, &source, "b", updated)?;
    let incremental = registry.tags_with_weight_for("tags_with_scope", None)?;
    assert_eq!(incremental, vec![("food".to_string(), 1)]);

    registry.recalculate(None)?;
    assert_eq!(registry.tags_with_weight_for("tags_with_scope", None)?, incremental);
    Ok(())
}

#[test]
fn context_filtered_recalculation_leaves_other_contexts_alone() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        cache_capacity: 64,
        log_file: None,
        entities: vec![EntityConfig {
            name: "article".into(),
            collection: Some("articles".into()),
            database: None,
            contexts: vec![
                ContextConfig {
                    name: Some("tags".into()),
                    ..ContextConfig::default()
                },
                ContextConfig {
                    name: Some("artists".into()),
                    separator: Some(", ".into()),
                    ..ContextConfig::default()
                },
            ],
            rules: vec![RuleConfig::default()],
        }],
    };
    let mut engine = TagEngine::open(&config)?;
    let source = Arc::new(InMemorySource::new());
    engine.register_source("article", source.clone())?;
    let registry = engine.registry("article")?;

    save(
        registry,
        &source,
        "a",
        EntitySnapshot::new()
            .with("tags", json!("food"))
            .with("artists", json!("jeff")),
    )?;

    // Drift both collections, then recalculate only the tags context.
    let tags_collection = tagdbx::CollectionRef {
        database: "default".into(),
        name: registry.aggregation_collection_for("tags")?,
    };
    let artists_collection = tagdbx::CollectionRef {
        database: "default".into(),
        name: registry.aggregation_collection_for("artists")?,
    };
    engine.store().adjust(&tags_collection, None, "drift", 1)?;
    engine.store().adjust(&artists_collection, None, "drift", 1)?;

    registry.recalculate(Some("tags"))?;

    assert_eq!(registry.tags_for("tags", None)?, vec!["food"]);
    assert_eq!(registry.tags_for("artists", None)?, vec!["drift", "jeff"]);
    Ok(())
}
