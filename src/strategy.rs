use std::{collections::BTreeMap, sync::Arc};

use serde_json::Value;
use tracing::{debug, info};

use crate::{
    entity::{EntitySnapshot, EntitySource},
    error::{Result, TagError},
    rule::{Rule, StrategyKind},
    store::CountsStore,
};

/// Options for prefix autocompletion over a rule's visible tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutocompleteOptions {
    /// Order results by descending count instead of ascending tag.
    pub sort_by_count: bool,
    /// Result cap; zero or negative means unlimited.
    pub max: i64,
}

/// Maintenance algorithm for one aggregation rule. Lifecycle hooks
/// default to no-ops; a variant implements only the ones its semantics
/// need. The read side is shared: switching a rule's strategy never
/// changes observable read behavior.
pub trait AggregationStrategy: Send + Sync {
    fn rule(&self) -> &Rule;
    fn store(&self) -> &CountsStore;

    /// Distinct visible tags, ascending.
    fn tags(&self, group: Option<&str>) -> Result<Vec<String>> {
        Ok(self
            .tags_with_weight(group)?
            .into_iter()
            .map(|(tag, _)| tag)
            .collect())
    }

    /// Visible `(tag, count)` pairs, tag ascending; weights are summed
    /// across groups when a grouped rule is queried without a group.
    fn tags_with_weight(&self, group: Option<&str>) -> Result<Vec<(String, i64)>> {
        let rule = self.rule();
        if group.is_some() && rule.group_by.is_none() {
            return Err(TagError::InvalidQuery(format!(
                "rule '{}' has no group_by",
                rule.name
            )));
        }
        self.store().weights(&rule.collection, group)
    }

    /// Live prefix search; only meaningful for a continuously maintained
    /// record set, so the batch variant leaves this unimplemented.
    fn autocomplete(
        &self,
        _prefix: &str,
        _options: AutocompleteOptions,
    ) -> Result<Vec<(String, i64)>> {
        Err(TagError::UnsupportedOption(format!(
            "autocomplete is not available for the {} strategy",
            self.rule().strategy.token()
        )))
    }

    /// Invoked after an entity create/update commit. Must be a no-op
    /// unless the rule's tag attribute actually changed.
    fn on_save(
        &self,
        _source: Option<&dyn EntitySource>,
        _before: Option<&EntitySnapshot>,
        _after: &EntitySnapshot,
    ) -> Result<()> {
        Ok(())
    }

    /// Invoked after an entity delete commit; a transition from the
    /// entity's tag set to the empty set.
    fn on_destroy(
        &self,
        _source: Option<&dyn EntitySource>,
        _before: &EntitySnapshot,
    ) -> Result<()> {
        Ok(())
    }

    /// Rebuilds the rule's counts from the full current entity set,
    /// independent of incremental history.
    fn recalculate(&self, source: &dyn EntitySource) -> Result<()>;
}

/// Builds the strategy instance for a resolved rule.
pub fn build(rule: Rule, store: Arc<CountsStore>) -> Result<Box<dyn AggregationStrategy>> {
    match rule.strategy {
        StrategyKind::RealTime => Ok(Box::new(RealTimeStrategy::new(rule, store))),
        StrategyKind::BatchRecompute => {
            Ok(Box::new(BatchRecomputeStrategy::new(rule, store)?))
        }
    }
}

/// Incremental maintenance: each save is diffed into per-tag deltas and
/// applied as blind atomic merges, so concurrent saves never conflict on
/// disjoint tags and serialize in the storage engine on shared ones.
pub struct RealTimeStrategy {
    rule: Rule,
    store: Arc<CountsStore>,
}

impl RealTimeStrategy {
    pub fn new(rule: Rule, store: Arc<CountsStore>) -> Self {
        Self { rule, store }
    }

    fn apply_transition(
        &self,
        old_tags: &[String],
        new_tags: &[String],
        group: Option<&str>,
    ) -> Result<()> {
        let removed: Vec<&String> = old_tags
            .iter()
            .filter(|tag| !new_tags.contains(tag))
            .collect();
        let added: Vec<&String> = new_tags
            .iter()
            .filter(|tag| !old_tags.contains(tag))
            .collect();

        for tag in removed {
            self.store.adjust(&self.rule.collection, group, tag, -1)?;
        }
        for tag in added {
            self.store.adjust(&self.rule.collection, group, tag, 1)?;
        }
        Ok(())
    }
}

impl AggregationStrategy for RealTimeStrategy {
    fn rule(&self) -> &Rule {
        &self.rule
    }

    fn store(&self) -> &CountsStore {
        &self.store
    }

    fn autocomplete(
        &self,
        prefix: &str,
        options: AutocompleteOptions,
    ) -> Result<Vec<(String, i64)>> {
        self.store
            .autocomplete(&self.rule.collection, prefix, options.sort_by_count, options.max)
    }

    fn on_save(
        &self,
        _source: Option<&dyn EntitySource>,
        before: Option<&EntitySnapshot>,
        after: &EntitySnapshot,
    ) -> Result<()> {
        let old_tags = effective_tags(&self.rule, before)?;
        let new_tags = effective_tags(&self.rule, Some(after))?;
        if old_tags == new_tags {
            return Ok(());
        }

        debug!(
            rule = %self.rule.name,
            removed = old_tags.iter().filter(|t| !new_tags.contains(t)).count(),
            added = new_tags.iter().filter(|t| !old_tags.contains(t)).count(),
            "applying incremental tag update"
        );

        // The group bucket comes from the entity's post-save state.
        let group = group_key(&self.rule, after);
        self.apply_transition(&old_tags, &new_tags, group.as_deref())
    }

    fn on_destroy(
        &self,
        _source: Option<&dyn EntitySource>,
        before: &EntitySnapshot,
    ) -> Result<()> {
        let old_tags = effective_tags(&self.rule, Some(before))?;
        if old_tags.is_empty() {
            return Ok(());
        }
        let group = group_key(&self.rule, before);
        self.apply_transition(&old_tags, &[], group.as_deref())
    }

    fn recalculate(&self, source: &dyn EntitySource) -> Result<()> {
        rebuild(&self.store, &self.rule, source)
    }
}

/// Full-scan maintenance: every relevant write triggers a recount of the
/// whole entity set, trading O(entities) writes for trivially correct
/// counts. Rejects grouping and scoping at configuration time.
pub struct BatchRecomputeStrategy {
    rule: Rule,
    store: Arc<CountsStore>,
}

impl BatchRecomputeStrategy {
    pub fn new(rule: Rule, store: Arc<CountsStore>) -> Result<Self> {
        if rule.group_by.is_some() {
            return Err(TagError::UnsupportedOption(
                "group_by is not available for the batch_recompute strategy".into(),
            ));
        }
        if rule.scope.is_some() {
            return Err(TagError::UnsupportedOption(
                "scope is not available for the batch_recompute strategy".into(),
            ));
        }
        Ok(Self { rule, store })
    }

    fn require_source<'a>(
        &self,
        source: Option<&'a dyn EntitySource>,
    ) -> Result<&'a dyn EntitySource> {
        source.ok_or_else(|| TagError::SourceNotRegistered(self.rule.name.clone()))
    }
}

impl AggregationStrategy for BatchRecomputeStrategy {
    fn rule(&self) -> &Rule {
        &self.rule
    }

    fn store(&self) -> &CountsStore {
        &self.store
    }

    fn on_save(
        &self,
        source: Option<&dyn EntitySource>,
        before: Option<&EntitySnapshot>,
        after: &EntitySnapshot,
    ) -> Result<()> {
        let old_tags = effective_tags(&self.rule, before)?;
        let new_tags = effective_tags(&self.rule, Some(after))?;
        if old_tags == new_tags {
            return Ok(());
        }
        rebuild(&self.store, &self.rule, self.require_source(source)?)
    }

    fn on_destroy(
        &self,
        source: Option<&dyn EntitySource>,
        _before: &EntitySnapshot,
    ) -> Result<()> {
        rebuild(&self.store, &self.rule, self.require_source(source)?)
    }

    fn recalculate(&self, source: &dyn EntitySource) -> Result<()> {
        rebuild(&self.store, &self.rule, source)
    }
}

/// The tag set an entity currently contributes to a rule: its cleaned
/// tags, or nothing when the entity falls outside the rule's scope.
fn effective_tags(rule: &Rule, snapshot: Option<&EntitySnapshot>) -> Result<Vec<String>> {
    let Some(snapshot) = snapshot else {
        return Ok(Vec::new());
    };
    if let Some(scope) = &rule.scope {
        if !scope.matches(snapshot) {
            return Ok(Vec::new());
        }
    }
    let value = snapshot.get(&rule.context.field).unwrap_or(&Value::Null);
    rule.context.clean_tags(value)
}

fn group_key(rule: &Rule, snapshot: &EntitySnapshot) -> Option<String> {
    rule.group_by
        .as_deref()
        .and_then(|field| snapshot.group_key(field))
}

/// Shared full rebuild: counts every entity's effective tag set from a
/// scan of the source and atomically replaces the rule's collection.
/// Both strategies delegate here.
fn rebuild(store: &CountsStore, rule: &Rule, source: &dyn EntitySource) -> Result<()> {
    let mut counts: BTreeMap<(String, String), i64> = BTreeMap::new();
    let mut scanned = 0usize;
    for snapshot in source.snapshots()? {
        let snapshot = snapshot?;
        scanned += 1;
        let tags = effective_tags(rule, Some(&snapshot))?;
        if tags.is_empty() {
            continue;
        }
        let group = group_key(rule, &snapshot).unwrap_or_default();
        for tag in tags {
            *counts.entry((group.clone(), tag)).or_insert(0) += 1;
        }
    }

    store.replace_collection(&rule.collection, &rule.name, &counts)?;
    info!(
        rule = %rule.name,
        entities = scanned,
        records = counts.len(),
        "recalculated tag aggregation"
    );
    Ok(())
}
