use std::{collections::BTreeMap, sync::Arc};

use tracing::debug;

use crate::{
    cache::QueryCache,
    config::Config,
    context::{ContextSpec, TagContext},
    entity::{EntityDescriptor, EntitySnapshot, EntitySource},
    error::{Result, TagError},
    rule::RuleOptions,
    store::CountsStore,
    strategy::{self, AggregationStrategy, AutocompleteOptions},
};

/// Per-entity-type aggregation table: the declared tag contexts, the
/// rules over them, and the dispatch from entity lifecycle events to
/// each rule's strategy. Owned by the engine, never global.
pub struct TypeRegistry {
    descriptor: EntityDescriptor,
    contexts: Vec<TagContext>,
    rules: Vec<Box<dyn AggregationStrategy>>,
    has_global_rule: bool,
    store: Arc<CountsStore>,
    cache: Option<Arc<QueryCache>>,
    source: Option<Arc<dyn EntitySource>>,
}

impl TypeRegistry {
    pub fn new(
        descriptor: EntityDescriptor,
        store: Arc<CountsStore>,
        cache: Option<Arc<QueryCache>>,
    ) -> Self {
        Self {
            descriptor,
            contexts: Vec::new(),
            rules: Vec::new(),
            has_global_rule: false,
            store,
            cache,
            source: None,
        }
    }

    pub fn descriptor(&self) -> &EntityDescriptor {
        &self.descriptor
    }

    pub fn set_source(&mut self, source: Arc<dyn EntitySource>) {
        self.source = Some(source);
    }

    /// Declares a tag context. Fails once a rule without explicit context
    /// scoping exists: that rule was expanded over the contexts declared
    /// before it, and a later context would fall outside it.
    pub fn add_context(&mut self, spec: ContextSpec) -> Result<String> {
        if self.has_global_rule {
            let name = spec.name.clone().or_else(|| spec.field.clone());
            return Err(TagError::ContextAfterGlobalRule(
                name.unwrap_or_else(|| "tags".into()),
            ));
        }
        let context = TagContext::new(spec);
        if self.context(&context.name).is_some() {
            return Err(TagError::Config(format!(
                "tag context '{}' is already declared for '{}'",
                context.name, self.descriptor.name
            )));
        }
        let name = context.name.clone();
        self.contexts.push(context);
        Ok(name)
    }

    /// Declares an aggregation rule for the named contexts, or for every
    /// declared context when `contexts` is empty (marking the rule
    /// global). Returns the resolved rule names.
    pub fn add_rule(&mut self, contexts: &[&str], options: RuleOptions) -> Result<Vec<String>> {
        let context_names: Vec<String> = if contexts.is_empty() {
            self.has_global_rule = true;
            self.contexts.iter().map(|c| c.name.clone()).collect()
        } else {
            contexts.iter().map(|name| name.to_string()).collect()
        };

        let mut names = Vec::with_capacity(context_names.len());
        for context_name in context_names {
            let context = self
                .context(&context_name)
                .ok_or_else(|| TagError::TagContextNotFound(context_name.clone()))?
                .clone();
            let rule = crate::rule::Rule::resolve(&self.descriptor, &context, options.clone())?;
            if self.find_by_rule_name(&rule.name).is_some() {
                return Err(TagError::DuplicateRuleName(rule.name));
            }
            self.store.ensure_meta(&rule.collection, &rule.name)?;
            names.push(rule.name.clone());
            self.rules.push(strategy::build(rule, self.store.clone())?);
        }
        Ok(names)
    }

    pub fn context(&self, name: &str) -> Option<&TagContext> {
        self.contexts.iter().find(|context| context.name == name)
    }

    pub fn contexts(&self) -> impl Iterator<Item = &TagContext> {
        self.contexts.iter()
    }

    pub fn rules(&self) -> impl Iterator<Item = &dyn AggregationStrategy> {
        self.rules.iter().map(|strategy| &**strategy)
    }

    /// Dispatches a persisted create/update to every rule's strategy.
    pub fn on_entity_saved(
        &self,
        before: Option<&EntitySnapshot>,
        after: &EntitySnapshot,
    ) -> Result<()> {
        debug!(entity = %self.descriptor.name, "dispatching entity save");
        for strategy in &self.rules {
            strategy.on_save(self.source_ref(), before, after)?;
            self.invalidate(&strategy.rule().collection);
        }
        Ok(())
    }

    /// Dispatches a committed delete to every rule's strategy.
    pub fn on_entity_destroyed(&self, before: &EntitySnapshot) -> Result<()> {
        debug!(entity = %self.descriptor.name, "dispatching entity destroy");
        for strategy in &self.rules {
            strategy.on_destroy(self.source_ref(), before)?;
            self.invalidate(&strategy.rule().collection);
        }
        Ok(())
    }

    pub fn tags_for(&self, rule_or_context: &str, group: Option<&str>) -> Result<Vec<String>> {
        Ok(self
            .tags_with_weight_for(rule_or_context, group)?
            .into_iter()
            .map(|(tag, _)| tag)
            .collect())
    }

    pub fn tags_with_weight_for(
        &self,
        rule_or_context: &str,
        group: Option<&str>,
    ) -> Result<Vec<(String, i64)>> {
        let strategy = self.entry(rule_or_context)?;
        let collection = &strategy.rule().collection;
        // Invalid queries are never cached, so a hit is always a valid read.
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(collection, group) {
                return Ok(hit);
            }
        }
        let weights = strategy.tags_with_weight(group)?;
        if let Some(cache) = &self.cache {
            cache.put(collection, group, weights.clone());
        }
        Ok(weights)
    }

    pub fn autocomplete_for(
        &self,
        rule_or_context: &str,
        prefix: &str,
        options: AutocompleteOptions,
    ) -> Result<Vec<(String, i64)>> {
        self.entry(rule_or_context)?.autocomplete(prefix, options)
    }

    /// The backing collection name of a rule, addressed like the read
    /// accessors.
    pub fn aggregation_collection_for(&self, rule_or_context: &str) -> Result<String> {
        Ok(self.entry(rule_or_context)?.rule().collection.name.clone())
    }

    /// Rebuilds every rule's counts from the entity source, or only the
    /// rules bound to one context when a filter is supplied.
    pub fn recalculate(&self, context: Option<&str>) -> Result<()> {
        let source = self
            .source
            .as_deref()
            .ok_or_else(|| TagError::SourceNotRegistered(self.descriptor.name.clone()))?;
        for strategy in &self.rules {
            if let Some(context) = context {
                if strategy.rule().context.name != context {
                    continue;
                }
            }
            strategy.recalculate(source)?;
            self.invalidate(&strategy.rule().collection);
        }
        Ok(())
    }

    /// Rules may be addressed by their resolved name or by a context
    /// name, which resolves to the first rule declared for that context.
    fn entry(&self, rule_or_context: &str) -> Result<&dyn AggregationStrategy> {
        self.find_by_rule_name(rule_or_context)
            .or_else(|| {
                self.rules
                    .iter()
                    .map(|strategy| &**strategy)
                    .find(|strategy| strategy.rule().context.name == rule_or_context)
            })
            .ok_or_else(|| TagError::UnknownRule(rule_or_context.to_string()))
    }

    fn find_by_rule_name(&self, name: &str) -> Option<&dyn AggregationStrategy> {
        self.rules
            .iter()
            .map(|strategy| &**strategy)
            .find(|strategy| strategy.rule().name == name)
    }

    fn source_ref(&self) -> Option<&dyn EntitySource> {
        self.source.as_deref()
    }

    fn invalidate(&self, collection: &crate::rule::CollectionRef) {
        if let Some(cache) = &self.cache {
            cache.invalidate(collection);
        }
    }
}

/// The aggregation engine: one counts store, one read cache, and a
/// registry per configured entity type. Built once at startup from the
/// configuration; entity sources are attached by the embedding
/// application before recalculation is used.
pub struct TagEngine {
    store: Arc<CountsStore>,
    registries: BTreeMap<String, TypeRegistry>,
}

impl TagEngine {
    pub fn open(config: &Config) -> Result<Self> {
        let store = Arc::new(CountsStore::open(config.counts_path())?);
        let cache = QueryCache::new(config.cache_capacity).map(Arc::new);

        let mut registries = BTreeMap::new();
        for entity in &config.entities {
            let mut descriptor = EntityDescriptor::new(entity.name.clone());
            if let Some(collection) = &entity.collection {
                descriptor = descriptor.with_collection(collection.clone());
            }
            if let Some(database) = &entity.database {
                descriptor = descriptor.with_database(database.clone());
            }

            let mut registry = TypeRegistry::new(descriptor, store.clone(), cache.clone());
            for context in &entity.contexts {
                registry.add_context(context.to_spec())?;
            }
            for rule in &entity.rules {
                let contexts: Vec<&str> = rule.contexts.iter().map(String::as_str).collect();
                registry.add_rule(&contexts, rule.to_options())?;
            }

            if registries.contains_key(&entity.name) {
                return Err(TagError::Config(format!(
                    "entity type '{}' is declared twice",
                    entity.name
                )));
            }
            registries.insert(entity.name.clone(), registry);
        }

        Ok(Self { store, registries })
    }

    pub fn store(&self) -> &CountsStore {
        &self.store
    }

    pub fn registry(&self, entity_type: &str) -> Result<&TypeRegistry> {
        self.registries
            .get(entity_type)
            .ok_or_else(|| TagError::Config(format!("unknown entity type '{entity_type}'")))
    }

    pub fn registry_mut(&mut self, entity_type: &str) -> Result<&mut TypeRegistry> {
        self.registries
            .get_mut(entity_type)
            .ok_or_else(|| TagError::Config(format!("unknown entity type '{entity_type}'")))
    }

    pub fn registries(&self) -> impl Iterator<Item = &TypeRegistry> {
        self.registries.values()
    }

    pub fn register_source(
        &mut self,
        entity_type: &str,
        source: Arc<dyn EntitySource>,
    ) -> Result<()> {
        self.registry_mut(entity_type)?.set_source(source);
        Ok(())
    }

    /// Rebuilds every rule of every entity type.
    pub fn recalculate_all(&self) -> Result<()> {
        for registry in self.registries.values() {
            registry.recalculate(None)?;
        }
        Ok(())
    }
}
