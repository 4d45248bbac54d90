use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Identity of an entity type as the aggregation layer sees it: a name,
/// the collection its documents live in, and its default database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub name: String,
    pub collection: String,
    pub database: String,
}

pub const DEFAULT_DATABASE: &str = "default";

impl EntityDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            collection: name.clone(),
            name,
            database: DEFAULT_DATABASE.to_string(),
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }
}

/// Immutable snapshot of an entity's attributes, captured after a
/// persistence commit. The aggregation layer only ever reads from
/// snapshots; it never writes entities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    attributes: BTreeMap<String, Value>,
}

impl EntitySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_attributes(attributes: BTreeMap<String, Value>) -> Self {
        Self { attributes }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Resolves a possibly dotted attribute path against the snapshot.
    pub fn select(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.attributes.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Renders the value of a grouping attribute as a bucket key. String
    /// values are used verbatim; other JSON values use their JSON
    /// rendering; null or missing values yield no bucket.
    pub fn group_key(&self, field: &str) -> Option<String> {
        match self.select(field) {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Handle onto the full current entity set of one type, supplied by the
/// embedding application's persistence layer. Batch recomputation scans
/// through this; the incremental path never does.
pub trait EntitySource: Send + Sync {
    fn snapshots(&self) -> Result<Box<dyn Iterator<Item = Result<EntitySnapshot>> + '_>>;
}

/// Entity source over a plain in-memory map, keyed by entity id. Useful
/// for tests and for applications whose entities already live in memory.
#[derive(Debug, Default)]
pub struct InMemorySource {
    entities: RwLock<BTreeMap<String, EntitySnapshot>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entity, returning the previous snapshot.
    pub fn upsert(&self, id: impl Into<String>, snapshot: EntitySnapshot) -> Option<EntitySnapshot> {
        self.entities.write().insert(id.into(), snapshot)
    }

    pub fn remove(&self, id: &str) -> Option<EntitySnapshot> {
        self.entities.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<EntitySnapshot> {
        self.entities.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

impl EntitySource for InMemorySource {
    fn snapshots(&self) -> Result<Box<dyn Iterator<Item = Result<EntitySnapshot>> + '_>> {
        let snapshots: Vec<EntitySnapshot> = self.entities.read().values().cloned().collect();
        Ok(Box::new(snapshots.into_iter().map(Ok)))
    }
}
