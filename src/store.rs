use std::{collections::BTreeMap, path::PathBuf, time::Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rocksdb::{
    DBWithThreadMode, Direction, IteratorMode, MergeOperands, MultiThreaded, Options, WriteBatch,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{Result, TagError},
    rule::CollectionRef,
};

const SEP: u8 = 0x1F;
const PREFIX_AGG: &str = "agg";
const PREFIX_META: &str = "meta";

/// One stored `(tag, group, count)` tuple of a rule's backing collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRecord {
    pub tag: String,
    pub group: Option<String>,
    pub count: i64,
}

/// Bookkeeping record kept once per backing collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub rule: String,
    pub recalculated_at: Option<DateTime<Utc>>,
}

/// Counter storage for aggregate records, one keyspace shared by every
/// rule collection. Increments are blind atomic merges, so concurrent
/// writers never read-modify-write and same-tag updates serialize inside
/// the storage engine.
pub struct CountsStore {
    db: DBWithThreadMode<MultiThreaded>,
}

impl CountsStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut options = Options::default();
        options.create_if_missing(true);
        options.set_merge_operator_associative("tag_count_add", merge_counter);
        let db = DBWithThreadMode::<MultiThreaded>::open(&options, path)?;
        Ok(Self { db })
    }

    /// Applies a delta to one record, creating it at the delta value if
    /// absent. This is the only mutation the incremental path performs.
    pub fn adjust(
        &self,
        collection: &CollectionRef,
        group: Option<&str>,
        tag: &str,
        delta: i64,
    ) -> Result<()> {
        let started = Instant::now();
        let key = record_key(collection, group.unwrap_or(""), tag);
        let outcome = self.db.merge(key, delta.to_le_bytes());
        record_store_op(
            "adjust",
            if outcome.is_ok() { "ok" } else { "error" },
            started.elapsed().as_secs_f64(),
        );
        outcome.map_err(TagError::from)
    }

    /// Atomically replaces the entire record set of a collection and
    /// stamps its meta record. Stale records are dropped, not zeroed.
    /// `counts` is keyed by `(group, tag)`, with the empty group for
    /// ungrouped records.
    pub fn replace_collection(
        &self,
        collection: &CollectionRef,
        rule: &str,
        counts: &BTreeMap<(String, String), i64>,
    ) -> Result<()> {
        let started = Instant::now();
        let mut batch = WriteBatch::default();

        let prefix = collection_prefix(collection);
        for entry in self.prefixed(&prefix)? {
            let (key, _) = entry?;
            batch.delete(key);
        }

        for ((group, tag), count) in counts {
            batch.put(record_key(collection, group, tag), count.to_le_bytes());
        }

        let meta = CollectionMeta {
            rule: rule.to_string(),
            recalculated_at: Some(Utc::now()),
        };
        batch.put(meta_key(collection), serde_json::to_vec(&meta)?);

        let outcome = self.db.write(batch);
        record_store_op(
            "replace",
            if outcome.is_ok() { "ok" } else { "error" },
            started.elapsed().as_secs_f64(),
        );
        outcome.map_err(TagError::from)?;

        debug!(
            collection = %collection.name,
            records = counts.len(),
            "replaced aggregation collection"
        );
        Ok(())
    }

    /// The stored count for one record, visibility filter not applied.
    /// Zero and negative counts are reported as-is.
    pub fn raw_count(
        &self,
        collection: &CollectionRef,
        group: Option<&str>,
        tag: &str,
    ) -> Result<Option<i64>> {
        let key = record_key(collection, group.unwrap_or(""), tag);
        Ok(self.db.get(key)?.as_deref().map(decode_count))
    }

    /// Visible `(tag, count)` pairs, tag ascending. With a group filter,
    /// only that bucket's records are read; without one, visible records
    /// from every bucket are merged by summing per tag.
    pub fn weights(
        &self,
        collection: &CollectionRef,
        group: Option<&str>,
    ) -> Result<Vec<(String, i64)>> {
        match group {
            Some(group) => {
                let prefix = group_prefix(collection, group);
                let mut out = Vec::new();
                for entry in self.prefixed(&prefix)? {
                    let (key, value) = entry?;
                    let count = decode_count(&value);
                    if count > 0 {
                        out.push((decode_tail(&key[prefix.len()..]), count));
                    }
                }
                Ok(out)
            }
            None => {
                let mut merged: BTreeMap<String, i64> = BTreeMap::new();
                for record in self.records(collection)? {
                    if record.count > 0 {
                        *merged.entry(record.tag).or_insert(0) += record.count;
                    }
                }
                Ok(merged.into_iter().collect())
            }
        }
    }

    /// Prefix search over a collection's visible tags, merged across
    /// groups. Ordered by tag unless `sort_by_count` flips to descending
    /// count; a non-positive `max` means unlimited.
    pub fn autocomplete(
        &self,
        collection: &CollectionRef,
        prefix: &str,
        sort_by_count: bool,
        max: i64,
    ) -> Result<Vec<(String, i64)>> {
        let mut merged: BTreeMap<String, i64> = BTreeMap::new();
        for record in self.records(collection)? {
            if record.count > 0 && record.tag.starts_with(prefix) {
                *merged.entry(record.tag).or_insert(0) += record.count;
            }
        }

        let mut results: Vec<(String, i64)> = merged.into_iter().collect();
        if sort_by_count {
            results.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        }
        if max > 0 {
            results.truncate(max as usize);
        }
        Ok(results)
    }

    /// Every stored record of a collection, including non-positive ones.
    pub fn records(&self, collection: &CollectionRef) -> Result<Vec<AggregateRecord>> {
        let prefix = collection_prefix(collection);
        let mut out = Vec::new();
        for entry in self.prefixed(&prefix)? {
            let (key, value) = entry?;
            let tail = &key[prefix.len()..];
            let split = tail.iter().position(|byte| *byte == SEP).ok_or_else(|| {
                TagError::Storage(format!(
                    "malformed aggregate key in collection '{}'",
                    collection.name
                ))
            })?;
            let group = decode_tail(&tail[..split]);
            out.push(AggregateRecord {
                tag: decode_tail(&tail[split + 1..]),
                group: (!group.is_empty()).then_some(group),
                count: decode_count(&value),
            });
        }
        Ok(out)
    }

    /// Writes the collection's meta record if it does not exist yet, so
    /// never-recalculated collections still show up in listings.
    pub fn ensure_meta(&self, collection: &CollectionRef, rule: &str) -> Result<()> {
        let key = meta_key(collection);
        if self.db.get(&key)?.is_none() {
            let meta = CollectionMeta {
                rule: rule.to_string(),
                recalculated_at: None,
            };
            self.db.put(key, serde_json::to_vec(&meta)?)?;
        }
        Ok(())
    }

    pub fn meta(&self, collection: &CollectionRef) -> Result<Option<CollectionMeta>> {
        match self.db.get(meta_key(collection))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_metas(&self) -> Result<Vec<(CollectionRef, CollectionMeta)>> {
        let mut prefix = PREFIX_META.as_bytes().to_vec();
        prefix.push(SEP);
        let mut out = Vec::new();
        for entry in self.prefixed(&prefix)? {
            let (key, value) = entry?;
            let tail = &key[prefix.len()..];
            let split = tail.iter().position(|byte| *byte == SEP).ok_or_else(|| {
                TagError::Storage("malformed collection meta key".to_string())
            })?;
            let collection = CollectionRef {
                database: decode_tail(&tail[..split]),
                name: decode_tail(&tail[split + 1..]),
            };
            out.push((collection, serde_json::from_slice(&value)?));
        }
        Ok(out)
    }

    fn prefixed(
        &self,
        prefix: &[u8],
    ) -> Result<impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>)>> + '_> {
        let owned = prefix.to_vec();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        Ok(iter
            .map(|entry| entry.map_err(TagError::from))
            .take_while(move |entry| match entry {
                Ok((key, _)) => key.starts_with(&owned),
                Err(_) => true,
            }))
    }
}

fn merge_counter(
    _key: &[u8],
    existing: Option<&[u8]>,
    operands: &MergeOperands,
) -> Option<Vec<u8>> {
    let mut total = existing.map(decode_count).unwrap_or(0);
    for operand in operands.iter() {
        total += decode_count(operand);
    }
    Some(total.to_le_bytes().to_vec())
}

fn decode_count(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    i64::from_le_bytes(buf)
}

fn decode_tail(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn record_key(collection: &CollectionRef, group: &str, tag: &str) -> Vec<u8> {
    key_with_segments(&[
        PREFIX_AGG,
        &collection.database,
        &collection.name,
        group,
        tag,
    ])
}

fn collection_prefix(collection: &CollectionRef) -> Vec<u8> {
    let mut key = key_with_segments(&[PREFIX_AGG, &collection.database, &collection.name]);
    key.push(SEP);
    key
}

fn group_prefix(collection: &CollectionRef, group: &str) -> Vec<u8> {
    let mut key = key_with_segments(&[PREFIX_AGG, &collection.database, &collection.name, group]);
    key.push(SEP);
    key
}

fn meta_key(collection: &CollectionRef) -> Vec<u8> {
    key_with_segments(&[PREFIX_META, &collection.database, &collection.name])
}

fn key_with_segments(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::new();
    let mut iter = parts.iter();
    if let Some(first) = iter.next() {
        key.extend_from_slice(first.as_bytes());
    }
    for part in iter {
        key.push(SEP);
        key.extend_from_slice(part.as_bytes());
    }
    key
}

fn record_store_op(operation: &'static str, status: &'static str, duration: f64) {
    let labels = [("operation", operation), ("status", status)];
    counter!("tagdbx_store_operations_total", &labels).increment(1);
    histogram!("tagdbx_store_operation_duration_seconds", &labels).record(duration);
}
