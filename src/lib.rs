pub mod cache;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod filter;
pub mod logging;
pub mod registry;
pub mod rule;
pub mod store;
pub mod strategy;

pub use config::Config;
pub use context::{ContextSpec, TagContext};
pub use entity::{EntityDescriptor, EntitySnapshot, EntitySource, InMemorySource};
pub use error::{Result, TagError};
pub use filter::FilterExpr;
pub use registry::{TagEngine, TypeRegistry};
pub use rule::{CollectionRef, Rule, RuleOptions, StrategyKind};
pub use store::{AggregateRecord, CollectionMeta, CountsStore};
pub use strategy::{AggregationStrategy, AutocompleteOptions};
