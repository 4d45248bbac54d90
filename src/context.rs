use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TagError};

pub const DEFAULT_FIELD: &str = "tags";
pub const DEFAULT_SEPARATOR: &str = " ";

/// Declared binding between an entity type and one tag-bearing attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagContext {
    pub name: String,
    pub field: String,
    pub separator: String,
}

/// Declaration-time options for a tag context. `field` names the stored
/// attribute and defaults to the context name; `name` is the alias used to
/// address the context and defaults to the field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextSpec {
    pub name: Option<String>,
    pub field: Option<String>,
    pub separator: Option<String>,
}

impl TagContext {
    pub fn new(spec: ContextSpec) -> Self {
        let field = spec
            .field
            .or_else(|| spec.name.clone())
            .unwrap_or_else(|| DEFAULT_FIELD.to_string());
        let name = spec.name.unwrap_or_else(|| field.clone());
        let separator = spec
            .separator
            .unwrap_or_else(|| DEFAULT_SEPARATOR.to_string());
        Self {
            name,
            field,
            separator,
        }
    }

    /// Converts a raw tag attribute value into a cleaned, deduplicated,
    /// order-preserving list of tag strings. Accepts a JSON array of
    /// strings or a single delimited string; null and missing values
    /// coerce to the empty list.
    pub fn clean_tags(&self, value: &Value) -> Result<Vec<String>> {
        let raw: Vec<String> = match value {
            Value::Null => Vec::new(),
            Value::String(text) => text
                .split(self.separator.as_str())
                .map(str::to_string)
                .collect(),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Null => {}
                        Value::String(text) => out.push(text.clone()),
                        other => {
                            return Err(TagError::InvalidTagInput(format!(
                                "tag list for '{}' contains a non-string element: {other}",
                                self.name
                            )));
                        }
                    }
                }
                out
            }
            other => {
                return Err(TagError::InvalidTagInput(format!(
                    "tags for '{}' must be a string or an array of strings, got {other}",
                    self.name
                )));
            }
        };

        let mut seen = std::collections::HashSet::new();
        let mut tags = Vec::with_capacity(raw.len());
        for tag in raw {
            let trimmed = tag.trim();
            if trimmed.is_empty() {
                continue;
            }
            if seen.insert(trimmed.to_string()) {
                tags.push(trimmed.to_string());
            }
        }
        Ok(tags)
    }

    /// Joins a cleaned tag list back into the context's delimited string
    /// form.
    pub fn tag_string(&self, tags: &[String]) -> String {
        tags.join(&self.separator)
    }

    /// Whether a cleaned tag list carries every tag in `wanted`, where
    /// `wanted` may itself be raw input in any accepted shape.
    pub fn tagged_with(&self, tags: &[String], wanted: &Value) -> Result<bool> {
        let wanted = self.clean_tags(wanted)?;
        Ok(wanted.iter().all(|tag| tags.iter().any(|t| t == tag)))
    }
}
