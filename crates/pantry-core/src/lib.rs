//! Core domain model for the Pantry recipe warehouse.

use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "pantry-core";

/// Upstream recipe API a record originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceName {
    Themealdb,
    Spoonacular,
}

impl SourceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceName::Themealdb => "themealdb",
            SourceName::Spoonacular => "spoonacular",
        }
    }
}

impl std::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw ingredient entry as delivered by a source payload.
///
/// Either field may be missing; partial entries are resolved during
/// normalization, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawIngredient {
    pub ingredient: Option<String>,
    pub measure: Option<String>,
}

/// Pre-normalization recipe record, one per source record.
///
/// `source_id` accepts both JSON strings and numbers (Spoonacular ids are
/// numeric) and is coerced to a string at the serde boundary. A record
/// without a `source_id` has no usable natural key and is skipped by the
/// normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecipe {
    pub source_name: SourceName,
    #[serde(default, deserialize_with = "id_string_or_number")]
    pub source_id: Option<String>,
    pub name: Option<String>,
    pub category: Option<String>,
    pub area: Option<String>,
    pub instructions: Option<String>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub ingredients: Vec<RawIngredient>,
}

impl RawRecipe {
    /// Natural key of this record, when the record carries one.
    pub fn natural_key(&self) -> Option<(SourceName, &str)> {
        self.source_id
            .as_deref()
            .map(|id| (self.source_name, id))
    }
}

/// Ingredient entry that survived name canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedIngredient {
    /// Canonical merge key (`normalized_name` in the store).
    pub name: String,
    /// Human-readable form as the source wrote it, trimmed.
    pub display_name: String,
    pub measure: Option<String>,
}

/// Canonical recipe shape produced by the normalizer and consumed by the
/// quality checker, the parquet export, and the upsert engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecipe {
    pub source_name: SourceName,
    pub source_id: String,
    pub name: Option<String>,
    pub category: Option<String>,
    pub area: Option<String>,
    pub instructions: Option<String>,
    pub thumbnail: Option<String>,
    pub ingredients: Vec<NormalizedIngredient>,
}

impl NormalizedRecipe {
    pub fn natural_key(&self) -> (SourceName, &str) {
        (self.source_name, self.source_id.as_str())
    }
}

fn id_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
