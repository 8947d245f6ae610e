//! Fetch adapters for the two upstream recipe APIs.
//!
//! Each adapter turns a source payload into [`RawRecipe`] records and keeps a
//! per-label cache so repeat runs do not hit the APIs unless asked to
//! refresh. Everything past the raw shape (dedup, canonicalization, quality)
//! happens downstream in the sync pipeline.

use std::collections::HashSet;

use async_trait::async_trait;
use pantry_core::{RawIngredient, RawRecipe, SourceName};
use pantry_storage::{FetchError, HttpFetcher, RawCache};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "pantry-adapters";

pub const THEMEALDB_DEFAULT_CATEGORIES: &[&str] = &["Dessert", "Breakfast"];
pub const SPOONACULAR_DEFAULT_TYPES: &[&str] = &["dessert", "breakfast"];

const THEMEALDB_FILTER_URL: &str = "https://www.themealdb.com/api/json/v1/1/filter.php";
const THEMEALDB_LOOKUP_URL: &str = "https://www.themealdb.com/api/json/v1/1/lookup.php";
const SPOONACULAR_SEARCH_URL: &str = "https://api.spoonacular.com/recipes/complexSearch";
const SPOONACULAR_BULK_URL: &str = "https://api.spoonacular.com/recipes/informationBulk";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Payload(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait RecipeFetcher: Send + Sync {
    fn source_name(&self) -> SourceName;

    /// Fetch all raw records for this source, serving each label from the
    /// cache unless `refresh` is set.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        cache: &RawCache,
        refresh: bool,
    ) -> Result<Vec<RawRecipe>, AdapterError>;
}

/// Build the fetcher for a source. `labels` are TheMealDB categories or
/// Spoonacular dish types; empty means source defaults.
pub fn fetcher_for_source(
    source: SourceName,
    labels: Vec<String>,
    spoonacular_api_key: Option<String>,
) -> Box<dyn RecipeFetcher> {
    match source {
        SourceName::Themealdb => Box::new(TheMealDbFetcher::new(labels)),
        SourceName::Spoonacular => Box::new(SpoonacularFetcher::new(labels, spoonacular_api_key)),
    }
}

pub struct TheMealDbFetcher {
    categories: Vec<String>,
}

impl TheMealDbFetcher {
    pub fn new(categories: Vec<String>) -> Self {
        let categories = if categories.is_empty() {
            THEMEALDB_DEFAULT_CATEGORIES
                .iter()
                .map(|c| c.to_string())
                .collect()
        } else {
            categories
        };
        Self { categories }
    }

    async fn fetch_category(
        &self,
        http: &HttpFetcher,
        category: &str,
    ) -> Result<Vec<RawRecipe>, AdapterError> {
        let body = http
            .get_bytes("themealdb", THEMEALDB_FILTER_URL, &[("c", category)])
            .await?;
        let listing: JsonValue = serde_json::from_slice(&body)
            .map_err(|e| AdapterError::Payload(format!("decoding themealdb listing: {e}")))?;

        // The listing endpoint can repeat ids; keep listing order.
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        for meal in listing
            .get("meals")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(id) = value_string(meal.get("idMeal")) {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
        }

        let mut batch = Vec::new();
        for id in &ids {
            let body = http
                .get_bytes("themealdb", THEMEALDB_LOOKUP_URL, &[("i", id)])
                .await?;
            let detail: JsonValue = serde_json::from_slice(&body)
                .map_err(|e| AdapterError::Payload(format!("decoding themealdb detail {id}: {e}")))?;
            match detail
                .get("meals")
                .and_then(JsonValue::as_array)
                .and_then(|meals| meals.first())
            {
                Some(meal) => batch.push(parse_themealdb_meal(meal)),
                None => warn!(category, meal_id = %id, "no detail returned for themealdb meal"),
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl RecipeFetcher for TheMealDbFetcher {
    fn source_name(&self) -> SourceName {
        SourceName::Themealdb
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        cache: &RawCache,
        refresh: bool,
    ) -> Result<Vec<RawRecipe>, AdapterError> {
        let mut records = Vec::new();
        for category in &self.categories {
            let cached = if refresh {
                None
            } else {
                cache.load(self.source_name().as_str(), category).await?
            };

            let batch = match cached {
                Some(batch) => {
                    info!(%category, recipes = batch.len(), "themealdb category served from cache");
                    batch
                }
                None => {
                    info!(%category, "fetching themealdb category from api");
                    let batch = self.fetch_category(http, category).await?;
                    cache
                        .store(self.source_name().as_str(), category, &batch)
                        .await?;
                    info!(%category, recipes = batch.len(), "cached themealdb category");
                    batch
                }
            };
            records.extend(batch);
        }
        Ok(records)
    }
}

pub struct SpoonacularFetcher {
    dish_types: Vec<String>,
    api_key: Option<String>,
}

impl SpoonacularFetcher {
    pub fn new(dish_types: Vec<String>, api_key: Option<String>) -> Self {
        let dish_types = if dish_types.is_empty() {
            SPOONACULAR_DEFAULT_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect()
        } else {
            dish_types
        };
        Self {
            dish_types,
            api_key,
        }
    }

    async fn fetch_dish_type(
        &self,
        http: &HttpFetcher,
        dish_type: &str,
        api_key: &str,
    ) -> Result<Vec<RawRecipe>, AdapterError> {
        let body = http
            .get_bytes(
                "spoonacular",
                SPOONACULAR_SEARCH_URL,
                &[
                    ("apiKey", api_key),
                    ("type", dish_type),
                    ("instructionsRequired", "true"),
                    ("number", "100"),
                ],
            )
            .await?;
        let payload: JsonValue = serde_json::from_slice(&body)
            .map_err(|e| AdapterError::Payload(format!("decoding spoonacular search: {e}")))?;

        let ids: Vec<String> = payload
            .get("results")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .filter_map(|result| value_string(result.get("id")))
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        info!(dish_type, ids = ids.len(), "fetching spoonacular details via bulk endpoint");
        let ids_param = ids.join(",");
        let body = http
            .get_bytes(
                "spoonacular",
                SPOONACULAR_BULK_URL,
                &[("ids", ids_param.as_str()), ("apiKey", api_key)],
            )
            .await?;
        let details: Vec<JsonValue> = serde_json::from_slice(&body)
            .map_err(|e| AdapterError::Payload(format!("decoding spoonacular bulk details: {e}")))?;

        Ok(details
            .iter()
            .map(|detail| parse_spoonacular_recipe(detail, dish_type))
            .collect())
    }
}

#[async_trait]
impl RecipeFetcher for SpoonacularFetcher {
    fn source_name(&self) -> SourceName {
        SourceName::Spoonacular
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        cache: &RawCache,
        refresh: bool,
    ) -> Result<Vec<RawRecipe>, AdapterError> {
        let Some(api_key) = self.api_key.clone() else {
            warn!("spoonacular api key not set; skipping spoonacular fetch");
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for dish_type in &self.dish_types {
            let cached = if refresh {
                None
            } else {
                cache.load(self.source_name().as_str(), dish_type).await?
            };

            let batch = match cached {
                Some(batch) => {
                    info!(%dish_type, recipes = batch.len(), "spoonacular dish type served from cache");
                    batch
                }
                None => {
                    info!(%dish_type, "fetching spoonacular dish type from api");
                    let batch = self.fetch_dish_type(http, dish_type, &api_key).await?;
                    cache
                        .store(self.source_name().as_str(), dish_type, &batch)
                        .await?;
                    info!(%dish_type, recipes = batch.len(), "cached spoonacular dish type");
                    batch
                }
            };
            records.extend(batch);
        }
        Ok(records)
    }
}

/// Map one TheMealDB `lookup.php` meal object into the raw shape. Ingredient
/// slots are the numbered `strIngredient1..=20` / `strMeasure1..=20` pairs;
/// blank names end the useful part of the slot list but are simply skipped.
pub fn parse_themealdb_meal(meal: &JsonValue) -> RawRecipe {
    let mut ingredients = Vec::new();
    for i in 1..=20 {
        let name = text_field(meal, &format!("strIngredient{i}"));
        let measure = text_field(meal, &format!("strMeasure{i}"));
        if let Some(name) = name {
            ingredients.push(RawIngredient {
                ingredient: Some(name),
                measure,
            });
        }
    }

    RawRecipe {
        source_name: SourceName::Themealdb,
        source_id: value_string(meal.get("idMeal")),
        name: text_field(meal, "strMeal"),
        category: text_field(meal, "strCategory"),
        area: text_field(meal, "strArea"),
        instructions: text_field(meal, "strInstructions"),
        thumbnail: text_field(meal, "strMealThumb"),
        ingredients,
    }
}

/// Map one Spoonacular `informationBulk` entry into the raw shape.
pub fn parse_spoonacular_recipe(recipe: &JsonValue, dish_type: &str) -> RawRecipe {
    let mut ingredients = Vec::new();
    for item in recipe
        .get("extendedIngredients")
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
    {
        let name = text_field(item, "nameClean")
            .or_else(|| text_field(item, "name"))
            .or_else(|| text_field(item, "originalName"))
            .or_else(|| text_field(item, "original"));
        if let Some(name) = name {
            ingredients.push(RawIngredient {
                ingredient: Some(name),
                measure: format_spoonacular_measure(item),
            });
        }
    }

    let cuisines: Vec<String> = recipe
        .get("cuisines")
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
        .filter_map(|cuisine| cuisine.as_str())
        .map(|cuisine| cuisine.trim().to_string())
        .filter(|cuisine| !cuisine.is_empty())
        .collect();
    let area = if cuisines.is_empty() {
        None
    } else {
        Some(cuisines.join(", "))
    };

    RawRecipe {
        source_name: SourceName::Spoonacular,
        source_id: value_string(recipe.get("id")),
        name: text_field(recipe, "title"),
        category: if dish_type.is_empty() {
            None
        } else {
            Some(title_case(dish_type))
        },
        area,
        instructions: build_instruction_text(recipe),
        thumbnail: text_field(recipe, "image"),
        ingredients,
    }
}

/// Prefer the flat `instructions` text, falling back to joining the steps of
/// `analyzedInstructions`.
fn build_instruction_text(recipe: &JsonValue) -> Option<String> {
    if let Some(text) = text_field(recipe, "instructions") {
        return Some(text);
    }

    let mut steps = Vec::new();
    for section in recipe
        .get("analyzedInstructions")
        .and_then(JsonValue::as_array)
        .into_iter()
        .flatten()
    {
        for step in section
            .get("steps")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(text) = text_field(step, "step") {
                steps.push(text);
            }
        }
    }
    if steps.is_empty() {
        None
    } else {
        Some(steps.join("\n"))
    }
}

/// Format a measure from the structured `measures` block (metric preferred,
/// then US), falling back to the free-text variants.
fn format_spoonacular_measure(item: &JsonValue) -> Option<String> {
    for system in ["metric", "us"] {
        let Some(data) = item.get("measures").and_then(|m| m.get(system)) else {
            continue;
        };
        let Some(amount) = data.get("amount").and_then(JsonValue::as_f64) else {
            continue;
        };
        let amount_str = format_amount(amount);
        return Some(
            match text_field(data, "unitShort").or_else(|| text_field(data, "unitLong")) {
                Some(unit) => format!("{amount_str} {unit}"),
                None => amount_str,
            },
        );
    }
    text_field(item, "originalString")
        .or_else(|| text_field(item, "originalName"))
        .or_else(|| text_field(item, "original"))
}

fn format_amount(amount: f64) -> String {
    if (amount - amount.round()).abs() < 1e-9 {
        format!("{}", amount.round() as i64)
    } else {
        format!("{amount}")
    }
}

fn title_case(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_field(value: &JsonValue, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn value_string(value: Option<&JsonValue>) -> Option<String> {
    match value {
        Some(JsonValue::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn themealdb_meal_maps_numbered_ingredient_slots() {
        let meal = json!({
            "idMeal": "52893",
            "strMeal": "Apple Crumble",
            "strCategory": "Dessert",
            "strArea": "British",
            "strInstructions": "Heat oven. Bake.",
            "strMealThumb": "https://example.test/crumble.jpg",
            "strIngredient1": "Apples",
            "strMeasure1": "4 ",
            "strIngredient2": "  ",
            "strMeasure2": "ignored with blank name",
            "strIngredient3": "Butter",
            "strMeasure3": null,
        });

        let recipe = parse_themealdb_meal(&meal);
        assert_eq!(recipe.source_name, SourceName::Themealdb);
        assert_eq!(recipe.source_id.as_deref(), Some("52893"));
        assert_eq!(recipe.name.as_deref(), Some("Apple Crumble"));
        assert_eq!(recipe.ingredients.len(), 2);
        assert_eq!(recipe.ingredients[0].ingredient.as_deref(), Some("Apples"));
        assert_eq!(recipe.ingredients[0].measure.as_deref(), Some("4"));
        assert_eq!(recipe.ingredients[1].ingredient.as_deref(), Some("Butter"));
        assert_eq!(recipe.ingredients[1].measure, None);
    }

    #[test]
    fn spoonacular_recipe_maps_bulk_detail_fields() {
        let detail = json!({
            "id": 716429,
            "title": "Pasta with Garlic",
            "image": "https://example.test/pasta.jpg",
            "cuisines": ["Mediterranean", "Italian"],
            "instructions": null,
            "analyzedInstructions": [
                {"steps": [{"step": "Boil the pasta."}, {"step": "Add garlic."}]}
            ],
            "extendedIngredients": [
                {
                    "nameClean": "garlic",
                    "measures": {"metric": {"amount": 2.0, "unitShort": "cloves"}}
                },
                {
                    "name": "olive oil",
                    "measures": {"metric": {"amount": 1.5, "unitShort": "tbsp"}}
                },
                {
                    "originalName": "parsley",
                    "original": "a handful of parsley"
                }
            ]
        });

        let recipe = parse_spoonacular_recipe(&detail, "dessert");
        assert_eq!(recipe.source_name, SourceName::Spoonacular);
        assert_eq!(recipe.source_id.as_deref(), Some("716429"));
        assert_eq!(recipe.category.as_deref(), Some("Dessert"));
        assert_eq!(recipe.area.as_deref(), Some("Mediterranean, Italian"));
        assert_eq!(
            recipe.instructions.as_deref(),
            Some("Boil the pasta.\nAdd garlic.")
        );

        assert_eq!(recipe.ingredients.len(), 3);
        assert_eq!(recipe.ingredients[0].measure.as_deref(), Some("2 cloves"));
        assert_eq!(recipe.ingredients[1].measure.as_deref(), Some("1.5 tbsp"));
        // No structured measure: falls back to the free-text form.
        assert_eq!(recipe.ingredients[2].ingredient.as_deref(), Some("parsley"));
        assert_eq!(
            recipe.ingredients[2].measure.as_deref(),
            Some("a handful of parsley")
        );
    }

    #[test]
    fn amounts_drop_trailing_zero_fractions() {
        assert_eq!(format_amount(2.0), "2");
        assert_eq!(format_amount(1.5), "1.5");
        assert_eq!(format_amount(0.25), "0.25");
    }

    #[test]
    fn dish_types_are_title_cased_for_category() {
        assert_eq!(title_case("dessert"), "Dessert");
        assert_eq!(title_case("main course"), "Main Course");
    }
}
