//! Sync pipeline: normalize -> quality gate -> parquet export -> upsert.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use pantry_adapters::{
    fetcher_for_source, RecipeFetcher, SPOONACULAR_DEFAULT_TYPES, THEMEALDB_DEFAULT_CATEGORIES,
};
use pantry_core::{NormalizedIngredient, NormalizedRecipe, RawRecipe, SourceName};
use pantry_storage::{HttpClientConfig, HttpFetcher, PacingConfig, RawCache};
use pantry_warehouse::{LoadReport, RunStatus, RunUpdate, Warehouse};
use parquet::arrow::ArrowWriter;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "pantry-sync";

// ---------------------------------------------------------------------------
// Ingredient normalization
// ---------------------------------------------------------------------------

/// Exact whole-string plural -> singular substitutions. Not a stemmer.
const PLURAL_REPLACEMENTS: &[(&str, &str)] = &[
    ("eggs", "egg"),
    ("tomatoes", "tomato"),
    ("potatoes", "potato"),
    ("chilies", "chili"),
    ("berries", "berry"),
    ("avocados", "avocado"),
    ("coconuts", "coconut"),
    ("cucumbers", "cucumber"),
    ("leeks", "leek"),
    ("onions", "onion"),
    ("pineapples", "pineapple"),
    ("pumpkins", "pumpkin"),
    ("radishes", "radish"),
    ("strawberries", "strawberry"),
    ("bananas", "banana"),
    ("apples", "apple"),
    ("oranges", "orange"),
    ("pears", "pear"),
    ("plums", "plum"),
    ("cherries", "cherry"),
    ("grapes", "grape"),
    ("melons", "melon"),
    ("nectarines", "nectarine"),
];

/// Names that carry no information. "na" is the punctuation-stripped image
/// of "n/a".
const NAME_STOPLIST: &[&str] = &["n/a", "na", "none", "null", "unknown"];

/// Leading quantity fragments accidentally merged into ingredient names by
/// upstream sources. Ordered; the first matching rule strips, the rest are
/// skipped, and only the leading match is touched. These run after
/// punctuation stripping, so "1 1/2 cups" arrives here as "1 12 cups".
static GARBAGE_PREFIXES: Lazy<[Regex; 3]> = Lazy::new(|| {
    [
        // "3 oz of pearl tapioca"
        Regex::new(r"^\d+\s*[a-z]*\s+of\s+").expect("hard-coded regex to be valid"),
        // "1 12 cups flour"
        Regex::new(r"^\d+\s+\d+\s+[a-z]+\s+").expect("hard-coded regex to be valid"),
        // "4 large onions"
        Regex::new(r"^\d+\s+[a-z]+\s+").expect("hard-coded regex to be valid"),
    ]
});

/// Canonicalize a raw ingredient name, or reject it.
///
/// Trims, lowercases, strips punctuation, collapses whitespace, removes a
/// leading quantity fragment, substitutes known plurals, and filters out
/// names that are too short or meaningless. Deterministic, and a fixed point
/// on every accepted output.
pub fn normalize_name(raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }

    let lowered = raw.to_lowercase();
    let stripped: String = lowered
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    let mut name = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    for rule in GARBAGE_PREFIXES.iter() {
        if let Some(found) = rule.find(&name) {
            name = name[found.end()..].trim().to_string();
            break;
        }
    }

    if let Some((_, singular)) = PLURAL_REPLACEMENTS
        .iter()
        .find(|(plural, _)| name == *plural)
    {
        name = (*singular).to_string();
    }

    if name.chars().count() < 2 || NAME_STOPLIST.contains(&name.as_str()) {
        return None;
    }
    Some(name)
}

/// Light measure cleanup. Measures stay opaque display text; no quantity or
/// unit parsing happens here.
pub fn normalize_measure(raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }

    let measure = raw.to_lowercase().replace("to taste", "");
    let measure = measure.trim();
    if measure.is_empty() || measure == "n/a" || measure == "null" {
        return None;
    }
    Some(measure.to_string())
}

// ---------------------------------------------------------------------------
// Batch normalization
// ---------------------------------------------------------------------------

/// Merge a raw batch into the canonical shape.
///
/// Records without a natural key are skipped with a warning; repeated keys
/// keep the first occurrence. Ingredient entries whose name fails
/// canonicalization are dropped whole, measure included. Pure aside from log
/// output; a malformed record never aborts the batch.
pub fn normalize_batch(raw_batch: &[RawRecipe]) -> Vec<NormalizedRecipe> {
    let mut seen: HashSet<(SourceName, String)> = HashSet::new();
    let mut normalized = Vec::new();

    for record in raw_batch {
        let Some(source_id) = record.source_id.as_deref() else {
            warn!(
                source = %record.source_name,
                name = record.name.as_deref().unwrap_or("<unnamed>"),
                "skipping recipe with missing source id"
            );
            continue;
        };
        if !seen.insert((record.source_name, source_id.to_string())) {
            debug!(source = %record.source_name, source_id, "skipping duplicate recipe");
            continue;
        }

        let mut ingredients = Vec::new();
        for entry in &record.ingredients {
            let Some(name) = normalize_name(entry.ingredient.as_deref()) else {
                continue;
            };
            let display_name = entry
                .ingredient
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string();
            ingredients.push(NormalizedIngredient {
                name,
                display_name,
                measure: normalize_measure(entry.measure.as_deref()),
            });
        }

        normalized.push(NormalizedRecipe {
            source_name: record.source_name,
            source_id: source_id.to_string(),
            name: record.name.clone(),
            category: record.category.clone(),
            area: record.area.clone(),
            instructions: record.instructions.clone(),
            thumbnail: record.thumbnail.clone(),
            ingredients,
        });
    }

    info!(
        normalized = normalized.len(),
        raw = raw_batch.len(),
        "normalized raw batch"
    );
    normalized
}

// ---------------------------------------------------------------------------
// Data quality
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityCheckResult {
    pub check_name: String,
    pub passed: bool,
    pub message: String,
    pub metric_value: Option<f64>,
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct QualityConfig {
    pub min_record_count: usize,
    pub max_record_count: Option<usize>,
    pub ingredient_coverage_threshold: f64,
    pub category_threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_record_count: 1,
            max_record_count: None,
            ingredient_coverage_threshold: 0.8,
            category_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualitySummary {
    pub total_checks: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f64,
}

/// Aggregate of every failed rule, raised only in strict mode.
#[derive(Debug, Error)]
#[error("data quality checks failed ({failed} failures):\n{details}")]
pub struct QualityGateError {
    pub failed: usize,
    details: String,
}

/// Immutable result list from one quality evaluation.
#[derive(Debug, Clone, Default)]
pub struct QualityReport {
    pub results: Vec<QualityCheckResult>,
}

impl QualityReport {
    pub fn summary(&self) -> QualitySummary {
        let total_checks = self.results.len();
        let passed = self.results.iter().filter(|r| r.passed).count();
        QualitySummary {
            total_checks,
            passed,
            failed: total_checks - passed,
            pass_rate: if total_checks == 0 {
                0.0
            } else {
                passed as f64 / total_checks as f64
            },
        }
    }

    pub fn failed_checks(&self) -> Vec<&QualityCheckResult> {
        self.results.iter().filter(|r| !r.passed).collect()
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Strict-mode gate: one aggregated error listing every failed rule.
    pub fn strict_gate(&self) -> std::result::Result<(), QualityGateError> {
        let failed = self.failed_checks();
        if failed.is_empty() {
            return Ok(());
        }
        let details = failed
            .iter()
            .map(|r| match (r.threshold, r.metric_value) {
                (Some(threshold), Some(metric)) => format!(
                    "  - {}: {} (expected >= {threshold:.2}, actual {metric:.2})",
                    r.check_name, r.message
                ),
                _ => format!("  - {}: {}", r.check_name, r.message),
            })
            .collect::<Vec<_>>()
            .join("\n");
        Err(QualityGateError {
            failed: failed.len(),
            details,
        })
    }

    pub fn log_summary(&self) {
        let summary = self.summary();
        info!(
            total = summary.total_checks,
            passed = summary.passed,
            failed = summary.failed,
            pass_rate = %format!("{:.2}%", summary.pass_rate * 100.0),
            "data quality summary"
        );
        for result in &self.results {
            if result.passed {
                info!(check = %result.check_name, "{}", result.message);
            } else {
                warn!(
                    check = %result.check_name,
                    metric = ?result.metric_value,
                    threshold = ?result.threshold,
                    "{}",
                    result.message
                );
            }
        }
    }
}

/// Run the fixed rule set against a normalized batch. Every rule runs; the
/// evaluation never short-circuits, so callers always see the full picture.
pub fn evaluate_batch(batch: &[NormalizedRecipe], config: &QualityConfig) -> QualityReport {
    let total = batch.len();
    let results = vec![
        check_record_count(batch, config),
        // source_name is an enum and source_id is non-optional after
        // normalization; these two exist to catch normalizer regressions.
        check_not_null("source_name", total, total, 1.0),
        check_not_null(
            "source_id",
            total,
            batch.iter().filter(|r| !r.source_id.is_empty()).count(),
            1.0,
        ),
        check_not_null(
            "name",
            total,
            batch.iter().filter(|r| r.name.is_some()).count(),
            1.0,
        ),
        check_unique_source_combo(batch),
        check_recipes_with_ingredients(batch, config.ingredient_coverage_threshold),
        check_not_null(
            "category",
            total,
            batch.iter().filter(|r| r.category.is_some()).count(),
            config.category_threshold,
        ),
    ];
    QualityReport { results }
}

fn check_record_count(batch: &[NormalizedRecipe], config: &QualityConfig) -> QualityCheckResult {
    let count = batch.len();
    let mut violations = Vec::new();
    if count < config.min_record_count {
        violations.push(format!(
            "record count {count} is below minimum {}",
            config.min_record_count
        ));
    }
    if let Some(max) = config.max_record_count {
        if count > max {
            violations.push(format!("record count {count} exceeds maximum {max}"));
        }
    }

    let passed = violations.is_empty();
    QualityCheckResult {
        check_name: "record_count".to_string(),
        passed,
        message: if passed {
            format!("record count: {count}")
        } else {
            format!("record count: {count}; {}", violations.join("; "))
        },
        metric_value: Some(count as f64),
        threshold: None,
    }
}

fn check_not_null(column: &str, total: usize, non_null: usize, threshold: f64) -> QualityCheckResult {
    if total == 0 {
        return QualityCheckResult {
            check_name: format!("not_null_{column}"),
            passed: false,
            message: "batch is empty".to_string(),
            metric_value: Some(0.0),
            threshold: Some(threshold),
        };
    }

    let proportion = non_null as f64 / total as f64;
    QualityCheckResult {
        check_name: format!("not_null_{column}"),
        passed: proportion >= threshold,
        message: format!(
            "column '{column}': {non_null}/{total} non-null ({:.2}%)",
            proportion * 100.0
        ),
        metric_value: Some(proportion),
        threshold: Some(threshold),
    }
}

fn check_unique_source_combo(batch: &[NormalizedRecipe]) -> QualityCheckResult {
    let unique: HashSet<_> = batch.iter().map(NormalizedRecipe::natural_key).collect();
    let duplicates = batch.len() - unique.len();
    QualityCheckResult {
        check_name: "unique_source_combo".to_string(),
        passed: duplicates == 0,
        message: format!(
            "source combinations: {} unique, {duplicates} duplicates",
            unique.len()
        ),
        metric_value: Some(duplicates as f64),
        threshold: None,
    }
}

fn check_recipes_with_ingredients(batch: &[NormalizedRecipe], threshold: f64) -> QualityCheckResult {
    let total = batch.len();
    let with_ingredients = batch
        .iter()
        .filter(|r| r.ingredients.iter().any(|i| !i.name.is_empty()))
        .count();
    let coverage = if total == 0 {
        0.0
    } else {
        with_ingredients as f64 / total as f64
    };

    QualityCheckResult {
        check_name: "recipes_with_ingredients".to_string(),
        passed: coverage >= threshold,
        message: format!(
            "{with_ingredients}/{total} recipes have at least one named ingredient ({:.2}%)",
            coverage * 100.0
        ),
        metric_value: Some(coverage),
        threshold: Some(threshold),
    }
}

// ---------------------------------------------------------------------------
// Source registry + config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub source: SourceName,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// TheMealDB categories or Spoonacular dish types; empty means source
    /// defaults.
    #[serde(default)]
    pub labels: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl SourceRegistry {
    pub fn defaults() -> Self {
        Self {
            sources: vec![
                SourceEntry {
                    source: SourceName::Themealdb,
                    enabled: true,
                    labels: THEMEALDB_DEFAULT_CATEGORIES
                        .iter()
                        .map(|c| c.to_string())
                        .collect(),
                },
                SourceEntry {
                    source: SourceName::Spoonacular,
                    enabled: true,
                    labels: SPOONACULAR_DEFAULT_TYPES
                        .iter()
                        .map(|t| t.to_string())
                        .collect(),
                },
            ],
        }
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no source registry file; using defaults");
            return Ok(Self::defaults());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub raw_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub registry_path: PathBuf,
    pub spoonacular_api_key: Option<String>,
    pub strict_quality: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://pantry.db".to_string()),
            raw_dir: std::env::var("PANTRY_RAW_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/raw")),
            processed_dir: std::env::var("PANTRY_PROCESSED_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/processed")),
            registry_path: std::env::var("PANTRY_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            spoonacular_api_key: std::env::var("SPOONACULAR_API_KEY")
                .ok()
                .filter(|key| !key.is_empty()),
            strict_quality: env_flag("PANTRY_STRICT_QUALITY"),
            scheduler_enabled: env_flag("PANTRY_SCHEDULER_ENABLED"),
            sync_cron: std::env::var("PANTRY_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            user_agent: std::env::var("PANTRY_USER_AGENT")
                .unwrap_or_else(|_| "pantry-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("PANTRY_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Parquet export
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write the columnar snapshot of a normalized batch and return the manifest
/// path.
pub fn export_parquet(processed_dir: &Path, batch: &[NormalizedRecipe]) -> Result<PathBuf> {
    std::fs::create_dir_all(processed_dir)
        .with_context(|| format!("creating {}", processed_dir.display()))?;

    let recipes_path = processed_dir.join("recipes.parquet");
    let links_path = processed_dir.join("recipe_ingredients.parquet");
    write_recipes_parquet(&recipes_path, batch)?;
    write_links_parquet(&links_path, batch)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("recipes", processed_dir, &recipes_path)?,
            manifest_entry("recipe_ingredients", processed_dir, &links_path)?,
        ],
    };
    let manifest_path = processed_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(
        recipes = batch.len(),
        manifest = %manifest_path.display(),
        "exported parquet snapshot"
    );
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_recipes_parquet(path: &Path, batch: &[NormalizedRecipe]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_name", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, true),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("area", DataType::Utf8, true),
        ArrowField::new("instructions", DataType::Utf8, true),
        ArrowField::new("thumbnail", DataType::Utf8, true),
        ArrowField::new("ingredient_count", DataType::UInt32, false),
    ]));

    let source_names = StringArray::from(
        batch
            .iter()
            .map(|r| Some(r.source_name.as_str()))
            .collect::<Vec<_>>(),
    );
    let source_ids = StringArray::from(
        batch
            .iter()
            .map(|r| Some(r.source_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let names = StringArray::from(batch.iter().map(|r| r.name.as_deref()).collect::<Vec<_>>());
    let categories =
        StringArray::from(batch.iter().map(|r| r.category.as_deref()).collect::<Vec<_>>());
    let areas = StringArray::from(batch.iter().map(|r| r.area.as_deref()).collect::<Vec<_>>());
    let instructions = StringArray::from(
        batch
            .iter()
            .map(|r| r.instructions.as_deref())
            .collect::<Vec<_>>(),
    );
    let thumbnails = StringArray::from(
        batch
            .iter()
            .map(|r| r.thumbnail.as_deref())
            .collect::<Vec<_>>(),
    );
    let ingredient_counts = UInt32Array::from(
        batch
            .iter()
            .map(|r| r.ingredients.len() as u32)
            .collect::<Vec<_>>(),
    );

    let record_batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_names),
            Arc::new(source_ids),
            Arc::new(names),
            Arc::new(categories),
            Arc::new(areas),
            Arc::new(instructions),
            Arc::new(thumbnails),
            Arc::new(ingredient_counts),
        ],
    )
    .context("building recipes record batch")?;
    write_parquet(path, record_batch)
}

fn write_links_parquet(path: &Path, batch: &[NormalizedRecipe]) -> Result<()> {
    let rows: Vec<_> = batch
        .iter()
        .flat_map(|recipe| {
            recipe.ingredients.iter().map(move |ingredient| {
                (
                    recipe.source_name.as_str(),
                    recipe.source_id.as_str(),
                    ingredient.name.as_str(),
                    ingredient.display_name.as_str(),
                    ingredient.measure.as_deref(),
                )
            })
        })
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_name", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("ingredient", DataType::Utf8, false),
        ArrowField::new("display_name", DataType::Utf8, false),
        ArrowField::new("measure", DataType::Utf8, true),
    ]));

    let source_names =
        StringArray::from(rows.iter().map(|(s, ..)| Some(*s)).collect::<Vec<_>>());
    let source_ids =
        StringArray::from(rows.iter().map(|(_, id, ..)| Some(*id)).collect::<Vec<_>>());
    let ingredients = StringArray::from(
        rows.iter()
            .map(|(_, _, name, ..)| Some(*name))
            .collect::<Vec<_>>(),
    );
    let display_names = StringArray::from(
        rows.iter()
            .map(|(_, _, _, display, _)| Some(*display))
            .collect::<Vec<_>>(),
    );
    let measures = StringArray::from(
        rows.iter()
            .map(|(_, _, _, _, measure)| *measure)
            .collect::<Vec<_>>(),
    );

    let record_batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_names),
            Arc::new(source_ids),
            Arc::new(ingredients),
            Arc::new(display_names),
            Arc::new(measures),
        ],
    )
    .context("building recipe_ingredients record batch")?;
    write_parquet(path, record_batch)
}

fn manifest_entry(name: &str, processed_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(processed_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_extracted: usize,
    pub records_transformed: usize,
    pub quality_passed: bool,
    pub load: LoadReport,
    pub raw_snapshot: String,
    pub parquet_manifest: String,
}

pub fn generate_run_id() -> String {
    format!("etl_{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"))
}

pub struct SyncPipeline {
    config: SyncConfig,
    cache: RawCache,
    http: HttpFetcher,
    fetchers: Vec<Box<dyn RecipeFetcher>>,
    warehouse: Warehouse,
    quality: QualityConfig,
}

impl SyncPipeline {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load_or_default(&config.registry_path)?;
        let cache = RawCache::new(config.raw_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            // Polite pacing for the per-meal detail lookups.
            pacing: Some(PacingConfig {
                capacity: 2,
                refill_every: Duration::from_millis(100),
            }),
            ..Default::default()
        })?;

        let fetchers = registry
            .sources
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| {
                fetcher_for_source(
                    entry.source,
                    entry.labels.clone(),
                    config.spoonacular_api_key.clone(),
                )
            })
            .collect();

        let warehouse = Warehouse::connect(&config.database_url)
            .await
            .context("connecting to warehouse")?;
        warehouse.init_schema().await.context("initializing schema")?;

        Ok(Self {
            config,
            cache,
            http,
            fetchers,
            warehouse,
            quality: QualityConfig::default(),
        })
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    /// Run one full extract -> transform -> quality -> export -> load cycle.
    pub async fn run_once(&self, refresh: bool) -> Result<RunSummary> {
        let run_id = generate_run_id();
        let started_at = Utc::now();
        info!(%run_id, "starting etl run");
        self.warehouse
            .record_run(&run_id, RunStatus::Running, RunUpdate::default())
            .await?;

        match self.run_phases(&run_id, refresh, started_at).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                let update = RunUpdate {
                    error_message: Some(format!("{err:#}")),
                    ..RunUpdate::default()
                };
                if let Err(record_err) = self
                    .warehouse
                    .record_run(&run_id, RunStatus::Failed, update)
                    .await
                {
                    warn!(%run_id, error = %record_err, "could not record failed run");
                }
                Err(err)
            }
        }
    }

    async fn run_phases(
        &self,
        run_id: &str,
        refresh: bool,
        started_at: DateTime<Utc>,
    ) -> Result<RunSummary> {
        // Extract: all enabled sources, merged first-seen by natural key.
        let mut merged: Vec<RawRecipe> = Vec::new();
        let mut seen: HashSet<(SourceName, String)> = HashSet::new();
        for fetcher in &self.fetchers {
            let records = fetcher
                .fetch(&self.http, &self.cache, refresh)
                .await
                .with_context(|| format!("fetching {}", fetcher.source_name()))?;
            info!(source = %fetcher.source_name(), records = records.len(), "fetched source");
            for record in records {
                match record.natural_key() {
                    Some((source, id)) => {
                        if seen.insert((source, id.to_string())) {
                            merged.push(record);
                        }
                    }
                    // Keyless records pass through; the normalizer logs and
                    // drops them so the skip shows up in one place.
                    None => merged.push(record),
                }
            }
        }
        let snapshot = self.cache.save_snapshot("recipes_initial", &merged).await?;
        let records_extracted = merged.len();
        self.warehouse
            .record_run(
                run_id,
                RunStatus::Running,
                RunUpdate {
                    raw_file_path: Some(snapshot.path.display().to_string()),
                    records_extracted: Some(records_extracted as i64),
                    extract_timestamp: Some(Utc::now()),
                    ..RunUpdate::default()
                },
            )
            .await?;

        // Transform.
        let batch = normalize_batch(&merged);
        let records_transformed = batch.len();

        // Quality gate, advisory unless strict mode is on.
        let report = evaluate_batch(&batch, &self.quality);
        report.log_summary();
        let quality_passed = report.all_passed();
        if self.config.strict_quality {
            report.strict_gate()?;
        }

        // Columnar export.
        let manifest_path = export_parquet(&self.config.processed_dir, &batch)?;
        self.warehouse
            .record_run(
                run_id,
                RunStatus::Running,
                RunUpdate {
                    parquet_file_path: Some(manifest_path.display().to_string()),
                    records_transformed: Some(records_transformed as i64),
                    quality_check_passed: Some(quality_passed),
                    transform_timestamp: Some(Utc::now()),
                    ..RunUpdate::default()
                },
            )
            .await?;

        // Load.
        let load = self.warehouse.upsert_batch(&batch).await?;
        self.warehouse
            .record_run(
                run_id,
                RunStatus::Completed,
                RunUpdate {
                    records_loaded: Some(load.recipes_loaded),
                    load_timestamp: Some(Utc::now()),
                    ..RunUpdate::default()
                },
            )
            .await?;

        let finished_at = Utc::now();
        info!(
            run_id,
            records_extracted,
            records_transformed,
            recipes_loaded = load.recipes_loaded,
            quality_passed,
            "etl run completed"
        );

        Ok(RunSummary {
            run_id: run_id.to_string(),
            started_at,
            finished_at,
            records_extracted,
            records_transformed,
            quality_passed,
            load,
            raw_snapshot: snapshot.path.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        })
    }
}

pub async fn run_sync_once_from_env(refresh: bool) -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once(refresh).await
}

/// Build the cron scheduler when enabled; each firing runs a full sync.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job_pipeline = pipeline.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = job_pipeline.clone();
        Box::pin(async move {
            info!("scheduled sync triggered");
            if let Err(err) = pipeline.run_once(false).await {
                warn!(error = %format!("{err:#}"), "scheduled sync failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_core::RawIngredient;
    use tempfile::tempdir;

    fn raw(
        source_id: Option<&str>,
        name: &str,
        ingredients: &[(Option<&str>, Option<&str>)],
    ) -> RawRecipe {
        RawRecipe {
            source_name: SourceName::Themealdb,
            source_id: source_id.map(str::to_string),
            name: Some(name.to_string()),
            category: Some("Dessert".to_string()),
            area: None,
            instructions: None,
            thumbnail: None,
            ingredients: ingredients
                .iter()
                .map(|(ingredient, measure)| RawIngredient {
                    ingredient: ingredient.map(str::to_string),
                    measure: measure.map(str::to_string),
                })
                .collect(),
        }
    }

    fn normalized(source_id: &str, ingredient_names: &[&str]) -> NormalizedRecipe {
        NormalizedRecipe {
            source_name: SourceName::Themealdb,
            source_id: source_id.to_string(),
            name: Some(format!("Recipe {source_id}")),
            category: Some("Dessert".to_string()),
            area: None,
            instructions: None,
            thumbnail: None,
            ingredients: ingredient_names
                .iter()
                .map(|name| NormalizedIngredient {
                    name: name.to_string(),
                    display_name: name.to_string(),
                    measure: None,
                })
                .collect(),
        }
    }

    #[test]
    fn names_are_lowercased_trimmed_and_singularized() {
        assert_eq!(normalize_name(Some("Eggs")).as_deref(), Some("egg"));
        assert_eq!(normalize_name(Some("   butter   ")).as_deref(), Some("butter"));
        assert_eq!(normalize_name(Some("tomatoes")).as_deref(), Some("tomato"));
        assert_eq!(normalize_name(Some("Sea Salt")).as_deref(), Some("sea salt"));
    }

    #[test]
    fn leading_quantity_fragments_are_stripped() {
        assert_eq!(
            normalize_name(Some("3 oz of pearl tapioca")).as_deref(),
            Some("pearl tapioca")
        );
        assert_eq!(normalize_name(Some("4 large onions")).as_deref(), Some("onion"));
        assert_eq!(normalize_name(Some("1 1/2 cups flour")).as_deref(), Some("flour"));
        // No trailing word after the quantity: nothing to strip.
        assert_eq!(normalize_name(Some("2 eggs")).as_deref(), Some("2 eggs"));
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert_eq!(normalize_name(None), None);
        assert_eq!(normalize_name(Some("")), None);
        assert_eq!(normalize_name(Some("   ")), None);
        assert_eq!(normalize_name(Some("N/A")), None);
        assert_eq!(normalize_name(Some("none")), None);
        assert_eq!(normalize_name(Some("Unknown")), None);
        assert_eq!(normalize_name(Some("x")), None);
    }

    #[test]
    fn normalization_is_a_fixed_point() {
        for input in [
            "Eggs",
            "3 oz of pearl tapioca",
            "4 large onions",
            "1 1/2 cups flour",
            "double cream",
            "toffee popcorn",
        ] {
            let once = normalize_name(Some(input)).expect("accepted name");
            let twice = normalize_name(Some(once.as_str())).expect("accepted fixed point");
            assert_eq!(once, twice, "input {input:?}");
        }
    }

    #[test]
    fn measures_are_lightly_cleaned_not_parsed() {
        assert_eq!(normalize_measure(Some("2 tbsp")).as_deref(), Some("2 tbsp"));
        assert_eq!(normalize_measure(Some("  100 ML ")).as_deref(), Some("100 ml"));
        assert_eq!(normalize_measure(Some("to taste")), None);
        assert_eq!(normalize_measure(Some("Salt to taste")).as_deref(), Some("salt"));
        assert_eq!(normalize_measure(Some("")), None);
        assert_eq!(normalize_measure(Some("N/A")), None);
        assert_eq!(normalize_measure(None), None);
    }

    #[test]
    fn duplicate_keys_keep_the_first_occurrence() {
        let batch = normalize_batch(&[
            raw(Some("1"), "Cake", &[(Some("Eggs"), Some("2"))]),
            raw(Some("1"), "Cake Dup", &[]),
            raw(Some("2"), "Omelette", &[(Some("Eggs"), Some("3"))]),
        ]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].name.as_deref(), Some("Cake"));
        assert_eq!(batch[0].ingredients.len(), 1);
        assert_eq!(batch[0].ingredients[0].name, "egg");
        assert_eq!(batch[0].ingredients[0].display_name, "Eggs");
        assert_eq!(batch[0].ingredients[0].measure.as_deref(), Some("2"));
    }

    #[test]
    fn records_without_a_natural_key_are_dropped() {
        let batch = normalize_batch(&[
            raw(None, "Mystery", &[(Some("Eggs"), None)]),
            raw(Some("2"), "Kept", &[]),
        ]);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].source_id, "2");
    }

    #[test]
    fn unparseable_ingredients_are_dropped_whole() {
        let batch = normalize_batch(&[raw(
            Some("1"),
            "Cake",
            &[
                (Some("N/A"), Some("2 tbsp")),
                (None, Some("1 tsp")),
                (Some("Flour"), Some("200g")),
                (Some("Eggs"), None),
            ],
        )]);
        // Rejected names discard their measures too; order is preserved.
        let names: Vec<_> = batch[0].ingredients.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["flour", "egg"]);
    }

    #[test]
    fn ingredient_coverage_below_threshold_fails() {
        let mut batch: Vec<NormalizedRecipe> = (0..7)
            .map(|i| normalized(&format!("with-{i}"), &["egg"]))
            .collect();
        batch.extend((0..3).map(|i| normalized(&format!("without-{i}"), &[])));

        let report = evaluate_batch(&batch, &QualityConfig::default());
        let coverage = report
            .results
            .iter()
            .find(|r| r.check_name == "recipes_with_ingredients")
            .expect("coverage rule");
        assert!(!coverage.passed);
        assert_eq!(coverage.metric_value, Some(0.7));
        assert_eq!(coverage.threshold, Some(0.8));
        // The rest of the rules still ran.
        assert_eq!(report.results.len(), 7);
        assert!(!report.all_passed());
    }

    #[test]
    fn clean_batches_pass_every_rule() {
        let batch = vec![normalized("1", &["egg"]), normalized("2", &["flour"])];
        let report = evaluate_batch(&batch, &QualityConfig::default());
        assert!(report.all_passed());
        let summary = report.summary();
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.pass_rate, 1.0);
        assert!(report.strict_gate().is_ok());
    }

    #[test]
    fn empty_batches_fail_the_gate() {
        let report = evaluate_batch(&[], &QualityConfig::default());
        let record_count = report
            .results
            .iter()
            .find(|r| r.check_name == "record_count")
            .expect("record_count rule");
        assert!(!record_count.passed);

        let err = report.strict_gate().expect_err("strict gate fires");
        assert!(err.to_string().contains("record_count"));
        assert!(err.to_string().contains("not_null_name"));
    }

    #[test]
    fn repeated_natural_keys_fail_the_uniqueness_rule() {
        let batch = vec![normalized("1", &["egg"]), normalized("1", &["egg"])];
        let report = evaluate_batch(&batch, &QualityConfig::default());
        let combo = report
            .results
            .iter()
            .find(|r| r.check_name == "unique_source_combo")
            .expect("uniqueness rule");
        assert!(!combo.passed);
        assert_eq!(combo.metric_value, Some(1.0));
    }

    #[test]
    fn registry_parses_yaml_and_falls_back_to_defaults() {
        let registry: SourceRegistry = serde_yaml::from_str(
            r#"
sources:
  - source: themealdb
    labels: [Dessert]
  - source: spoonacular
    enabled: false
"#,
        )
        .expect("registry yaml");
        assert_eq!(registry.sources.len(), 2);
        assert!(registry.sources[0].enabled);
        assert_eq!(registry.sources[0].labels, vec!["Dessert"]);
        assert!(!registry.sources[1].enabled);

        let dir = tempdir().expect("tempdir");
        let defaults = SourceRegistry::load_or_default(&dir.path().join("missing.yaml"))
            .expect("defaults");
        assert_eq!(defaults.sources.len(), 2);
        assert!(defaults.sources.iter().all(|s| s.enabled));
    }

    #[test]
    fn parquet_export_writes_files_and_digest_manifest() {
        let dir = tempdir().expect("tempdir");
        let batch = vec![
            NormalizedRecipe {
                ingredients: vec![NormalizedIngredient {
                    name: "egg".to_string(),
                    display_name: "Eggs".to_string(),
                    measure: Some("2".to_string()),
                }],
                ..normalized("1", &[])
            },
            normalized("2", &[]),
        ];

        let manifest_path = export_parquet(dir.path(), &batch).expect("export");
        let manifest: ParquetManifest = serde_json::from_str(
            &std::fs::read_to_string(&manifest_path).expect("manifest text"),
        )
        .expect("manifest json");

        assert_eq!(manifest.files.len(), 2);
        for entry in &manifest.files {
            let file_path = dir.path().join(&entry.path);
            let bytes = std::fs::read(&file_path).expect("exported file");
            assert_eq!(bytes.len() as u64, entry.bytes);
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            assert_eq!(hex::encode(hasher.finalize()), entry.sha256);
        }
    }

    #[test]
    fn run_ids_are_timestamped_strings() {
        let run_id = generate_run_id();
        assert!(run_id.starts_with("etl_"));
        assert_eq!(run_id.len(), "etl_20260806_120000_000000".len());
    }
}
