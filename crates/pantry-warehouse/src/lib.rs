//! Relational warehouse for normalized recipe batches.
//!
//! Three tables (`recipes`, `ingredients`, `recipe_ingredients`) merged by
//! natural key, plus an `etl_runs` metadata table. The upsert runs in three
//! strictly ordered phases, each in its own transaction; surrogate ids are
//! resolved through in-memory maps built from the earlier phases, never
//! guessed.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use pantry_core::{NormalizedRecipe, SourceName};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "pantry-warehouse";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    /// A link referenced a recipe the recipe phase never produced. Always a
    /// bug, never a data problem.
    #[error("link phase could not resolve recipe {source_name}:{source_id}")]
    MissingRecipe {
        source_name: String,
        source_id: String,
    },
    /// A link referenced an ingredient the ingredient phase never produced.
    #[error("link phase could not resolve ingredient '{normalized_name}'")]
    MissingIngredient { normalized_name: String },
}

/// Post-load table counts, the load phase's return contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub recipes_loaded: i64,
    pub ingredients_loaded: i64,
    pub mappings_loaded: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental update to a run's metadata row. Absent fields keep whatever
/// an earlier update recorded.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub raw_file_path: Option<String>,
    pub parquet_file_path: Option<String>,
    pub records_extracted: Option<i64>,
    pub records_transformed: Option<i64>,
    pub records_loaded: Option<i64>,
    pub quality_check_passed: Option<bool>,
    pub error_message: Option<String>,
    pub extract_timestamp: Option<DateTime<Utc>>,
    pub transform_timestamp: Option<DateTime<Utc>>,
    pub load_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub run_timestamp: DateTime<Utc>,
    pub status: String,
    pub records_extracted: Option<i64>,
    pub records_transformed: Option<i64>,
    pub records_loaded: Option<i64>,
    pub quality_check_passed: Option<bool>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Warehouse {
    pool: SqlitePool,
}

impl Warehouse {
    /// Open (creating if missing) the warehouse database.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // SQLite has a single writer; one pooled connection also keeps
        // `sqlite::memory:` databases visible across queries.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recipes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_name TEXT NOT NULL,
                source_id TEXT NOT NULL,
                name TEXT,
                category TEXT,
                area TEXT,
                instructions TEXT,
                thumbnail TEXT,
                UNIQUE (source_name, source_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingredients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT,
                normalized_name TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recipe_ingredients (
                recipe_id INTEGER NOT NULL REFERENCES recipes (id) ON DELETE CASCADE,
                ingredient_id INTEGER NOT NULL REFERENCES ingredients (id) ON DELETE CASCADE,
                measure TEXT,
                PRIMARY KEY (recipe_id, ingredient_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS etl_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL UNIQUE,
                run_timestamp TEXT NOT NULL,
                extract_timestamp TEXT,
                transform_timestamp TEXT,
                load_timestamp TEXT,
                raw_file_path TEXT,
                parquet_file_path TEXT,
                records_extracted INTEGER,
                records_transformed INTEGER,
                records_loaded INTEGER,
                status TEXT NOT NULL,
                error_message TEXT,
                quality_check_passed INTEGER,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_etl_runs_timestamp ON etl_runs (run_timestamp)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_etl_runs_status ON etl_runs (status)")
            .execute(&self.pool)
            .await?;

        info!("ensured warehouse schema");
        Ok(())
    }

    /// Idempotent three-phase merge of a normalized batch.
    pub async fn upsert_batch(&self, batch: &[NormalizedRecipe]) -> Result<LoadReport, StoreError> {
        if batch.is_empty() {
            warn!("empty normalized batch; nothing to load");
            return Ok(LoadReport::default());
        }

        let recipe_ids = self.upsert_recipes(batch).await?;
        let ingredient_ids = self.upsert_ingredients(batch).await?;
        self.upsert_links(batch, &recipe_ids, &ingredient_ids)
            .await?;

        let report = LoadReport {
            recipes_loaded: self.count_rows("recipes").await?,
            ingredients_loaded: self.count_rows("ingredients").await?,
            mappings_loaded: self.count_rows("recipe_ingredients").await?,
        };
        info!(
            recipes = report.recipes_loaded,
            ingredients = report.ingredients_loaded,
            mappings = report.mappings_loaded,
            "load completed"
        );
        Ok(report)
    }

    /// Phase 1: recipe rows, keyed by `(source_name, source_id)`. Non-key
    /// columns are overwritten on conflict.
    async fn upsert_recipes(
        &self,
        batch: &[NormalizedRecipe],
    ) -> Result<HashMap<(SourceName, String), i64>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut ids = HashMap::new();

        for recipe in batch {
            let key = (recipe.source_name, recipe.source_id.clone());
            if ids.contains_key(&key) {
                continue;
            }
            let row = sqlx::query(
                r#"
                INSERT INTO recipes (source_name, source_id, name, category, area, instructions, thumbnail)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (source_name, source_id) DO UPDATE SET
                    name = excluded.name,
                    category = excluded.category,
                    area = excluded.area,
                    instructions = excluded.instructions,
                    thumbnail = excluded.thumbnail
                RETURNING id
                "#,
            )
            .bind(recipe.source_name.as_str())
            .bind(&recipe.source_id)
            .bind(&recipe.name)
            .bind(&recipe.category)
            .bind(&recipe.area)
            .bind(&recipe.instructions)
            .bind(&recipe.thumbnail)
            .fetch_one(&mut *tx)
            .await?;
            ids.insert(key, row.get::<i64, _>("id"));
        }

        tx.commit().await?;
        info!(recipes = ids.len(), "upserted recipes");
        Ok(ids)
    }

    /// Phase 2: one ingredient row per distinct normalized name. First-seen
    /// display form wins within the batch; across batches the display form is
    /// last-write-wins. Surrogate ids of existing rows never change.
    async fn upsert_ingredients(
        &self,
        batch: &[NormalizedRecipe],
    ) -> Result<HashMap<String, i64>, StoreError> {
        let mut distinct = Vec::new();
        let mut seen = HashSet::new();
        for recipe in batch {
            for ingredient in &recipe.ingredients {
                if seen.insert(ingredient.name.clone()) {
                    distinct.push(ingredient);
                }
            }
        }

        let mut tx = self.pool.begin().await?;
        let mut ids = HashMap::new();

        for ingredient in distinct {
            let row = sqlx::query(
                r#"
                INSERT INTO ingredients (name, normalized_name)
                VALUES (?, ?)
                ON CONFLICT (normalized_name) DO UPDATE SET
                    name = excluded.name
                RETURNING id
                "#,
            )
            .bind(&ingredient.display_name)
            .bind(&ingredient.name)
            .fetch_one(&mut *tx)
            .await?;
            ids.insert(ingredient.name.clone(), row.get::<i64, _>("id"));
        }

        tx.commit().await?;
        info!(ingredients = ids.len(), "upserted ingredients");
        Ok(ids)
    }

    /// Phase 3: link rows. Measures are overwritten; links for ingredients a
    /// recipe no longer lists are left in place (additive merge).
    async fn upsert_links(
        &self,
        batch: &[NormalizedRecipe],
        recipe_ids: &HashMap<(SourceName, String), i64>,
        ingredient_ids: &HashMap<String, i64>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;

        for recipe in batch {
            let recipe_id = recipe_ids
                .get(&(recipe.source_name, recipe.source_id.clone()))
                .copied()
                .ok_or_else(|| StoreError::MissingRecipe {
                    source_name: recipe.source_name.to_string(),
                    source_id: recipe.source_id.clone(),
                })?;

            for ingredient in &recipe.ingredients {
                let ingredient_id = ingredient_ids
                    .get(&ingredient.name)
                    .copied()
                    .ok_or_else(|| StoreError::MissingIngredient {
                        normalized_name: ingredient.name.clone(),
                    })?;

                sqlx::query(
                    r#"
                    INSERT INTO recipe_ingredients (recipe_id, ingredient_id, measure)
                    VALUES (?, ?, ?)
                    ON CONFLICT (recipe_id, ingredient_id) DO UPDATE SET
                        measure = excluded.measure
                    "#,
                )
                .bind(recipe_id)
                .bind(ingredient_id)
                .bind(&ingredient.measure)
                .execute(&mut *tx)
                .await?;
                written += 1;
            }
        }

        tx.commit().await?;
        info!(links = written, "upserted recipe-ingredient links");
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Insert or update a run's metadata row; absent update fields COALESCE
    /// to the previously stored values.
    pub async fn record_run(
        &self,
        run_id: &str,
        status: RunStatus,
        update: RunUpdate,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO etl_runs (
                run_id, run_timestamp, status,
                raw_file_path, parquet_file_path,
                records_extracted, records_transformed, records_loaded,
                quality_check_passed, error_message,
                extract_timestamp, transform_timestamp, load_timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (run_id) DO UPDATE SET
                status = excluded.status,
                raw_file_path = COALESCE(excluded.raw_file_path, etl_runs.raw_file_path),
                parquet_file_path = COALESCE(excluded.parquet_file_path, etl_runs.parquet_file_path),
                records_extracted = COALESCE(excluded.records_extracted, etl_runs.records_extracted),
                records_transformed = COALESCE(excluded.records_transformed, etl_runs.records_transformed),
                records_loaded = COALESCE(excluded.records_loaded, etl_runs.records_loaded),
                quality_check_passed = COALESCE(excluded.quality_check_passed, etl_runs.quality_check_passed),
                error_message = COALESCE(excluded.error_message, etl_runs.error_message),
                extract_timestamp = COALESCE(excluded.extract_timestamp, etl_runs.extract_timestamp),
                transform_timestamp = COALESCE(excluded.transform_timestamp, etl_runs.transform_timestamp),
                load_timestamp = COALESCE(excluded.load_timestamp, etl_runs.load_timestamp)
            "#,
        )
        .bind(run_id)
        .bind(Utc::now())
        .bind(status.as_str())
        .bind(&update.raw_file_path)
        .bind(&update.parquet_file_path)
        .bind(update.records_extracted)
        .bind(update.records_transformed)
        .bind(update.records_loaded)
        .bind(update.quality_check_passed)
        .bind(&update.error_message)
        .bind(update.extract_timestamp)
        .bind(update.transform_timestamp)
        .bind(update.load_timestamp)
        .execute(&self.pool)
        .await?;

        info!(run_id, status = %status, "recorded run metadata");
        Ok(())
    }

    pub async fn latest_run(&self) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT run_id, run_timestamp, status,
                   records_extracted, records_transformed, records_loaded,
                   quality_check_passed, error_message
            FROM etl_runs
            ORDER BY run_timestamp DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| RunRecord {
            run_id: row.get("run_id"),
            run_timestamp: row.get("run_timestamp"),
            status: row.get("status"),
            records_extracted: row.get("records_extracted"),
            records_transformed: row.get("records_transformed"),
            records_loaded: row.get("records_loaded"),
            quality_check_passed: row.get("quality_check_passed"),
            error_message: row.get("error_message"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_core::NormalizedIngredient;

    async fn test_warehouse() -> Warehouse {
        let warehouse = Warehouse::connect("sqlite::memory:")
            .await
            .expect("in-memory warehouse");
        warehouse.init_schema().await.expect("schema");
        warehouse
    }

    fn mk_recipe(
        source_id: &str,
        name: &str,
        ingredients: &[(&str, &str, Option<&str>)],
    ) -> NormalizedRecipe {
        NormalizedRecipe {
            source_name: SourceName::Themealdb,
            source_id: source_id.to_string(),
            name: Some(name.to_string()),
            category: Some("Dessert".to_string()),
            area: None,
            instructions: None,
            thumbnail: None,
            ingredients: ingredients
                .iter()
                .map(|(canonical, display, measure)| NormalizedIngredient {
                    name: canonical.to_string(),
                    display_name: display.to_string(),
                    measure: measure.map(str::to_string),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn upsert_produces_one_row_per_entity() {
        let warehouse = test_warehouse().await;
        let batch = vec![mk_recipe("1", "Cake", &[("egg", "Eggs", Some("2"))])];

        let report = warehouse.upsert_batch(&batch).await.expect("upsert");
        assert_eq!(report.recipes_loaded, 1);
        assert_eq!(report.ingredients_loaded, 1);
        assert_eq!(report.mappings_loaded, 1);

        let normalized: String =
            sqlx::query_scalar("SELECT normalized_name FROM ingredients")
                .fetch_one(warehouse.pool())
                .await
                .expect("ingredient row");
        assert_eq!(normalized, "egg");
    }

    #[tokio::test]
    async fn reupserting_the_same_batch_is_idempotent() {
        let warehouse = test_warehouse().await;
        let batch = vec![
            mk_recipe(
                "1",
                "Cake",
                &[("egg", "Eggs", Some("2")), ("flour", "Flour", Some("200g"))],
            ),
            mk_recipe("2", "Omelette", &[("egg", "Eggs", Some("3"))]),
        ];

        let first = warehouse.upsert_batch(&batch).await.expect("first upsert");
        let second = warehouse.upsert_batch(&batch).await.expect("second upsert");
        assert_eq!(first, second);
        assert_eq!(second.recipes_loaded, 2);
        assert_eq!(second.ingredients_loaded, 2);
        assert_eq!(second.mappings_loaded, 3);

        let cake_name: String = sqlx::query_scalar(
            "SELECT name FROM recipes WHERE source_name = 'themealdb' AND source_id = '1'",
        )
        .fetch_one(warehouse.pool())
        .await
        .expect("cake row");
        assert_eq!(cake_name, "Cake");
    }

    #[tokio::test]
    async fn recipe_columns_are_overwritten_on_conflict() {
        let warehouse = test_warehouse().await;
        warehouse
            .upsert_batch(&[mk_recipe("1", "Cake", &[])])
            .await
            .expect("first upsert");
        warehouse
            .upsert_batch(&[mk_recipe("1", "Chocolate Cake", &[])])
            .await
            .expect("second upsert");

        let (count, name): (i64, String) = sqlx::query_as(
            "SELECT COUNT(*), MAX(name) FROM recipes WHERE source_id = '1'",
        )
        .fetch_one(warehouse.pool())
        .await
        .expect("recipe row");
        assert_eq!(count, 1);
        assert_eq!(name, "Chocolate Cake");
    }

    #[tokio::test]
    async fn ingredient_display_name_is_last_write_wins_with_stable_id() {
        let warehouse = test_warehouse().await;
        warehouse
            .upsert_batch(&[mk_recipe("1", "Cake", &[("egg", "Eggs", Some("2"))])])
            .await
            .expect("first upsert");
        let first_id: i64 =
            sqlx::query_scalar("SELECT id FROM ingredients WHERE normalized_name = 'egg'")
                .fetch_one(warehouse.pool())
                .await
                .expect("first id");

        warehouse
            .upsert_batch(&[mk_recipe("1", "Cake", &[("egg", "EGGS", Some("3"))])])
            .await
            .expect("second upsert");

        let (second_id, display): (i64, String) =
            sqlx::query_as("SELECT id, name FROM ingredients WHERE normalized_name = 'egg'")
                .fetch_one(warehouse.pool())
                .await
                .expect("second row");
        assert_eq!(first_id, second_id);
        assert_eq!(display, "EGGS");

        let measure: String = sqlx::query_scalar("SELECT measure FROM recipe_ingredients")
            .fetch_one(warehouse.pool())
            .await
            .expect("link measure");
        assert_eq!(measure, "3");
    }

    #[tokio::test]
    async fn links_are_an_additive_merge() {
        let warehouse = test_warehouse().await;
        warehouse
            .upsert_batch(&[mk_recipe(
                "1",
                "Cake",
                &[("egg", "Eggs", Some("2")), ("flour", "Flour", Some("200g"))],
            )])
            .await
            .expect("first upsert");

        // Re-fetch dropped flour from the recipe; the stale link stays.
        let report = warehouse
            .upsert_batch(&[mk_recipe("1", "Cake", &[("egg", "Eggs", Some("2"))])])
            .await
            .expect("second upsert");
        assert_eq!(report.mappings_loaded, 2);
    }

    #[tokio::test]
    async fn run_metadata_updates_coalesce_over_earlier_values() {
        let warehouse = test_warehouse().await;
        warehouse
            .record_run(
                "etl_20260806_000000_000001",
                RunStatus::Running,
                RunUpdate {
                    records_extracted: Some(12),
                    raw_file_path: Some("data/raw/recipes_initial_x.json".to_string()),
                    ..RunUpdate::default()
                },
            )
            .await
            .expect("first update");
        warehouse
            .record_run(
                "etl_20260806_000000_000001",
                RunStatus::Completed,
                RunUpdate {
                    records_loaded: Some(11),
                    quality_check_passed: Some(true),
                    ..RunUpdate::default()
                },
            )
            .await
            .expect("second update");

        let latest = warehouse
            .latest_run()
            .await
            .expect("latest run")
            .expect("run recorded");
        assert_eq!(latest.run_id, "etl_20260806_000000_000001");
        assert_eq!(latest.status, "completed");
        assert_eq!(latest.records_extracted, Some(12));
        assert_eq!(latest.records_loaded, Some(11));
        assert_eq!(latest.quality_check_passed, Some(true));

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM etl_runs")
            .fetch_one(warehouse.pool())
            .await
            .expect("run count");
        assert_eq!(rows, 1);
    }
}
