//! Versioned entity definitions and forward-only migrations.
//!
//! Entity shapes are plain data: each field records the schema version that
//! introduced it. A migration step creates missing tables, adds the fields
//! introduced at its version and then runs any step-specific SQL (extra
//! tables, indexes). Every step is additive and safe to re-run.

use rusqlite::{Connection, Transaction, params};
use tracing::{debug, info};

use crate::error::MigrationError;
use crate::models::EntityKind;

pub const CURRENT_VERSION: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    /// Column type and constraints. Fields added after v1 must carry a
    /// default if they are `NOT NULL`.
    pub sql: &'static str,
    pub since: u32,
}

const fn field(name: &'static str, sql: &'static str, since: u32) -> FieldDef {
    FieldDef { name, sql, since }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDef {
    pub kind: EntityKind,
    pub table: &'static str,
    pub fields: &'static [FieldDef],
}

impl EntityDef {
    /// Fields present in a store at `version`.
    pub fn fields_at(&self, version: u32) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(move |f| f.since <= version)
    }
}

pub const RECIPE: EntityDef = EntityDef {
    kind: EntityKind::Recipe,
    table: "recipes",
    fields: &[
        field("id", "TEXT PRIMARY KEY NOT NULL", 1),
        field("title", "TEXT NOT NULL", 1),
        field("description", "TEXT", 1),
        field("ingredients", "TEXT NOT NULL DEFAULT '[]'", 1),
        field("instructions", "TEXT NOT NULL DEFAULT '[]'", 1),
        field("prep_time_min", "INTEGER", 1),
        field("cook_time_min", "INTEGER", 1),
        field("servings", "INTEGER", 1),
        field("difficulty", "TEXT", 1),
        field("tags", "TEXT NOT NULL DEFAULT '[]'", 1),
        field("is_favorite", "INTEGER NOT NULL DEFAULT 0", 1),
        field("created_at", "TEXT NOT NULL", 1),
        field("updated_at", "TEXT NOT NULL", 1),
        field("is_adapted", "INTEGER NOT NULL DEFAULT 0", 2),
        field("original_recipe_id", "TEXT", 2),
        field("adapted_at", "TEXT", 2),
        field("origin", "TEXT NOT NULL DEFAULT 'local'", 3),
        field("dirty", "INTEGER NOT NULL DEFAULT 1", 3),
        field("remote_id", "TEXT", 3),
        field("synced_at", "TEXT", 3),
        field("cuisine", "TEXT", 4),
        field("image_url", "TEXT", 4),
        field("source", "TEXT", 4),
        field("tips", "TEXT NOT NULL DEFAULT '[]'", 4),
        field("warnings", "TEXT NOT NULL DEFAULT '[]'", 4),
    ],
};

pub const USER_PREFERENCES: EntityDef = EntityDef {
    kind: EntityKind::UserPreferences,
    table: "user_preferences",
    fields: &[
        field("user_id", "TEXT PRIMARY KEY NOT NULL", 1),
        field("dietary_restrictions", "TEXT NOT NULL DEFAULT '[]'", 1),
        field("allergies", "TEXT NOT NULL DEFAULT '[]'", 1),
        field("intolerances", "TEXT NOT NULL DEFAULT '[]'", 1),
        field("cooking_time", "TEXT", 1),
        field("onboarding_complete", "INTEGER NOT NULL DEFAULT 0", 1),
        field("notifications_enabled", "INTEGER NOT NULL DEFAULT 1", 1),
        field("created_at", "TEXT NOT NULL", 1),
        field("updated_at", "TEXT NOT NULL", 1),
        field("diet_type", "TEXT", 2),
        field("medical_conditions", "TEXT NOT NULL DEFAULT '[]'", 2),
        field("origin", "TEXT NOT NULL DEFAULT 'local'", 3),
        field("dirty", "INTEGER NOT NULL DEFAULT 1", 3),
        field("synced_at", "TEXT", 3),
        field("difficulty_level", "TEXT", 4),
        field("serving_size", "INTEGER", 4),
        field("measurement_unit", "TEXT", 4),
        field("language", "TEXT", 4),
        field("theme", "TEXT", 5),
    ],
};

pub const ENTITIES: &[EntityDef] = &[RECIPE, USER_PREFERENCES];

pub type StepFn = fn(&Connection) -> rusqlite::Result<()>;

#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    pub version: u32,
    pub description: &'static str,
    /// Runs after the entity fields for `version` exist.
    pub apply: StepFn,
}

impl MigrationStep {
    pub const fn new(version: u32, description: &'static str, apply: StepFn) -> Self {
        Self {
            version,
            description,
            apply,
        }
    }
}

fn no_extra(_conn: &Connection) -> rusqlite::Result<()> {
    Ok(())
}

fn create_lineage(conn: &Connection) -> rusqlite::Result<()> {
    // Every recipe id ever created. Deletes never touch this table.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS recipe_lineage (
            id TEXT PRIMARY KEY NOT NULL,
            created_at TEXT NOT NULL
        );",
    )
}

fn create_indexes(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_recipes_created_at ON recipes(created_at);
         CREATE INDEX IF NOT EXISTS idx_recipes_original ON recipes(original_recipe_id);
         CREATE INDEX IF NOT EXISTS idx_recipes_dirty ON recipes(dirty);
         CREATE INDEX IF NOT EXISTS idx_recipes_remote_id ON recipes(remote_id);",
    )
}

fn create_tombstones(conn: &Connection) -> rusqlite::Result<()> {
    // One row per user-deleted recipe. `pushed` flips once the remote delete lands.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS recipe_tombstones (
            id TEXT PRIMARY KEY NOT NULL,
            remote_id TEXT,
            deleted_at TEXT NOT NULL,
            pushed INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_tombstones_remote_id ON recipe_tombstones(remote_id);",
    )
}

const STEPS: &[MigrationStep] = &[
    MigrationStep::new(1, "base tables and recipe lineage", create_lineage),
    MigrationStep::new(2, "adaptation and medical fields", no_extra),
    MigrationStep::new(3, "sync bookkeeping", no_extra),
    MigrationStep::new(4, "recipe extras, preference extras, indexes", create_indexes),
    MigrationStep::new(5, "theme preference and recipe tombstones", create_tombstones),
];

/// The declared schema: entity definitions plus the ordered migration steps
/// that produce them.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    steps: Vec<MigrationStep>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::current()
    }
}

impl SchemaRegistry {
    #[must_use]
    pub fn current() -> Self {
        Self {
            steps: STEPS.to_vec(),
        }
    }

    /// Registry truncated to `version`, or `None` if no such version exists.
    #[must_use]
    pub fn at_version(version: u32) -> Option<Self> {
        if version == 0 || version > CURRENT_VERSION {
            return None;
        }
        Some(Self {
            steps: STEPS
                .iter()
                .copied()
                .filter(|s| s.version <= version)
                .collect(),
        })
    }

    /// Append a step after the last known version.
    #[must_use]
    pub fn with_step(mut self, description: &'static str, apply: StepFn) -> Self {
        let version = self.version() + 1;
        self.steps.push(MigrationStep::new(version, description, apply));
        self
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.steps.last().map_or(0, |s| s.version)
    }

    #[must_use]
    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// Entity definitions, each listing only the fields present at this
    /// registry's version.
    pub fn entities(&self) -> impl Iterator<Item = (&'static EntityDef, Vec<&'static FieldDef>)> {
        let version = self.version();
        ENTITIES
            .iter()
            .map(move |e| (e, e.fields_at(version).collect()))
    }

    /// Apply every step newer than `old_version`, then record the new version
    /// inside the same transaction. The caller commits or rolls back.
    pub fn migrate(&self, old_version: u32, tx: &Transaction<'_>) -> Result<u32, MigrationError> {
        for step in self.steps.iter().filter(|s| s.version > old_version) {
            debug!(version = step.version, description = step.description, "applying migration step");
            apply_step(tx, step).map_err(|source| MigrationError {
                version: step.version,
                description: step.description,
                source,
            })?;
        }
        let target = self.version().max(old_version);
        tx.pragma_update(None, "user_version", target)
            .map_err(|source| MigrationError {
                version: target,
                description: "record schema version",
                source,
            })?;
        if target > old_version {
            info!(from = old_version, to = target, "schema migrated");
        }
        Ok(target)
    }
}

fn apply_step(conn: &Connection, step: &MigrationStep) -> rusqlite::Result<()> {
    for entity in ENTITIES {
        create_table(conn, entity)?;
        for f in entity.fields.iter().filter(|f| f.since == step.version) {
            ensure_column(conn, entity.table, f)?;
        }
    }
    (step.apply)(conn)
}

fn create_table(conn: &Connection, entity: &EntityDef) -> rusqlite::Result<()> {
    let columns = entity
        .fields_at(1)
        .map(|f| format!("{} {}", f.name, f.sql))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} ({columns});",
        entity.table
    ))
}

pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Add `field` to `table` unless it is already there.
pub fn ensure_column(conn: &Connection, table: &str, field: &FieldDef) -> rusqlite::Result<()> {
    if column_exists(conn, table, field.name)? {
        return Ok(());
    }
    conn.execute_batch(&format!(
        "ALTER TABLE {table} ADD COLUMN {} {};",
        field.name, field.sql
    ))
}

pub(crate) fn read_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}
