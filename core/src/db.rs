use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, params, params_from_iter};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{MigrationError, OpenError, StoreError};
use crate::models::{
    Difficulty, EntityKind, NewPreferences, NewRecipe, PreferencesUpdate, Recipe, RecipeFilter,
    RecipeTombstone, RecipeUpdate, RecordOrigin, SyncMeta, UserPreferences, validate_new_recipe,
    validate_preferences, validate_recipe, validate_user_id,
};
use crate::paths::lock_path;
use crate::schema::{self, SchemaRegistry};

const RECIPE_COLUMNS: &str = "id, title, description, ingredients, instructions, \
     prep_time_min, cook_time_min, servings, difficulty, tags, cuisine, image_url, source, \
     tips, warnings, is_favorite, is_adapted, original_recipe_id, adapted_at, created_at, \
     updated_at, origin, dirty, remote_id, synced_at";

const PREFERENCE_COLUMNS: &str = "user_id, dietary_restrictions, allergies, intolerances, \
     medical_conditions, diet_type, cooking_time, difficulty_level, serving_size, \
     measurement_unit, language, onboarding_complete, notifications_enabled, created_at, \
     updated_at, origin, dirty, synced_at, theme";

/// RFC 3339 UTC timestamp used for every stored time.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Exclusive advisory lock on `<store>.lock`, held for the life of a handle.
/// Dropping it releases the lock and removes the file.
struct StoreLock {
    _file: File,
    path: PathBuf,
}

impl StoreLock {
    fn acquire(store: &Path) -> Result<Self, OpenError> {
        let path = lock_path(store);
        let existed = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| {
                OpenError::PathUnavailable(format!(
                    "cannot create lock file {}: {e}",
                    path.display()
                ))
            })?;
        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(OpenError::Locked(store.to_path_buf()));
            }
            Err(e) => {
                return Err(OpenError::PathUnavailable(format!(
                    "cannot lock {}: {e}",
                    path.display()
                )));
            }
        }
        if existed {
            warn!(path = %path.display(), "reclaimed stale lock file from an unclean shutdown");
        }
        Ok(Self { _file: file, path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "could not remove lock file");
            }
        }
    }
}

pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
    registry: SchemaRegistry,
    lock: Option<StoreLock>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("locked", &self.lock.is_some())
            .finish_non_exhaustive()
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, OpenError> {
        Self::open_with(path, &SchemaRegistry::current())
    }

    /// Open (creating if needed) the store at `path`: take the lock, compare
    /// and migrate the schema, then run the integrity probe.
    pub fn open_with(path: &Path, registry: &SchemaRegistry) -> Result<Self, OpenError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.is_dir() {
                return Err(OpenError::PathUnavailable(format!(
                    "directory {} does not exist",
                    dir.display()
                )));
            }
        }

        let lock = StoreLock::acquire(path)?;
        let corrupt = |e: rusqlite::Error| OpenError::CorruptFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        let mut conn = Connection::open(path).map_err(corrupt)?;
        let on_disk = schema::read_version(&conn).map_err(corrupt)?;
        let supported = registry.version();

        if on_disk > supported {
            return Err(OpenError::IncompatibleVersion {
                path: path.to_path_buf(),
                on_disk,
                supported,
            });
        }

        if on_disk < supported {
            let tx = conn.transaction().map_err(corrupt)?;
            registry
                .migrate(on_disk, &tx)
                .map_err(|source| OpenError::MigrationFailed {
                    from: on_disk,
                    to: supported,
                    source,
                })?;
            tx.commit().map_err(|source| OpenError::MigrationFailed {
                from: on_disk,
                to: supported,
                source: MigrationError {
                    version: supported,
                    description: "commit",
                    source,
                },
            })?;
        }

        integrity_probe(&conn).map_err(|reason| OpenError::CorruptFile {
            path: path.to_path_buf(),
            reason,
        })?;

        info!(path = %path.display(), version = supported, "store opened");
        Ok(Database {
            conn,
            path: Some(path.to_path_buf()),
            registry: registry.clone(),
            lock: Some(lock),
        })
    }

    pub fn open_in_memory() -> Result<Self, OpenError> {
        let registry = SchemaRegistry::current();
        let corrupt = |e: rusqlite::Error| OpenError::CorruptFile {
            path: PathBuf::from(":memory:"),
            reason: e.to_string(),
        };
        let mut conn = Connection::open_in_memory().map_err(corrupt)?;
        let tx = conn.transaction().map_err(corrupt)?;
        registry
            .migrate(0, &tx)
            .map_err(|source| OpenError::MigrationFailed {
                from: 0,
                to: registry.version(),
                source,
            })?;
        tx.commit().map_err(corrupt)?;
        Ok(Database {
            conn,
            path: None,
            registry,
            lock: None,
        })
    }

    /// Store file path; `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        Ok(schema::read_version(&self.conn)?)
    }

    /// Open a fresh handle on the same path and swap it in, closing the old
    /// connection. On failure the original connection stays in place and the
    /// lock is taken back when the file is still reachable.
    pub fn reopen(&mut self) -> Result<(), OpenError> {
        let Some(path) = self.path.clone() else {
            return Err(OpenError::PathUnavailable(
                "an in-memory store cannot be reopened".to_string(),
            ));
        };
        // flock is per descriptor, so the fresh handle needs the lock released first.
        self.lock = None;

        match Self::open_with(&path, &self.registry) {
            Ok(fresh) => {
                let old = std::mem::replace(self, fresh);
                let Database { conn, .. } = old;
                if let Err((_, e)) = conn.close() {
                    warn!(error = %e, "previous connection did not close cleanly");
                }
                debug!(path = %path.display(), "store reopened");
                Ok(())
            }
            Err(e) => {
                match StoreLock::acquire(&path) {
                    Ok(lock) => self.lock = Some(lock),
                    Err(relock) => {
                        warn!(error = %relock, "could not retake store lock after failed reopen");
                    }
                }
                warn!(
                    path = %path.display(),
                    error = %e,
                    "reopen failed, keeping existing connection"
                );
                Err(e)
            }
        }
    }

    pub fn close(self) -> Result<(), StoreError> {
        let Database {
            conn, path, lock, ..
        } = self;
        let result = conn.close().map_err(|(_, e)| StoreError::Sqlite(e));
        drop(lock);
        if let Some(path) = path {
            info!(path = %path.display(), "store closed");
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Row mapping helpers ---

    fn recipe_from_row(row: &Row) -> rusqlite::Result<Recipe> {
        Ok(Recipe {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            ingredients: json_column(row, 3)?,
            instructions: json_column(row, 4)?,
            prep_time_min: row.get(5)?,
            cook_time_min: row.get(6)?,
            servings: row.get(7)?,
            difficulty: parsed_column::<Difficulty>(row, 8)?,
            tags: json_column(row, 9)?,
            cuisine: row.get(10)?,
            image_url: row.get(11)?,
            source: row.get(12)?,
            tips: json_column(row, 13)?,
            warnings: json_column(row, 14)?,
            is_favorite: row.get(15)?,
            is_adapted: row.get(16)?,
            original_recipe_id: row.get(17)?,
            adapted_at: row.get(18)?,
            created_at: row.get(19)?,
            updated_at: row.get(20)?,
            sync: SyncMeta {
                origin: parsed_column::<RecordOrigin>(row, 21)?.unwrap_or_default(),
                dirty: row.get(22)?,
                remote_id: row.get(23)?,
                synced_at: row.get(24)?,
            },
        })
    }

    fn preferences_from_row(row: &Row) -> rusqlite::Result<UserPreferences> {
        Ok(UserPreferences {
            user_id: row.get(0)?,
            dietary_restrictions: json_column(row, 1)?,
            allergies: json_column(row, 2)?,
            intolerances: json_column(row, 3)?,
            medical_conditions: json_column(row, 4)?,
            diet_type: row.get(5)?,
            cooking_time: row.get(6)?,
            difficulty_level: parsed_column::<Difficulty>(row, 7)?,
            serving_size: row.get(8)?,
            measurement_unit: row.get(9)?,
            language: row.get(10)?,
            onboarding_complete: row.get(11)?,
            notifications_enabled: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
            sync: SyncMeta {
                origin: parsed_column::<RecordOrigin>(row, 15)?.unwrap_or_default(),
                dirty: row.get(16)?,
                remote_id: None,
                synced_at: row.get(17)?,
            },
            theme: row.get(18)?,
        })
    }

    fn save_recipe(conn: &Connection, r: &Recipe) -> Result<(), StoreError> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO recipes ({RECIPE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)"
            ),
            params![
                r.id,
                r.title,
                r.description,
                serde_json::to_string(&r.ingredients)?,
                serde_json::to_string(&r.instructions)?,
                r.prep_time_min,
                r.cook_time_min,
                r.servings,
                r.difficulty.map(Difficulty::as_str),
                serde_json::to_string(&r.tags)?,
                r.cuisine,
                r.image_url,
                r.source,
                serde_json::to_string(&r.tips)?,
                serde_json::to_string(&r.warnings)?,
                r.is_favorite,
                r.is_adapted,
                r.original_recipe_id,
                r.adapted_at,
                r.created_at,
                r.updated_at,
                r.sync.origin.as_str(),
                r.sync.dirty,
                r.sync.remote_id,
                r.sync.synced_at,
            ],
        )?;
        Ok(())
    }

    fn save_preferences(conn: &Connection, p: &UserPreferences) -> Result<(), StoreError> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO user_preferences ({PREFERENCE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19)"
            ),
            params![
                p.user_id,
                serde_json::to_string(&p.dietary_restrictions)?,
                serde_json::to_string(&p.allergies)?,
                serde_json::to_string(&p.intolerances)?,
                serde_json::to_string(&p.medical_conditions)?,
                p.diet_type,
                p.cooking_time,
                p.difficulty_level.map(Difficulty::as_str),
                p.serving_size,
                p.measurement_unit,
                p.language,
                p.onboarding_complete,
                p.notifications_enabled,
                p.created_at,
                p.updated_at,
                p.sync.origin.as_str(),
                p.sync.dirty,
                p.sync.synced_at,
                p.theme,
            ],
        )?;
        Ok(())
    }

    fn fetch_recipe(conn: &Connection, id: &str) -> Result<Option<Recipe>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECIPE_COLUMNS} FROM recipes WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::recipe_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    fn fetch_preferences(
        conn: &Connection,
        user_id: &str,
    ) -> Result<Option<UserPreferences>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {PREFERENCE_COLUMNS} FROM user_preferences WHERE user_id = ?1"
        ))?;
        let mut rows = stmt.query(params![user_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::preferences_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    fn record_lineage(conn: &Connection, id: &str, at: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO recipe_lineage (id, created_at) VALUES (?1, ?2)",
            params![id, at],
        )?;
        Ok(())
    }

    fn lineage_contains(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM recipe_lineage WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )
    }

    // --- Recipes ---

    pub fn create_recipe(&self, new: &NewRecipe) -> Result<Recipe, StoreError> {
        validate_new_recipe(new)?;
        let tx = self.conn.unchecked_transaction()?;

        if let Some(original) = &new.original_recipe_id {
            if !Self::lineage_contains(&tx, original)? {
                return Err(StoreError::validation(
                    "original_recipe_id",
                    format!("no recipe '{original}' has ever existed in this store"),
                ));
            }
        }

        let now = timestamp();
        let recipe = Recipe {
            id: Uuid::new_v4().to_string(),
            title: new.title.clone(),
            description: new.description.clone(),
            ingredients: new.ingredients.clone(),
            instructions: new.instructions.clone(),
            prep_time_min: new.prep_time_min,
            cook_time_min: new.cook_time_min,
            servings: new.servings,
            difficulty: new.difficulty,
            tags: new.tags.clone(),
            cuisine: new.cuisine.clone(),
            image_url: new.image_url.clone(),
            source: new.source.clone(),
            tips: new.tips.clone(),
            warnings: new.warnings.clone(),
            is_favorite: new.is_favorite,
            is_adapted: new.is_adapted,
            original_recipe_id: new.original_recipe_id.clone(),
            adapted_at: new.is_adapted.then(|| now.clone()),
            created_at: now.clone(),
            updated_at: now.clone(),
            sync: SyncMeta {
                origin: RecordOrigin::Local,
                dirty: true,
                remote_id: None,
                synced_at: None,
            },
        };
        Self::save_recipe(&tx, &recipe)?;
        Self::record_lineage(&tx, &recipe.id, &now)?;
        tx.commit()?;
        debug!(id = %recipe.id, title = %recipe.title, "recipe created");
        Ok(recipe)
    }

    pub fn get_recipe(&self, id: &str) -> Result<Option<Recipe>, StoreError> {
        Self::fetch_recipe(&self.conn, id)
    }

    /// Apply a partial update. Returns `false` if no such recipe exists.
    pub fn update_recipe(&self, id: &str, update: &RecipeUpdate) -> Result<bool, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let Some(mut recipe) = Self::fetch_recipe(&tx, id)? else {
            return Ok(false);
        };
        update.apply_to(&mut recipe);
        validate_recipe(&recipe)?;
        recipe.updated_at = timestamp();
        recipe.sync.origin = RecordOrigin::Local;
        recipe.sync.dirty = true;
        Self::save_recipe(&tx, &recipe)?;
        tx.commit()?;
        debug!(id, "recipe updated");
        Ok(true)
    }

    /// Delete at the user's request. The tombstone keeps later pulls from
    /// bringing the recipe back and queues the remote delete.
    pub fn delete_recipe(&self, id: &str) -> Result<bool, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let remote_id: Option<String> = {
            let mut stmt = tx.prepare("SELECT remote_id FROM recipes WHERE id = ?1")?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => row.get(0)?,
                None => return Ok(false),
            }
        };
        tx.execute("DELETE FROM recipes WHERE id = ?1", params![id])?;
        tx.execute(
            "INSERT OR REPLACE INTO recipe_tombstones (id, remote_id, deleted_at, pushed)
             VALUES (?1, ?2, ?3, 0)",
            params![id, remote_id, timestamp()],
        )?;
        tx.commit()?;
        debug!(id, "recipe deleted");
        Ok(true)
    }

    /// Recipes matching `filter`, newest first.
    pub fn list_recipes(&self, filter: &RecipeFilter) -> Result<Vec<Recipe>, StoreError> {
        let mut sql = format!("SELECT {RECIPE_COLUMNS} FROM recipes WHERE 1 = 1");
        let mut args: Vec<&str> = Vec::new();
        if filter.favorites_only {
            sql.push_str(" AND is_favorite = 1");
        }
        if filter.adapted_only {
            sql.push_str(" AND is_adapted = 1");
        }
        if let Some(original) = filter.original_recipe_id.as_deref() {
            args.push(original);
            sql.push_str(" AND original_recipe_id = ?1");
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let recipes = stmt
            .query_map(params_from_iter(args), Self::recipe_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        // Tag and title matching need the decoded record.
        Ok(recipes.into_iter().filter(|r| filter.matches(r)).collect())
    }

    // --- User preferences ---

    /// Insert or wholesale-replace the single preferences record for
    /// `user_id`. `created_at` survives replacement.
    pub fn upsert_preferences(
        &self,
        user_id: &str,
        prefs: &NewPreferences,
    ) -> Result<UserPreferences, StoreError> {
        validate_user_id(user_id)?;
        validate_preferences(prefs)?;
        let tx = self.conn.unchecked_transaction()?;
        let existing = Self::fetch_preferences(&tx, user_id)?;

        let now = timestamp();
        let created_at = existing
            .as_ref()
            .map_or_else(|| now.clone(), |e| e.created_at.clone());
        let mut record = UserPreferences::from_payload(user_id, prefs, created_at, now);
        record.sync = SyncMeta {
            origin: RecordOrigin::Local,
            dirty: true,
            remote_id: None,
            synced_at: existing.and_then(|e| e.sync.synced_at),
        };
        Self::save_preferences(&tx, &record)?;
        tx.commit()?;
        debug!(user_id, "preferences saved");
        Ok(record)
    }

    /// Merge `update` into the stored record field by field. Fields the
    /// update leaves out keep their stored values.
    pub fn update_preferences(
        &self,
        user_id: &str,
        update: &PreferencesUpdate,
    ) -> Result<UserPreferences, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let Some(existing) = Self::fetch_preferences(&tx, user_id)? else {
            return Err(StoreError::NotFound {
                kind: EntityKind::UserPreferences,
                id: user_id.to_string(),
            });
        };
        if update.is_empty() {
            return Ok(existing);
        }

        let payload = update.applied_to(existing.to_new());
        validate_preferences(&payload)?;
        let mut record =
            UserPreferences::from_payload(user_id, &payload, existing.created_at, timestamp());
        record.sync = SyncMeta {
            origin: RecordOrigin::Local,
            dirty: true,
            remote_id: None,
            synced_at: existing.sync.synced_at,
        };
        Self::save_preferences(&tx, &record)?;
        tx.commit()?;
        debug!(user_id, "preferences updated");
        Ok(record)
    }

    pub fn get_preferences(&self, user_id: &str) -> Result<Option<UserPreferences>, StoreError> {
        Self::fetch_preferences(&self.conn, user_id)
    }

    pub fn list_preferences(&self) -> Result<Vec<UserPreferences>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PREFERENCE_COLUMNS} FROM user_preferences ORDER BY user_id"
        ))?;
        let prefs = stmt
            .query_map([], Self::preferences_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(prefs)
    }

    pub fn delete_preferences(&self, user_id: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "DELETE FROM user_preferences WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(changed > 0)
    }

    // --- Generic ---

    pub fn count(&self, kind: EntityKind) -> Result<i64, StoreError> {
        let n = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", kind.table()),
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn delete(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
        match kind {
            EntityKind::Recipe => self.delete_recipe(id),
            EntityKind::UserPreferences => self.delete_preferences(id),
        }
    }

    // --- Sync bookkeeping ---

    /// Store a recipe pulled from the remote. It is marked remote-sourced and
    /// clean so it is never pushed back.
    pub fn apply_remote_recipe(&self, recipe: &Recipe) -> Result<(), StoreError> {
        validate_recipe(recipe)?;
        let tx = self.conn.unchecked_transaction()?;
        let now = timestamp();
        let mut record = recipe.clone();
        record.sync = SyncMeta {
            origin: RecordOrigin::Remote,
            dirty: false,
            remote_id: recipe.sync.remote_id.clone(),
            synced_at: Some(now.clone()),
        };
        Self::save_recipe(&tx, &record)?;
        Self::record_lineage(&tx, &record.id, &record.created_at)?;
        if let Some(original) = &record.original_recipe_id {
            // The original existed somewhere even if it never reached this device.
            Self::record_lineage(&tx, original, &now)?;
        }
        tx.commit()?;
        debug!(id = %record.id, "remote recipe applied");
        Ok(())
    }

    pub fn apply_remote_preferences(&self, prefs: &UserPreferences) -> Result<(), StoreError> {
        validate_user_id(&prefs.user_id)?;
        validate_preferences(&prefs.to_new())?;
        let mut record = prefs.clone();
        record.sync = SyncMeta {
            origin: RecordOrigin::Remote,
            dirty: false,
            remote_id: None,
            synced_at: Some(timestamp()),
        };
        let tx = self.conn.unchecked_transaction()?;
        Self::save_preferences(&tx, &record)?;
        tx.commit()?;
        debug!(user_id = %record.user_id, "remote preferences applied");
        Ok(())
    }

    /// Record a successful push. The dirty flag clears only if the record is
    /// still the version that was pushed.
    pub fn mark_recipe_synced(
        &self,
        id: &str,
        remote_id: &str,
        pushed_updated_at: &str,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE recipes SET remote_id = ?2, synced_at = ?3,
                 dirty = CASE WHEN updated_at = ?4 THEN 0 ELSE dirty END
             WHERE id = ?1",
            params![id, remote_id, timestamp(), pushed_updated_at],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_preferences_synced(
        &self,
        user_id: &str,
        pushed_updated_at: &str,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE user_preferences SET synced_at = ?2,
                 dirty = CASE WHEN updated_at = ?3 THEN 0 ELSE dirty END
             WHERE user_id = ?1",
            params![user_id, timestamp(), pushed_updated_at],
        )?;
        Ok(changed > 0)
    }

    /// Recipes with local changes not yet pushed, oldest first so originals
    /// precede their adaptations.
    pub fn dirty_recipes(&self) -> Result<Vec<Recipe>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECIPE_COLUMNS} FROM recipes WHERE dirty = 1 ORDER BY created_at, rowid"
        ))?;
        let recipes = stmt
            .query_map([], Self::recipe_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(recipes)
    }

    /// Whether a user delete covers the remote row with this client id or
    /// remote id.
    pub fn is_tombstoned(
        &self,
        client_id: &str,
        remote_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let found = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM recipe_tombstones
                 WHERE id = ?1 OR (?2 IS NOT NULL AND remote_id = ?2))",
            params![client_id, remote_id],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    /// Deletes not yet confirmed by the remote, oldest first.
    pub fn pending_recipe_deletes(&self) -> Result<Vec<RecipeTombstone>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, remote_id, deleted_at FROM recipe_tombstones
             WHERE pushed = 0 ORDER BY deleted_at, rowid",
        )?;
        let tombstones = stmt
            .query_map([], |row| {
                Ok(RecipeTombstone {
                    id: row.get(0)?,
                    remote_id: row.get(1)?,
                    deleted_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tombstones)
    }

    /// The tombstone itself stays so stale remote reads still skip the row.
    pub fn mark_delete_pushed(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE recipe_tombstones SET pushed = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(changed > 0)
    }

    pub fn find_recipe_by_remote_id(&self, remote_id: &str) -> Result<Option<Recipe>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECIPE_COLUMNS} FROM recipes WHERE remote_id = ?1"
        ))?;
        let mut rows = stmt.query(params![remote_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::recipe_from_row(row)?))
        } else {
            Ok(None)
        }
    }

    // --- Diagnostic probes ---

    /// Write a bare throwaway record of `kind` keyed by `id`. It is not
    /// tracked in recipe lineage.
    pub(crate) fn insert_probe(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        let now = timestamp();
        let sql = match kind {
            EntityKind::Recipe => {
                "INSERT INTO recipes (id, title, created_at, updated_at)
                 VALUES (?1, 'diagnostic probe', ?2, ?2)"
            }
            EntityKind::UserPreferences => {
                "INSERT INTO user_preferences (user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?2)"
            }
        };
        self.conn.execute(sql, params![id, now])?;
        Ok(())
    }

    /// Remove a throwaway record by key. Unlike `delete_recipe` it leaves
    /// no tombstone.
    pub(crate) fn remove_untracked(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1",
                kind.table(),
                kind.key_column()
            ),
            params![id],
        )?;
        Ok(changed > 0)
    }

    pub(crate) fn probe_exists(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
        Ok(match kind {
            EntityKind::Recipe => self.get_recipe(id)?.is_some(),
            EntityKind::UserPreferences => self.get_preferences(id)?.is_some(),
        })
    }
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parsed_column<T>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = StoreError>,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|t| t.parse::<T>())
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Quick structural check plus a write, read and delete of a throwaway row,
/// inside one transaction. Uses only columns present since the first schema
/// version.
fn integrity_probe(conn: &Connection) -> Result<(), String> {
    let check: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| e.to_string())?;
    if check != "ok" {
        return Err(format!("quick_check reported: {check}"));
    }

    let probe = || -> rusqlite::Result<()> {
        let id = format!("__open_probe_{}", Uuid::new_v4());
        let now = timestamp();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO recipes (id, title, created_at, updated_at) VALUES (?1, 'open probe', ?2, ?2)",
            params![id, now],
        )?;
        let _: String = tx.query_row(
            "SELECT id FROM recipes WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        tx.execute("DELETE FROM recipes WHERE id = ?1", params![id])?;
        tx.commit()
    };
    probe().map_err(|e| format!("integrity probe failed: {e}"))
}
