//! Collaborators the sync engine consumes: the remote row store and the
//! authenticated session.

use std::collections::BTreeSet;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::RemoteError;
use crate::models::{Difficulty, Ingredient, Recipe, SyncMeta, UserPreferences};

/// Row-level CRUD against the hosted backend. Every call is scoped to one
/// user; the engine never issues cross-user queries.
pub trait RemoteStore: Send + Sync + 'static {
    fn get_preferences(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<RemotePreferences>, RemoteError>> + Send;

    /// Insert or overwrite the user's single preferences row.
    fn upsert_preferences(
        &self,
        user_id: &str,
        prefs: &RemotePreferences,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn list_recipes(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<RemoteRecipe>, RemoteError>> + Send;

    /// Insert the row, or merge into the user's existing row with the same
    /// `client_id`, so a retried insert never duplicates. Returns the remote
    /// primary key.
    fn upsert_recipe(
        &self,
        user_id: &str,
        recipe: &RemoteRecipe,
    ) -> impl Future<Output = Result<String, RemoteError>> + Send;

    fn update_recipe(
        &self,
        remote_id: &str,
        recipe: &RemoteRecipe,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Remove the user's row, matched by `remote_id` when known and by
    /// `client_id` otherwise. Deleting a row that is already gone succeeds.
    fn delete_recipe(
        &self,
        user_id: &str,
        client_id: &str,
        remote_id: Option<&str>,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// Source of the signed-in user. Emits `None` on sign-out.
pub trait SessionProvider: Send + Sync + 'static {
    fn current_user_id(&self) -> Option<String>;
    fn subscribe(&self) -> watch::Receiver<Option<String>>;
}

/// A session driven explicitly by the host (CLI flags, tests).
pub struct StaticSession {
    tx: watch::Sender<Option<String>>,
}

impl StaticSession {
    pub fn new(user_id: Option<String>) -> Self {
        let (tx, _) = watch::channel(user_id);
        Self { tx }
    }

    pub fn signed_in(user_id: &str) -> Self {
        Self::new(Some(user_id.to_string()))
    }

    pub fn sign_in(&self, user_id: &str) {
        self.tx.send_replace(Some(user_id.to_string()));
    }

    pub fn sign_out(&self) {
        self.tx.send_replace(None);
    }
}

impl SessionProvider for StaticSession {
    fn current_user_id(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

// --- Wire records ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePreferences {
    pub user_id: String,
    #[serde(default)]
    pub dietary_restrictions: BTreeSet<String>,
    #[serde(default)]
    pub allergies: BTreeSet<String>,
    #[serde(default)]
    pub intolerances: BTreeSet<String>,
    #[serde(default)]
    pub medical_conditions: BTreeSet<String>,
    #[serde(default)]
    pub diet_type: Option<String>,
    #[serde(default)]
    pub cooking_time: Option<String>,
    #[serde(default)]
    pub difficulty_level: Option<Difficulty>,
    #[serde(default)]
    pub serving_size: Option<u32>,
    #[serde(default)]
    pub measurement_unit: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub onboarding_complete: bool,
    #[serde(default)]
    pub notifications_enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl RemotePreferences {
    #[must_use]
    pub fn from_local(p: &UserPreferences) -> Self {
        Self {
            user_id: p.user_id.clone(),
            dietary_restrictions: p.dietary_restrictions.clone(),
            allergies: p.allergies.clone(),
            intolerances: p.intolerances.clone(),
            medical_conditions: p.medical_conditions.clone(),
            diet_type: p.diet_type.clone(),
            cooking_time: p.cooking_time.clone(),
            difficulty_level: p.difficulty_level,
            serving_size: p.serving_size,
            measurement_unit: p.measurement_unit.clone(),
            language: p.language.clone(),
            theme: p.theme.clone(),
            onboarding_complete: p.onboarding_complete,
            notifications_enabled: p.notifications_enabled,
            created_at: p.created_at.clone(),
            updated_at: p.updated_at.clone(),
        }
    }

    #[must_use]
    pub fn into_local(self) -> UserPreferences {
        UserPreferences {
            user_id: self.user_id,
            dietary_restrictions: self.dietary_restrictions,
            allergies: self.allergies,
            intolerances: self.intolerances,
            medical_conditions: self.medical_conditions,
            diet_type: self.diet_type,
            cooking_time: self.cooking_time,
            difficulty_level: self.difficulty_level,
            serving_size: self.serving_size,
            measurement_unit: self.measurement_unit,
            language: self.language,
            theme: self.theme,
            onboarding_complete: self.onboarding_complete,
            notifications_enabled: self.notifications_enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
            sync: SyncMeta::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecipe {
    /// Remote primary key; absent on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The locally generated id, shared by every device.
    pub client_id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub prep_time_min: Option<u32>,
    #[serde(default)]
    pub cook_time_min: Option<u32>,
    #[serde(default)]
    pub servings: Option<u32>,
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub cuisine: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tips: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub is_adapted: bool,
    #[serde(default)]
    pub original_recipe_id: Option<String>,
    #[serde(default)]
    pub adapted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl RemoteRecipe {
    #[must_use]
    pub fn from_local(r: &Recipe, user_id: &str) -> Self {
        Self {
            id: r.sync.remote_id.clone(),
            client_id: r.id.clone(),
            user_id: user_id.to_string(),
            title: r.title.clone(),
            description: r.description.clone(),
            ingredients: r.ingredients.clone(),
            instructions: r.instructions.clone(),
            prep_time_min: r.prep_time_min,
            cook_time_min: r.cook_time_min,
            servings: r.servings,
            difficulty: r.difficulty,
            tags: r.tags.clone(),
            cuisine: r.cuisine.clone(),
            image_url: r.image_url.clone(),
            source: r.source.clone(),
            tips: r.tips.clone(),
            warnings: r.warnings.clone(),
            is_favorite: r.is_favorite,
            is_adapted: r.is_adapted,
            original_recipe_id: r.original_recipe_id.clone(),
            adapted_at: r.adapted_at.clone(),
            created_at: r.created_at.clone(),
            updated_at: r.updated_at.clone(),
        }
    }

    /// Local form of this row. `local_id` overrides `client_id` when the row
    /// matched an existing local record by remote id.
    #[must_use]
    pub fn into_local(self, local_id: Option<String>) -> Recipe {
        Recipe {
            id: local_id.unwrap_or(self.client_id),
            title: self.title,
            description: self.description,
            ingredients: self.ingredients,
            instructions: self.instructions,
            prep_time_min: self.prep_time_min,
            cook_time_min: self.cook_time_min,
            servings: self.servings,
            difficulty: self.difficulty,
            tags: self.tags,
            cuisine: self.cuisine,
            image_url: self.image_url,
            source: self.source,
            tips: self.tips,
            warnings: self.warnings,
            is_favorite: self.is_favorite,
            is_adapted: self.is_adapted,
            original_recipe_id: self.original_recipe_id,
            adapted_at: self.adapted_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            sync: SyncMeta {
                remote_id: self.id,
                ..SyncMeta::default()
            },
        }
    }
}
