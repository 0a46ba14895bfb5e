use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

// --- Entity kinds ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Recipe,
    UserPreferences,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Recipe, EntityKind::UserPreferences];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityKind::Recipe => "recipe",
            EntityKind::UserPreferences => "user_preferences",
        }
    }

    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            EntityKind::Recipe => "recipes",
            EntityKind::UserPreferences => "user_preferences",
        }
    }

    /// Column holding the record's key.
    #[must_use]
    pub const fn key_column(self) -> &'static str {
        match self {
            EntityKind::Recipe => "id",
            EntityKind::UserPreferences => "user_id",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Sync bookkeeping ---

/// Where the current local version of a record came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    #[default]
    Local,
    Remote,
}

impl RecordOrigin {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RecordOrigin::Local => "local",
            RecordOrigin::Remote => "remote",
        }
    }
}

impl FromStr for RecordOrigin {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(RecordOrigin::Local),
            "remote" => Ok(RecordOrigin::Remote),
            other => Err(StoreError::validation(
                "origin",
                format!("unknown record origin '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub origin: RecordOrigin,
    /// Local changes not yet pushed.
    pub dirty: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub remote_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub synced_at: Option<String>,
}

// --- Recipes ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    Expert,
}

impl Difficulty {
    pub const ALL: [Difficulty; 4] = [
        Difficulty::Easy,
        Difficulty::Medium,
        Difficulty::Hard,
        Difficulty::Expert,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
            Difficulty::Expert => "expert",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Difficulty::ALL
            .into_iter()
            .find(|d| d.as_str() == lower)
            .ok_or_else(|| {
                StoreError::validation(
                    "difficulty",
                    format!("'{s}' is not one of easy, medium, hard, expert"),
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

impl Ingredient {
    #[must_use]
    pub fn new(name: &str, amount: Option<f64>, unit: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            amount,
            unit: unit.map(str::to_string),
            optional: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    pub ingredients: Vec<Ingredient>,
    pub instructions: Vec<String>,
    pub prep_time_min: Option<u32>,
    pub cook_time_min: Option<u32>,
    pub servings: Option<u32>,
    pub difficulty: Option<Difficulty>,
    pub tags: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cuisine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source: Option<String>,
    #[serde(default)]
    pub tips: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub is_favorite: bool,
    pub is_adapted: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_recipe_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub adapted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub sync: SyncMeta,
}

impl Recipe {
    /// Total of prep and cook time, if either is known.
    #[must_use]
    pub fn total_time_min(&self) -> Option<u32> {
        match (self.prep_time_min, self.cook_time_min) {
            (None, None) => None,
            (p, c) => Some(p.unwrap_or(0).saturating_add(c.unwrap_or(0))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRecipe {
    pub title: String,
    pub description: Option<String>,
    pub ingredients: Vec<Ingredient>,
    pub instructions: Vec<String>,
    pub prep_time_min: Option<u32>,
    pub cook_time_min: Option<u32>,
    pub servings: Option<u32>,
    pub difficulty: Option<Difficulty>,
    pub tags: BTreeSet<String>,
    pub cuisine: Option<String>,
    pub image_url: Option<String>,
    pub source: Option<String>,
    pub tips: Vec<String>,
    pub warnings: Vec<String>,
    pub is_favorite: bool,
    pub is_adapted: bool,
    pub original_recipe_id: Option<String>,
}

impl NewRecipe {
    #[must_use]
    pub fn titled(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Self::default()
        }
    }
}

/// Partial recipe update. Outer `None` leaves a field untouched; for nullable
/// fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(clippy::option_option)]
pub struct RecipeUpdate {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub ingredients: Option<Vec<Ingredient>>,
    pub instructions: Option<Vec<String>>,
    pub prep_time_min: Option<Option<u32>>,
    pub cook_time_min: Option<Option<u32>>,
    pub servings: Option<Option<u32>>,
    pub difficulty: Option<Option<Difficulty>>,
    pub tags: Option<BTreeSet<String>>,
    pub cuisine: Option<Option<String>>,
    pub image_url: Option<Option<String>>,
    pub source: Option<Option<String>>,
    pub tips: Option<Vec<String>>,
    pub warnings: Option<Vec<String>>,
    pub is_favorite: Option<bool>,
}

impl RecipeUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the set fields onto `recipe`.
    pub fn apply_to(&self, recipe: &mut Recipe) {
        if let Some(ref v) = self.title {
            recipe.title.clone_from(v);
        }
        if let Some(ref v) = self.description {
            recipe.description.clone_from(v);
        }
        if let Some(ref v) = self.ingredients {
            recipe.ingredients.clone_from(v);
        }
        if let Some(ref v) = self.instructions {
            recipe.instructions.clone_from(v);
        }
        if let Some(v) = self.prep_time_min {
            recipe.prep_time_min = v;
        }
        if let Some(v) = self.cook_time_min {
            recipe.cook_time_min = v;
        }
        if let Some(v) = self.servings {
            recipe.servings = v;
        }
        if let Some(v) = self.difficulty {
            recipe.difficulty = v;
        }
        if let Some(ref v) = self.tags {
            recipe.tags.clone_from(v);
        }
        if let Some(ref v) = self.cuisine {
            recipe.cuisine.clone_from(v);
        }
        if let Some(ref v) = self.image_url {
            recipe.image_url.clone_from(v);
        }
        if let Some(ref v) = self.source {
            recipe.source.clone_from(v);
        }
        if let Some(ref v) = self.tips {
            recipe.tips.clone_from(v);
        }
        if let Some(ref v) = self.warnings {
            recipe.warnings.clone_from(v);
        }
        if let Some(v) = self.is_favorite {
            recipe.is_favorite = v;
        }
    }
}

/// Optional, AND-combined recipe query.
#[derive(Debug, Clone, Default)]
pub struct RecipeFilter {
    pub favorites_only: bool,
    pub adapted_only: bool,
    pub tag: Option<String>,
    /// Case-insensitive substring match on the title.
    pub search: Option<String>,
    pub original_recipe_id: Option<String>,
}

impl RecipeFilter {
    #[must_use]
    pub fn matches(&self, recipe: &Recipe) -> bool {
        if self.favorites_only && !recipe.is_favorite {
            return false;
        }
        if self.adapted_only && !recipe.is_adapted {
            return false;
        }
        if let Some(ref tag) = self.tag {
            if !recipe.tags.contains(tag) {
                return false;
            }
        }
        if let Some(ref q) = self.search {
            if !recipe.title.to_lowercase().contains(&q.to_lowercase()) {
                return false;
            }
        }
        if let Some(ref original) = self.original_recipe_id {
            if recipe.original_recipe_id.as_deref() != Some(original.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Marker left by a user delete. Pulls skip rows it matches and the next
/// push removes the remote copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeTombstone {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub remote_id: Option<String>,
    pub deleted_at: String,
}

// --- User preferences ---

pub const DIETARY_RESTRICTIONS: &[&str] = &[
    "vegetarian",
    "vegan",
    "gluten_free",
    "lactose_free",
    "low_carb",
    "low_fat",
    "low_sodium",
    "high_protein",
    "keto",
    "paleo",
    "mediterranean",
    "sugar_free",
    "low_fodmap",
];

pub const ALLERGIES: &[&str] = &[
    "dairy",
    "eggs",
    "fish",
    "shellfish",
    "tree_nuts",
    "peanuts",
    "wheat",
    "soy",
    "sesame",
    "mustard",
    "celery",
    "sulfites",
    "lupin",
    "molluscs",
];

pub const INTOLERANCES: &[&str] = &[
    "lactose",
    "gluten",
    "fructose",
    "histamine",
    "fodmap",
    "salicylates",
    "oxalates",
    "lectins",
];

pub const MEDICAL_CONDITIONS: &[&str] = &[
    "diabetes_type1",
    "diabetes_type2",
    "prediabetes",
    "insulin_resistance",
    "hypertension",
    "high_cholesterol",
    "high_triglycerides",
    "heart_disease",
];

pub const DIET_TYPES: &[&str] = &["mediterranean", "dash", "plant_based", "ketogenic"];

pub const COOKING_TIMES: &[&str] = &["quick", "medium", "long"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub user_id: String,
    pub dietary_restrictions: BTreeSet<String>,
    pub allergies: BTreeSet<String>,
    pub intolerances: BTreeSet<String>,
    pub medical_conditions: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub diet_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cooking_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub difficulty_level: Option<Difficulty>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub serving_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub measurement_unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub theme: Option<String>,
    pub onboarding_complete: bool,
    pub notifications_enabled: bool,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub sync: SyncMeta,
}

impl UserPreferences {
    #[must_use]
    pub fn from_payload(
        user_id: &str,
        payload: &NewPreferences,
        created_at: String,
        updated_at: String,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            dietary_restrictions: payload.dietary_restrictions.clone(),
            allergies: payload.allergies.clone(),
            intolerances: payload.intolerances.clone(),
            medical_conditions: payload.medical_conditions.clone(),
            diet_type: payload.diet_type.clone(),
            cooking_time: payload.cooking_time.clone(),
            difficulty_level: payload.difficulty_level,
            serving_size: payload.serving_size,
            measurement_unit: payload.measurement_unit.clone(),
            language: payload.language.clone(),
            theme: payload.theme.clone(),
            onboarding_complete: payload.onboarding_complete,
            notifications_enabled: payload.notifications_enabled,
            created_at,
            updated_at,
            sync: SyncMeta::default(),
        }
    }

    /// The writable payload of this record.
    #[must_use]
    pub fn to_new(&self) -> NewPreferences {
        NewPreferences {
            dietary_restrictions: self.dietary_restrictions.clone(),
            allergies: self.allergies.clone(),
            intolerances: self.intolerances.clone(),
            medical_conditions: self.medical_conditions.clone(),
            diet_type: self.diet_type.clone(),
            cooking_time: self.cooking_time.clone(),
            difficulty_level: self.difficulty_level,
            serving_size: self.serving_size,
            measurement_unit: self.measurement_unit.clone(),
            language: self.language.clone(),
            theme: self.theme.clone(),
            onboarding_complete: self.onboarding_complete,
            notifications_enabled: self.notifications_enabled,
        }
    }
}

/// Full preferences payload. An upsert replaces the stored record wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPreferences {
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
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NewPreferences {
    fn default() -> Self {
        Self {
            dietary_restrictions: BTreeSet::new(),
            allergies: BTreeSet::new(),
            intolerances: BTreeSet::new(),
            medical_conditions: BTreeSet::new(),
            diet_type: None,
            cooking_time: None,
            difficulty_level: None,
            serving_size: None,
            measurement_unit: None,
            language: None,
            theme: None,
            onboarding_complete: false,
            notifications_enabled: true,
        }
    }
}

/// Field-by-field change to stored preferences. `None` leaves the stored
/// value untouched; a given list replaces the stored list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreferencesUpdate {
    pub dietary_restrictions: Option<BTreeSet<String>>,
    pub allergies: Option<BTreeSet<String>>,
    pub intolerances: Option<BTreeSet<String>>,
    pub medical_conditions: Option<BTreeSet<String>>,
    pub diet_type: Option<String>,
    pub cooking_time: Option<String>,
    pub difficulty_level: Option<Difficulty>,
    pub serving_size: Option<u32>,
    pub measurement_unit: Option<String>,
    pub language: Option<String>,
    pub theme: Option<String>,
    pub onboarding_complete: Option<bool>,
    pub notifications_enabled: Option<bool>,
}

impl PreferencesUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, prefs: &mut NewPreferences) {
        fn set<T: Clone>(slot: &mut T, value: Option<&T>) {
            if let Some(v) = value {
                slot.clone_from(v);
            }
        }
        set(&mut prefs.dietary_restrictions, self.dietary_restrictions.as_ref());
        set(&mut prefs.allergies, self.allergies.as_ref());
        set(&mut prefs.intolerances, self.intolerances.as_ref());
        set(&mut prefs.medical_conditions, self.medical_conditions.as_ref());
        if self.diet_type.is_some() {
            prefs.diet_type.clone_from(&self.diet_type);
        }
        if self.cooking_time.is_some() {
            prefs.cooking_time.clone_from(&self.cooking_time);
        }
        if self.difficulty_level.is_some() {
            prefs.difficulty_level = self.difficulty_level;
        }
        if self.serving_size.is_some() {
            prefs.serving_size = self.serving_size;
        }
        if self.measurement_unit.is_some() {
            prefs.measurement_unit.clone_from(&self.measurement_unit);
        }
        if self.language.is_some() {
            prefs.language.clone_from(&self.language);
        }
        if self.theme.is_some() {
            prefs.theme.clone_from(&self.theme);
        }
        set(&mut prefs.onboarding_complete, self.onboarding_complete.as_ref());
        set(&mut prefs.notifications_enabled, self.notifications_enabled.as_ref());
    }

    /// `base` with this update applied.
    #[must_use]
    pub fn applied_to(&self, mut base: NewPreferences) -> NewPreferences {
        self.apply_to(&mut base);
        base
    }
}

// --- Validation ---

fn validate_set(
    field: &'static str,
    values: &BTreeSet<String>,
    allowed: &[&str],
) -> Result<(), StoreError> {
    for v in values {
        if !allowed.contains(&v.as_str()) {
            return Err(StoreError::validation(
                field,
                format!("unknown identifier '{v}'"),
            ));
        }
    }
    Ok(())
}

fn validate_choice(
    field: &'static str,
    value: Option<&str>,
    allowed: &[&str],
) -> Result<(), StoreError> {
    match value {
        Some(v) if !allowed.contains(&v) => Err(StoreError::validation(
            field,
            format!("'{v}' must be one of {}", allowed.join(", ")),
        )),
        _ => Ok(()),
    }
}

pub fn validate_user_id(user_id: &str) -> Result<(), StoreError> {
    if user_id.trim().is_empty() {
        return Err(StoreError::validation("user_id", "must not be empty"));
    }
    Ok(())
}

pub fn validate_preferences(prefs: &NewPreferences) -> Result<(), StoreError> {
    validate_set(
        "dietary_restrictions",
        &prefs.dietary_restrictions,
        DIETARY_RESTRICTIONS,
    )?;
    validate_set("allergies", &prefs.allergies, ALLERGIES)?;
    validate_set("intolerances", &prefs.intolerances, INTOLERANCES)?;
    validate_set(
        "medical_conditions",
        &prefs.medical_conditions,
        MEDICAL_CONDITIONS,
    )?;
    validate_choice("diet_type", prefs.diet_type.as_deref(), DIET_TYPES)?;
    validate_choice("cooking_time", prefs.cooking_time.as_deref(), COOKING_TIMES)?;
    if prefs.serving_size == Some(0) {
        return Err(StoreError::validation(
            "serving_size",
            "must be greater than 0",
        ));
    }
    Ok(())
}

pub fn validate_title(title: &str) -> Result<(), StoreError> {
    if title.trim().is_empty() {
        return Err(StoreError::validation("title", "must not be empty"));
    }
    Ok(())
}

fn validate_recipe_fields(
    servings: Option<u32>,
    ingredients: &[Ingredient],
    tags: &BTreeSet<String>,
) -> Result<(), StoreError> {
    if servings == Some(0) {
        return Err(StoreError::validation("servings", "must be greater than 0"));
    }
    for ing in ingredients {
        if ing.name.trim().is_empty() {
            return Err(StoreError::validation(
                "ingredients",
                "ingredient name must not be empty",
            ));
        }
        if let Some(amount) = ing.amount {
            if !amount.is_finite() || amount < 0.0 {
                return Err(StoreError::validation(
                    "ingredients",
                    format!("amount for '{}' must be a non-negative number", ing.name),
                ));
            }
        }
    }
    if tags.iter().any(|t| t.trim().is_empty()) {
        return Err(StoreError::validation("tags", "tags must not be empty"));
    }
    Ok(())
}

pub fn validate_new_recipe(recipe: &NewRecipe) -> Result<(), StoreError> {
    validate_title(&recipe.title)?;
    validate_recipe_fields(recipe.servings, &recipe.ingredients, &recipe.tags)?;
    if recipe.is_adapted && recipe.original_recipe_id.is_none() {
        return Err(StoreError::validation(
            "original_recipe_id",
            "adapted recipes must reference the recipe they were adapted from",
        ));
    }
    Ok(())
}

pub fn validate_recipe(recipe: &Recipe) -> Result<(), StoreError> {
    validate_title(&recipe.title)?;
    validate_recipe_fields(recipe.servings, &recipe.ingredients, &recipe.tags)
}
