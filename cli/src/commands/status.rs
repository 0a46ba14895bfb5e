use anyhow::Result;
use serde::Serialize;

use recipetuner_core::db::Database;
use recipetuner_core::init::{InitController, InitState};
use recipetuner_core::models::{EntityKind, RecipeFilter};

use super::helpers::print_json;

#[derive(Serialize)]
struct Status {
    #[serde(flatten)]
    state: InitState,
    store_path: Option<String>,
    schema_version: u32,
    recipes: i64,
    preferences: i64,
    favorites: usize,
    pending_push: usize,
}

pub(crate) fn cmd_status(controller: &InitController, db: &Database, json: bool) -> Result<()> {
    let status = Status {
        state: controller.state(),
        store_path: db.path().map(|p| p.display().to_string()),
        schema_version: db.schema_version()?,
        recipes: db.count(EntityKind::Recipe)?,
        preferences: db.count(EntityKind::UserPreferences)?,
        favorites: db
            .list_recipes(&RecipeFilter {
                favorites_only: true,
                ..RecipeFilter::default()
            })?
            .len(),
        pending_push: db.dirty_recipes()?.len(),
    };

    if json {
        return print_json(&status);
    }

    let state = match &status.state {
        InitState::Idle => "idle".to_string(),
        InitState::Initializing { attempt } => format!("initializing (attempt {attempt})"),
        InitState::Ready => "ready".to_string(),
        InitState::Failed { reason, .. } => format!("failed: {reason}"),
    };
    println!("Store:          {state}");
    println!(
        "Path:           {}",
        status.store_path.as_deref().unwrap_or("(in memory)")
    );
    println!("Schema version: {}", status.schema_version);
    println!(
        "Recipes:        {} ({} favorites, {} pending push)",
        status.recipes, status.favorites, status.pending_push
    );
    println!("Preferences:    {}", status.preferences);
    Ok(())
}
