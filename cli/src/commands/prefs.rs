use std::collections::BTreeSet;

use anyhow::Result;
use clap::Args;

use recipetuner_core::db::Database;
use recipetuner_core::error::StoreError;
use recipetuner_core::models::{Difficulty, NewPreferences, PreferencesUpdate, UserPreferences};

use super::helpers::{join_set, not_found, print_json};

#[derive(Args)]
pub(crate) struct PrefsArgs {
    /// Dietary restriction, e.g. vegan or gluten_free (repeatable)
    #[arg(long = "restriction", value_name = "ID")]
    restrictions: Vec<String>,
    /// Allergy, e.g. peanuts or shellfish (repeatable)
    #[arg(long = "allergy", value_name = "ID")]
    allergies: Vec<String>,
    /// Intolerance, e.g. lactose (repeatable)
    #[arg(long = "intolerance", value_name = "ID")]
    intolerances: Vec<String>,
    /// Medical condition, e.g. hypertension (repeatable)
    #[arg(long = "condition", value_name = "ID")]
    conditions: Vec<String>,
    /// mediterranean, dash, plant_based or ketogenic
    #[arg(long)]
    diet_type: Option<String>,
    /// quick, medium or long
    #[arg(long)]
    cooking_time: Option<String>,
    /// Preferred recipe difficulty
    #[arg(long)]
    difficulty: Option<String>,
    /// Default number of servings
    #[arg(long)]
    servings: Option<u32>,
    /// Measurement system, e.g. metric
    #[arg(long)]
    unit: Option<String>,
    /// Language code, e.g. en
    #[arg(long)]
    language: Option<String>,
    /// UI theme, e.g. light or dark
    #[arg(long)]
    theme: Option<String>,
    /// Mark onboarding as complete
    #[arg(long)]
    onboarded: bool,
    /// Enable or disable notifications
    #[arg(long, value_name = "BOOL")]
    notifications: Option<bool>,
    /// Start from empty preferences instead of the stored ones
    #[arg(long)]
    reset: bool,
}

impl PrefsArgs {
    /// The options given on the command line. List options replace the
    /// stored list when given; everything else is left alone.
    fn to_update(&self) -> Result<PreferencesUpdate> {
        let set = |values: &[String]| -> Option<BTreeSet<String>> {
            (!values.is_empty()).then(|| values.iter().cloned().collect())
        };
        Ok(PreferencesUpdate {
            dietary_restrictions: set(&self.restrictions),
            allergies: set(&self.allergies),
            intolerances: set(&self.intolerances),
            medical_conditions: set(&self.conditions),
            diet_type: self.diet_type.clone(),
            cooking_time: self.cooking_time.clone(),
            difficulty_level: self
                .difficulty
                .as_deref()
                .map(str::parse::<Difficulty>)
                .transpose()?,
            serving_size: self.servings,
            measurement_unit: self.unit.clone(),
            language: self.language.clone(),
            theme: self.theme.clone(),
            onboarding_complete: self.onboarded.then_some(true),
            notifications_enabled: self.notifications,
        })
    }
}

fn print_preferences(p: &UserPreferences) {
    let or_dash = |v: Option<&str>| v.unwrap_or("-").to_string();
    println!("Preferences for {}", p.user_id);
    println!("  Restrictions:  {}", join_set(&p.dietary_restrictions));
    println!("  Allergies:     {}", join_set(&p.allergies));
    println!("  Intolerances:  {}", join_set(&p.intolerances));
    println!("  Conditions:    {}", join_set(&p.medical_conditions));
    println!("  Diet type:     {}", or_dash(p.diet_type.as_deref()));
    println!("  Cooking time:  {}", or_dash(p.cooking_time.as_deref()));
    println!(
        "  Difficulty:    {}",
        p.difficulty_level.map_or("-".into(), |d| d.to_string())
    );
    println!(
        "  Servings:      {}",
        p.serving_size.map_or("-".into(), |s| s.to_string())
    );
    println!("  Units:         {}", or_dash(p.measurement_unit.as_deref()));
    println!("  Language:      {}", or_dash(p.language.as_deref()));
    println!("  Theme:         {}", or_dash(p.theme.as_deref()));
    println!("  Onboarded:     {}", if p.onboarding_complete { "yes" } else { "no" });
    println!(
        "  Notifications: {}",
        if p.notifications_enabled { "on" } else { "off" }
    );
    println!(
        "  Sync:          {}",
        if p.sync.dirty { "pending" } else { "synced" }
    );
    println!("  Updated:       {}", p.updated_at);
}

pub(crate) fn cmd_prefs_show(db: &Database, user_id: &str, json: bool) -> Result<()> {
    let Some(prefs) = db.get_preferences(user_id)? else {
        not_found(
            &format!("No preferences stored for '{user_id}'. Use `recipetuner prefs set`."),
            json,
        );
    };
    if json {
        print_json(&prefs)
    } else {
        print_preferences(&prefs);
        Ok(())
    }
}

pub(crate) fn cmd_prefs_set(db: &Database, user_id: &str, args: PrefsArgs, json: bool) -> Result<()> {
    let update = args.to_update()?;
    let fresh = || db.upsert_preferences(user_id, &update.applied_to(NewPreferences::default()));
    let saved = if args.reset {
        fresh()?
    } else {
        match db.update_preferences(user_id, &update) {
            Ok(saved) => saved,
            Err(StoreError::NotFound { .. }) => fresh()?,
            Err(e) => return Err(e.into()),
        }
    };
    if json {
        print_json(&saved)
    } else {
        print_preferences(&saved);
        Ok(())
    }
}
