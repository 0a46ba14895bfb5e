use std::collections::BTreeSet;

use anyhow::Result;
use clap::Args;

use recipetuner_core::db::Database;
use recipetuner_core::models::{Difficulty, NewRecipe, Recipe, RecipeFilter, RecipeUpdate};

use super::helpers::{
    format_ingredient, join_set, not_found, parse_ingredients, print_json, print_recipe_table,
    short_id, sync_label,
};

#[derive(Args)]
pub(crate) struct RecipeArgs {
    /// Recipe title
    title: String,
    /// Short description
    #[arg(long)]
    description: Option<String>,
    /// Ingredient as name[:amount[:unit]] (repeatable)
    #[arg(short, long = "ingredient", value_name = "INGREDIENT")]
    ingredients: Vec<String>,
    /// Instruction step (repeatable, in order)
    #[arg(long = "step", value_name = "TEXT")]
    steps: Vec<String>,
    /// Preparation time in minutes
    #[arg(long)]
    prep: Option<u32>,
    /// Cooking time in minutes
    #[arg(long)]
    cook: Option<u32>,
    /// Number of servings
    #[arg(long)]
    servings: Option<u32>,
    /// easy, medium, hard or expert
    #[arg(long)]
    difficulty: Option<String>,
    /// Tag (repeatable)
    #[arg(short, long = "tag", value_name = "TAG")]
    tags: Vec<String>,
    /// Cuisine, e.g. "italian"
    #[arg(long)]
    cuisine: Option<String>,
    /// Where the recipe came from
    #[arg(long)]
    source: Option<String>,
    /// Mark as favorite
    #[arg(long)]
    favorite: bool,
}

impl RecipeArgs {
    fn into_new(self) -> Result<NewRecipe> {
        Ok(NewRecipe {
            title: self.title,
            description: self.description,
            ingredients: parse_ingredients(&self.ingredients)?,
            instructions: self.steps,
            prep_time_min: self.prep,
            cook_time_min: self.cook,
            servings: self.servings,
            difficulty: self
                .difficulty
                .as_deref()
                .map(str::parse::<Difficulty>)
                .transpose()?,
            tags: self.tags.into_iter().collect(),
            cuisine: self.cuisine,
            source: self.source,
            is_favorite: self.favorite,
            ..NewRecipe::default()
        })
    }
}

/// Field changes. List options replace the stored list when given.
#[derive(Args)]
pub(crate) struct RecipeEdit {
    /// New title
    #[arg(long)]
    title: Option<String>,
    /// New description
    #[arg(long)]
    description: Option<String>,
    /// Replacement ingredient list, as name[:amount[:unit]] (repeatable)
    #[arg(short, long = "ingredient", value_name = "INGREDIENT")]
    ingredients: Vec<String>,
    /// Replacement instruction steps (repeatable)
    #[arg(long = "step", value_name = "TEXT")]
    steps: Vec<String>,
    /// Preparation time in minutes
    #[arg(long)]
    prep: Option<u32>,
    /// Cooking time in minutes
    #[arg(long)]
    cook: Option<u32>,
    /// Number of servings
    #[arg(long)]
    servings: Option<u32>,
    /// easy, medium, hard or expert
    #[arg(long)]
    difficulty: Option<String>,
    /// Replacement tags (repeatable)
    #[arg(short, long = "tag", value_name = "TAG")]
    tags: Vec<String>,
    /// Cuisine
    #[arg(long)]
    cuisine: Option<String>,
    /// Tip (repeatable, replaces stored tips)
    #[arg(long = "tip", value_name = "TEXT")]
    tips: Vec<String>,
    /// Warning, e.g. an allergen note (repeatable, replaces stored warnings)
    #[arg(long = "warning", value_name = "TEXT")]
    warnings: Vec<String>,
}

impl RecipeEdit {
    fn into_update(self) -> Result<RecipeUpdate> {
        let non_empty = |v: Vec<String>| (!v.is_empty()).then_some(v);
        Ok(RecipeUpdate {
            title: self.title,
            description: self.description.map(Some),
            ingredients: if self.ingredients.is_empty() {
                None
            } else {
                Some(parse_ingredients(&self.ingredients)?)
            },
            instructions: non_empty(self.steps),
            prep_time_min: self.prep.map(Some),
            cook_time_min: self.cook.map(Some),
            servings: self.servings.map(Some),
            difficulty: self
                .difficulty
                .as_deref()
                .map(str::parse::<Difficulty>)
                .transpose()?
                .map(Some),
            tags: (!self.tags.is_empty()).then(|| self.tags.into_iter().collect::<BTreeSet<_>>()),
            cuisine: self.cuisine.map(Some),
            tips: non_empty(self.tips),
            warnings: non_empty(self.warnings),
            ..RecipeUpdate::default()
        })
    }
}

/// The payload for an adaptation of `original` with `update` applied.
fn adaptation_of(original: &Recipe, update: &RecipeUpdate) -> NewRecipe {
    let mut base = original.clone();
    if update.title.is_none() {
        base.title = format!("{} (adapted)", original.title);
    }
    update.apply_to(&mut base);
    NewRecipe {
        title: base.title,
        description: base.description,
        ingredients: base.ingredients,
        instructions: base.instructions,
        prep_time_min: base.prep_time_min,
        cook_time_min: base.cook_time_min,
        servings: base.servings,
        difficulty: base.difficulty,
        tags: base.tags,
        cuisine: base.cuisine,
        image_url: base.image_url,
        source: base.source,
        tips: base.tips,
        warnings: base.warnings,
        is_favorite: false,
        is_adapted: true,
        original_recipe_id: Some(original.id.clone()),
    }
}

fn print_created(recipe: &Recipe, json: bool) -> Result<()> {
    if json {
        print_json(recipe)
    } else {
        println!("Created recipe: {} (id: {})", recipe.title, recipe.id);
        Ok(())
    }
}

pub(crate) fn cmd_recipe_add(db: &Database, args: RecipeArgs, json: bool) -> Result<()> {
    let recipe = db.create_recipe(&args.into_new()?)?;
    print_created(&recipe, json)
}

pub(crate) fn cmd_recipe_list(db: &Database, filter: &RecipeFilter, json: bool) -> Result<()> {
    let recipes = db.list_recipes(filter)?;
    if json {
        print_json(&recipes)
    } else if recipes.is_empty() {
        eprintln!("No recipes found. Use `recipetuner recipe add` to create one.");
        Ok(())
    } else {
        print_recipe_table(&recipes);
        Ok(())
    }
}

pub(crate) fn cmd_recipe_show(db: &Database, id: &str, json: bool) -> Result<()> {
    let Some(recipe) = db.get_recipe(id)? else {
        not_found(&format!("Recipe '{id}' not found"), json);
    };
    if json {
        return print_json(&recipe);
    }

    println!("{}", recipe.title);
    if let Some(ref d) = recipe.description {
        println!("{d}");
    }
    println!();
    println!("  ID:         {}", recipe.id);
    if let Some(ref original) = recipe.original_recipe_id {
        println!("  Adapted:    from {}", short_id(original));
    }
    if let Some(total) = recipe.total_time_min() {
        println!("  Time:       {total} min");
    }
    if let Some(servings) = recipe.servings {
        println!("  Servings:   {servings}");
    }
    if let Some(d) = recipe.difficulty {
        println!("  Difficulty: {d}");
    }
    if let Some(ref c) = recipe.cuisine {
        println!("  Cuisine:    {c}");
    }
    println!("  Tags:       {}", join_set(&recipe.tags));
    println!("  Favorite:   {}", if recipe.is_favorite { "yes" } else { "no" });
    println!("  Sync:       {}", sync_label(&recipe));

    if !recipe.ingredients.is_empty() {
        println!("\nIngredients:");
        for i in &recipe.ingredients {
            println!("  - {}", format_ingredient(i));
        }
    }
    if !recipe.instructions.is_empty() {
        println!("\nSteps:");
        for (n, step) in recipe.instructions.iter().enumerate() {
            println!("  {}. {step}", n + 1);
        }
    }
    for tip in &recipe.tips {
        println!("\nTip: {tip}");
    }
    for warning in &recipe.warnings {
        println!("\nWarning: {warning}");
    }
    Ok(())
}

pub(crate) fn cmd_recipe_update(db: &Database, id: &str, edit: RecipeEdit, json: bool) -> Result<()> {
    let update = edit.into_update()?;
    if update.is_empty() {
        anyhow::bail!("Nothing to update. Pass at least one field option");
    }
    if !db.update_recipe(id, &update)? {
        not_found(&format!("Recipe '{id}' not found"), json);
    }
    if json {
        if let Some(recipe) = db.get_recipe(id)? {
            print_json(&recipe)?;
        }
    } else {
        println!("Updated recipe {id}");
    }
    Ok(())
}

pub(crate) fn cmd_recipe_delete(db: &Database, id: &str, json: bool) -> Result<()> {
    if !db.delete_recipe(id)? {
        not_found(&format!("Recipe '{id}' not found"), json);
    }
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted recipe {id}");
    }
    Ok(())
}

pub(crate) fn cmd_recipe_favorite(db: &Database, id: &str, on: bool, json: bool) -> Result<()> {
    let update = RecipeUpdate {
        is_favorite: Some(on),
        ..RecipeUpdate::default()
    };
    if !db.update_recipe(id, &update)? {
        not_found(&format!("Recipe '{id}' not found"), json);
    }
    if json {
        println!("{}", serde_json::json!({ "id": id, "is_favorite": on }));
    } else if on {
        println!("Marked {id} as favorite");
    } else {
        println!("Removed favorite mark from {id}");
    }
    Ok(())
}

pub(crate) fn cmd_recipe_adapt(db: &Database, id: &str, edit: RecipeEdit, json: bool) -> Result<()> {
    let Some(original) = db.get_recipe(id)? else {
        not_found(&format!("Recipe '{id}' not found"), json);
    };
    let update = edit.into_update()?;
    let adapted = db.create_recipe(&adaptation_of(&original, &update))?;
    print_created(&adapted, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit() -> RecipeEdit {
        RecipeEdit {
            title: None,
            description: None,
            ingredients: Vec::new(),
            steps: Vec::new(),
            prep: None,
            cook: None,
            servings: None,
            difficulty: None,
            tags: Vec::new(),
            cuisine: None,
            tips: Vec::new(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_empty_edit_is_empty_update() {
        assert!(edit().into_update().unwrap().is_empty());
    }

    #[test]
    fn test_edit_rejects_unknown_difficulty() {
        let e = RecipeEdit {
            difficulty: Some("impossible".to_string()),
            ..edit()
        };
        assert!(e.into_update().is_err());
    }

    #[test]
    fn test_adapt_keeps_lineage() {
        let db = Database::open_in_memory().unwrap();
        let original = db
            .create_recipe(&NewRecipe {
                tags: BTreeSet::from(["dinner".to_string()]),
                is_favorite: true,
                ..NewRecipe::titled("Carbonara")
            })
            .unwrap();

        let update = RecipeEdit {
            tags: vec!["vegan".to_string()],
            ..edit()
        }
        .into_update()
        .unwrap();
        let adapted = db.create_recipe(&adaptation_of(&original, &update)).unwrap();

        assert_eq!(adapted.title, "Carbonara (adapted)");
        assert!(adapted.is_adapted);
        assert!(!adapted.is_favorite);
        assert_eq!(adapted.original_recipe_id.as_deref(), Some(original.id.as_str()));
        assert_eq!(adapted.tags, BTreeSet::from(["vegan".to_string()]));
        assert!(adapted.adapted_at.is_some());
    }
}
