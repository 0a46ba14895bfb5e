use std::collections::BTreeSet;
use std::fmt::Write;
use std::process;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use recipetuner_core::models::{Ingredient, Recipe, RecordOrigin};

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

/// Report a missing record and exit with status 2.
pub(crate) fn not_found(what: &str, json: bool) -> ! {
    if json {
        println!("{}", json_error(what));
    } else {
        eprintln!("{what}");
    }
    process::exit(2);
}

/// Parse `name[:amount[:unit]]`, e.g. `flour:200:g` or `eggs:3`.
pub(crate) fn parse_ingredient(s: &str) -> Result<Ingredient> {
    let mut parts = s.splitn(3, ':').map(str::trim);
    let name = parts.next().unwrap_or_default();
    if name.is_empty() {
        bail!("Invalid ingredient '{s}'. Use 'name[:amount[:unit]]'");
    }
    let amount = match parts.next().filter(|a| !a.is_empty()) {
        None => None,
        Some(a) => {
            let value: f64 = a
                .parse()
                .with_context(|| format!("Invalid amount '{a}' in ingredient '{s}'"))?;
            if value <= 0.0 {
                bail!("Ingredient amount must be greater than 0");
            }
            Some(value)
        }
    };
    let unit = parts.next().filter(|u| !u.is_empty());
    Ok(Ingredient::new(name, amount, unit))
}

pub(crate) fn parse_ingredients(items: &[String]) -> Result<Vec<Ingredient>> {
    items.iter().map(|s| parse_ingredient(s)).collect()
}

pub(crate) fn format_ingredient(i: &Ingredient) -> String {
    let mut out = String::new();
    if let Some(amount) = i.amount {
        let _ = write!(out, "{amount} ");
    }
    if let Some(ref unit) = i.unit {
        out.push_str(unit);
        out.push(' ');
    }
    out.push_str(&i.name);
    if i.optional {
        out.push_str(" (optional)");
    }
    out
}

pub(crate) fn join_set(values: &BTreeSet<String>) -> String {
    if values.is_empty() {
        "-".to_string()
    } else {
        values.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

pub(crate) fn sync_label(recipe: &Recipe) -> &'static str {
    if recipe.sync.dirty {
        "pending"
    } else if recipe.sync.origin == RecordOrigin::Remote {
        "pulled"
    } else {
        "synced"
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

pub(crate) fn print_recipe_table(recipes: &[Recipe]) {
    #[derive(Tabled)]
    struct RecipeRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Title")]
        title: String,
        #[tabled(rename = "Time")]
        time: String,
        #[tabled(rename = "Difficulty")]
        difficulty: String,
        #[tabled(rename = "Tags")]
        tags: String,
        #[tabled(rename = "Fav")]
        favorite: String,
        #[tabled(rename = "Sync")]
        sync: String,
    }

    let rows: Vec<RecipeRow> = recipes
        .iter()
        .map(|r| RecipeRow {
            id: short_id(&r.id).to_string(),
            title: truncate(
                &if r.is_adapted {
                    format!("{} (adapted)", r.title)
                } else {
                    r.title.clone()
                },
                40,
            ),
            time: r
                .total_time_min()
                .map_or("-".into(), |m| format!("{m} min")),
            difficulty: r.difficulty.map_or("-".into(), |d| d.to_string()),
            tags: truncate(&join_set(&r.tags), 30),
            favorite: if r.is_favorite { "*".into() } else { String::new() },
            sync: sync_label(r).to_string(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..3)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}
