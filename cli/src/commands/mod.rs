mod doctor;
mod helpers;
mod prefs;
mod recipe;
mod status;
mod sync;

pub(crate) use doctor::cmd_doctor;
pub(crate) use prefs::{PrefsArgs, cmd_prefs_set, cmd_prefs_show};
pub(crate) use recipe::{
    RecipeArgs, RecipeEdit, cmd_recipe_adapt, cmd_recipe_add, cmd_recipe_delete,
    cmd_recipe_favorite, cmd_recipe_list, cmd_recipe_show, cmd_recipe_update,
};
pub(crate) use status::cmd_status;
pub(crate) use sync::{SyncMode, cmd_sync};
