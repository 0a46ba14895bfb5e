mod commands;
mod config;
mod remote;

use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{
    PrefsArgs, RecipeArgs, RecipeEdit, SyncMode, cmd_doctor, cmd_prefs_set, cmd_prefs_show,
    cmd_recipe_adapt, cmd_recipe_add, cmd_recipe_delete, cmd_recipe_favorite, cmd_recipe_list,
    cmd_recipe_show, cmd_recipe_update, cmd_status, cmd_sync,
};
use crate::config::Config;
use crate::remote::HttpRemote;
use recipetuner_core::init::{FileStoreOpener, InitConfig, InitController, SharedStore};
use recipetuner_core::models::RecipeFilter;
use recipetuner_core::remote::StaticSession;
use recipetuner_core::sync::{SyncConfig, SyncEngine};

#[derive(Parser)]
#[command(
    name = "recipetuner",
    version,
    about = "A local-first recipe manager with remote sync"
)]
struct Cli {
    /// Signed-in user id; required for preferences and sync
    #[arg(long, global = true, env = "RECIPETUNER_USER")]
    user: Option<String>,
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store state, path, schema version and record counts
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage local recipes
    Recipe {
        #[command(subcommand)]
        command: RecipeCommands,
    },
    /// Manage dietary preferences for the signed-in user
    Prefs {
        #[command(subcommand)]
        command: PrefsCommands,
    },
    /// Exchange data with the remote store
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
    /// Check that data written to the store survives a close and reopen
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    /// Create a recipe
    Add {
        #[command(flatten)]
        recipe: RecipeArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recipes, newest first
    List {
        /// Only favorites
        #[arg(long)]
        favorites: bool,
        /// Only adapted recipes
        #[arg(long)]
        adapted: bool,
        /// Only recipes carrying this tag
        #[arg(long)]
        tag: Option<String>,
        /// Case-insensitive title search
        #[arg(short, long)]
        search: Option<String>,
        /// Only adaptations of this recipe id
        #[arg(long, value_name = "ID")]
        original: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a recipe with ingredients and steps
    Show {
        /// Recipe id
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change fields of a recipe
    Update {
        /// Recipe id
        id: String,
        #[command(flatten)]
        edit: RecipeEdit,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a recipe
    Delete {
        /// Recipe id
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark a recipe as favorite
    Favorite {
        /// Recipe id
        id: String,
        /// Remove the favorite mark instead
        #[arg(long)]
        off: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create an adapted copy of an existing recipe
    Adapt {
        /// Id of the recipe to adapt
        id: String,
        #[command(flatten)]
        edit: RecipeEdit,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum PrefsCommands {
    /// Show the stored preferences
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replace preferences; omitted options keep their stored value
    Set {
        #[command(flatten)]
        prefs: PrefsArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Push local preferences and changed recipes
    Push {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pull remote preferences and recipes (newer wins)
    Pull {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Read local preferences and push pending changes in the background
    Load {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push then pull everything
    All {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "recipetuner=debug,recipetuner_core=debug"
    } else {
        "recipetuner=info,recipetuner_core=info"
    };
    let filter =
        EnvFilter::try_from_env("RECIPETUNER_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

/// Open the store, letting Ctrl-C abort a pending retry.
async fn open_store(controller: &Arc<InitController>) -> Result<SharedStore> {
    let interrupt = {
        let controller = Arc::clone(controller);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                controller.cancel();
            }
        })
    };
    let result = controller.initialize().await;
    interrupt.abort();
    result.context("Could not open the local store")
}

fn lock(store: &SharedStore) -> std::sync::MutexGuard<'_, recipetuner_core::db::Database> {
    store
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let opener = FileStoreOpener::new(Config::store_path());
    let controller = Arc::new(InitController::new(
        Arc::new(opener),
        InitConfig::default(),
    ));

    if let Commands::Doctor { json } = cli.command {
        // The report is useful precisely when the store will not open.
        let store = match open_store(&controller).await {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::warn!("{e:#}");
                None
            }
        };
        let mut guard = store.as_ref().map(lock);
        return cmd_doctor(guard.as_deref_mut(), &config.data_dir, json);
    }

    let store = open_store(&controller).await?;
    let user = cli.user;

    match cli.command {
        Commands::Doctor { .. } => Ok(()),
        Commands::Status { json } => cmd_status(&controller, &lock(&store), json),
        Commands::Recipe { command } => {
            let db = lock(&store);
            match command {
                RecipeCommands::Add { recipe, json } => cmd_recipe_add(&db, recipe, json),
                RecipeCommands::List {
                    favorites,
                    adapted,
                    tag,
                    search,
                    original,
                    json,
                } => {
                    let filter = RecipeFilter {
                        favorites_only: favorites,
                        adapted_only: adapted,
                        tag,
                        search,
                        original_recipe_id: original,
                    };
                    cmd_recipe_list(&db, &filter, json)
                }
                RecipeCommands::Show { id, json } => cmd_recipe_show(&db, &id, json),
                RecipeCommands::Update { id, edit, json } => {
                    cmd_recipe_update(&db, &id, edit, json)
                }
                RecipeCommands::Delete { id, json } => cmd_recipe_delete(&db, &id, json),
                RecipeCommands::Favorite { id, off, json } => {
                    cmd_recipe_favorite(&db, &id, !off, json)
                }
                RecipeCommands::Adapt { id, edit, json } => cmd_recipe_adapt(&db, &id, edit, json),
            }
        }
        Commands::Prefs { command } => {
            let user = user.context("No user given. Pass --user or set RECIPETUNER_USER")?;
            let db = lock(&store);
            match command {
                PrefsCommands::Show { json } => cmd_prefs_show(&db, &user, json),
                PrefsCommands::Set { prefs, json } => cmd_prefs_set(&db, &user, prefs, json),
            }
        }
        Commands::Sync { command } => {
            let user = user.context("No user given. Pass --user or set RECIPETUNER_USER")?;
            let remote_config = config.remote.as_ref().context(
                "Remote sync is not configured. Set RECIPETUNER_REMOTE_URL and RECIPETUNER_REMOTE_KEY",
            )?;
            let remote = HttpRemote::new(remote_config)?;
            let engine = SyncEngine::new(
                Arc::clone(&controller),
                remote,
                StaticSession::signed_in(&user),
                SyncConfig {
                    request_timeout: remote_config.timeout,
                },
            );
            let (mode, json) = match command {
                SyncCommands::Push { json } => (SyncMode::Push, json),
                SyncCommands::Pull { json } => (SyncMode::Pull, json),
                SyncCommands::Load { json } => (SyncMode::Load, json),
                SyncCommands::All { json } => (SyncMode::All, json),
            };
            drop(store);
            cmd_sync(&engine, &user, mode, json).await
        }
    }
}
