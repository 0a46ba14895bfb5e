use std::process;

use anyhow::Result;
use serde::Serialize;

use recipetuner_core::models::UserPreferences;
use recipetuner_core::remote::{RemoteStore, SessionProvider};
use recipetuner_core::sync::{SyncEngine, SyncReport};

use super::helpers::print_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncMode {
    Push,
    Pull,
    Load,
    All,
}

/// Fold per-step reports, stopping at the first failure.
fn combine(first: SyncReport, second: Option<SyncReport>) -> SyncReport {
    if !first.success {
        return first;
    }
    match second {
        None => first,
        Some(next) => SyncReport {
            pushed: first.pushed + next.pushed,
            pulled: first.pulled + next.pulled,
            ..next
        },
    }
}

fn print_report(label: &str, report: &SyncReport) {
    if report.success {
        println!(
            "{label}: pushed {}, pulled {}",
            report.pushed, report.pulled
        );
    } else {
        let reason = report
            .reason
            .and_then(|r| serde_json::to_value(r).ok())
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        eprintln!(
            "{label} failed ({reason}): {}",
            report.message.as_deref().unwrap_or("unknown error")
        );
        eprintln!("Local data is unchanged; it will sync on a later attempt.");
    }
}

#[derive(Serialize)]
struct LoadOutput<'a> {
    preferences: Option<&'a UserPreferences>,
    report: &'a SyncReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    background_push: Option<&'a SyncReport>,
}

pub(crate) async fn cmd_sync<R: RemoteStore, S: SessionProvider>(
    engine: &SyncEngine<R, S>,
    user_id: &str,
    mode: SyncMode,
    json: bool,
) -> Result<()> {
    let report = match mode {
        SyncMode::Push => {
            let prefs = engine.push_preferences(user_id).await;
            let recipes = if prefs.success {
                Some(engine.push_recipes(user_id).await)
            } else {
                None
            };
            combine(prefs, recipes)
        }
        SyncMode::Pull => {
            let prefs = engine.pull_preferences(user_id).await;
            let recipes = if prefs.success {
                Some(engine.pull_recipes(user_id).await)
            } else {
                None
            };
            combine(prefs, recipes)
        }
        SyncMode::All => engine.sync_all(user_id).await,
        SyncMode::Load => {
            let outcome = engine.pull_and_merge_on_load(user_id);
            // The process would exit before a detached push finished.
            let push = match outcome.background_push {
                Some(handle) => handle.await.ok(),
                None => None,
            };
            if json {
                print_json(&LoadOutput {
                    preferences: outcome.preferences.as_ref(),
                    report: &outcome.report,
                    background_push: push.as_ref(),
                })?;
            } else {
                match &outcome.preferences {
                    Some(p) => println!(
                        "Loaded preferences for {} (updated {})",
                        p.user_id, p.updated_at
                    ),
                    None if outcome.report.success => {
                        println!("No local preferences for {user_id}");
                    }
                    None => print_report("Load", &outcome.report),
                }
                if let Some(ref push) = push {
                    print_report("Background push", push);
                }
            }
            if !outcome.report.success {
                process::exit(2);
            }
            return Ok(());
        }
    };

    if json {
        print_json(&report)?;
    } else {
        print_report("Sync", &report);
    }
    if !report.success {
        process::exit(2);
    }
    Ok(())
}
