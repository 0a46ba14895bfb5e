use std::path::Path;
use std::process;

use anyhow::Result;
use tabled::{Table, Tabled, settings::Style};

use recipetuner_core::db::Database;
use recipetuner_core::diagnostic::{ProbeStatus, run_diagnostic};

use super::helpers::{print_json, truncate};

pub(crate) fn cmd_doctor(store: Option<&mut Database>, root: &Path, json: bool) -> Result<()> {
    let report = run_diagnostic(store, Some(root));

    if json {
        print_json(&report)?;
        if !report.is_healthy() {
            process::exit(2);
        }
        return Ok(());
    }

    #[derive(Tabled)]
    struct ProbeRow {
        #[tabled(rename = "Check")]
        test: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "ms")]
        duration: u64,
        #[tabled(rename = "Detail")]
        detail: String,
    }

    let rows: Vec<ProbeRow> = report
        .diagnostics
        .iter()
        .map(|p| ProbeRow {
            test: p.test.clone(),
            status: match p.status {
                ProbeStatus::Success => "ok".to_string(),
                ProbeStatus::Warning => "warning".to_string(),
                ProbeStatus::Error => "ERROR".to_string(),
                ProbeStatus::Skipped => "skipped".to_string(),
            },
            duration: p.duration_ms,
            detail: truncate(
                &p.error
                    .clone()
                    .or_else(|| p.data.as_ref().map(ToString::to_string))
                    .unwrap_or_default(),
                60,
            ),
        })
        .collect();

    println!(
        "Store: {}",
        report.store_path.as_deref().unwrap_or("(not open)")
    );
    if let Some(v) = report.schema_version {
        println!("Schema version: {v}");
    }
    println!("{}", Table::new(&rows).with(Style::rounded()));

    for issue in &report.issues {
        println!("Issue: {}", issue.message);
    }
    println!();
    for line in &report.recommendations {
        println!("- {line}");
    }
    if !report.is_healthy() {
        process::exit(2);
    }
    Ok(())
}
