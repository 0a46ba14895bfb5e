//! Integrity diagnostic: a fixed battery of probes against the storage root
//! and an open store, reported as structured data for a debug screen or the
//! `doctor` command.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::models::EntityKind;
use crate::paths::owning_store_name;

pub const PROBE_STORAGE_ROOT: &str = "storage_root";
pub const PROBE_RECORD_COUNTS: &str = "record_counts";
pub const PROBE_WRITE_READ: &str = "write_read";
pub const PROBE_CLOSE_REOPEN: &str = "close_reopen";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Success,
    Warning,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub test: String,
    pub status: ProbeStatus,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    fn new(test: &str, status: ProbeStatus, started: Option<Instant>) -> Self {
        let duration_ms = started.map_or(0, |s| {
            u64::try_from(s.elapsed().as_millis()).unwrap_or(u64::MAX)
        });
        Self {
            test: test.to_string(),
            status,
            duration_ms,
            data: None,
            error: None,
        }
    }

    fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    fn skipped(test: &str, why: &str) -> Self {
        Self::new(test, ProbeStatus::Skipped, None).with_error(why)
    }
}

/// Issue kinds in priority order, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// A record did not survive a full close and reopen.
    PersistenceLost,
    ReopenFailed,
    WriteReadFailed,
    StoreUnavailable,
    StorageRootUnreadable,
    OrphanedArtifacts,
}

impl IssueKind {
    pub const ALL: [IssueKind; 6] = [
        IssueKind::PersistenceLost,
        IssueKind::ReopenFailed,
        IssueKind::WriteReadFailed,
        IssueKind::StoreUnavailable,
        IssueKind::StorageRootUnreadable,
        IssueKind::OrphanedArtifacts,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub message: String,
}

const PATH_STABILITY: &str = "Verify path stability: the store must resolve to the same file under \
     the persistent documents root on every launch, never a cache or temporary directory.";

pub const HEALTHY: &str = "Persistence is working: records survive a full close and reopen.";

pub const RECOMMENDATIONS: &[(IssueKind, &[&str])] = &[
    (
        IssueKind::PersistenceLost,
        &[
            PATH_STABILITY,
            "Make sure nothing deletes or replaces the store file while the app is running.",
        ],
    ),
    (
        IssueKind::ReopenFailed,
        &[
            PATH_STABILITY,
            "Check whether another process holds the store lock, then run the diagnostic again.",
        ],
    ),
    (
        IssueKind::WriteReadFailed,
        &[
            "Check free disk space and that the store file is writable.",
            "If writes keep failing after a restart, the store file may be damaged; back it up and reinitialize.",
        ],
    ),
    (
        IssueKind::StoreUnavailable,
        &["Initialize the store first; the initialization error names the cause."],
    ),
    (
        IssueKind::StorageRootUnreadable,
        &["Verify storage permissions for the documents directory."],
    ),
    (
        IssueKind::OrphanedArtifacts,
        &["Remove orphaned lock and journal files while the app is closed."],
    ),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub timestamp: String,
    pub store_path: Option<String>,
    pub schema_version: Option<u32>,
    pub diagnostics: Vec<ProbeResult>,
    pub issues: Vec<Issue>,
    pub recommendations: Vec<String>,
}

impl DiagnosticReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }

    #[must_use]
    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    #[must_use]
    pub fn probe(&self, test: &str) -> Option<&ProbeResult> {
        self.diagnostics.iter().find(|p| p.test == test)
    }
}

#[derive(Default)]
struct Findings {
    diagnostics: Vec<ProbeResult>,
    issues: Vec<Issue>,
}

impl Findings {
    fn record(&mut self, result: ProbeResult) {
        self.diagnostics.push(result);
    }

    fn raise(&mut self, kind: IssueKind, message: impl Into<String>) {
        self.issues.push(Issue {
            kind,
            message: message.into(),
        });
    }
}

/// Run every probe in order. The only side effects are the probes' own
/// throwaway records, which are removed before returning, and a full
/// reopen of `store`.
pub fn run_diagnostic(store: Option<&mut Database>, root: Option<&Path>) -> DiagnosticReport {
    let mut findings = Findings::default();

    probe_storage_root(&mut findings, root);

    let (store_path, schema_version) = match store {
        Some(store) => {
            probe_record_counts(&mut findings, store);
            probe_write_read(&mut findings, store);
            probe_close_reopen(&mut findings, store);
            (
                store.path().map(|p| p.display().to_string()),
                store.schema_version().ok(),
            )
        }
        None => {
            let why = "no store is open";
            findings.record(ProbeResult::skipped(PROBE_RECORD_COUNTS, why));
            findings.record(ProbeResult::skipped(PROBE_WRITE_READ, why));
            findings.record(ProbeResult::skipped(PROBE_CLOSE_REOPEN, why));
            findings.raise(
                IssueKind::StoreUnavailable,
                "the local store is not open, so store probes were skipped",
            );
            (None, None)
        }
    };

    let Findings {
        diagnostics,
        mut issues,
    } = findings;
    issues.sort_by_key(|i| i.kind);
    let recommendations = recommendations_for(&issues);

    if issues.is_empty() {
        info!("diagnostic passed");
    } else {
        warn!(issues = issues.len(), top = ?issues[0].kind, "diagnostic found issues");
    }

    DiagnosticReport {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        store_path,
        schema_version,
        diagnostics,
        issues,
        recommendations,
    }
}

/// Deduplicated advice for `issues`, in issue priority order.
#[must_use]
pub fn recommendations_for(issues: &[Issue]) -> Vec<String> {
    if issues.is_empty() {
        return vec![HEALTHY.to_string()];
    }
    let mut out: Vec<String> = Vec::new();
    for issue in issues {
        let advice = RECOMMENDATIONS
            .iter()
            .find(|(kind, _)| *kind == issue.kind)
            .map_or(&[][..], |(_, advice)| *advice);
        for line in advice {
            if !out.iter().any(|existing| existing == line) {
                out.push((*line).to_string());
            }
        }
    }
    out
}

// --- Probe 1: storage root ---

struct RootScan {
    files: Vec<Value>,
    orphans: Vec<String>,
}

fn lock_is_held(path: &Path) -> bool {
    match OpenOptions::new().write(true).open(path) {
        Ok(file) => fs2::FileExt::try_lock_exclusive(&file).is_err(),
        Err(_) => false,
    }
}

fn scan_root(root: &Path) -> io::Result<RootScan> {
    let mut entries: Vec<(String, u64, bool)> = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        entries.push((
            entry.file_name().to_string_lossy().into_owned(),
            meta.len(),
            meta.is_dir(),
        ));
    }
    entries.sort();

    let mut orphans = Vec::new();
    for (name, _, is_dir) in &entries {
        if *is_dir {
            continue;
        }
        if let Some(store_name) = owning_store_name(name) {
            let owner_missing = !root.join(store_name).exists();
            let unheld_lock = name.ends_with(".lock") && !lock_is_held(&root.join(name));
            if owner_missing || unheld_lock {
                orphans.push(name.clone());
            }
        }
    }

    let files = entries
        .into_iter()
        .map(|(name, size, is_dir)| json!({ "name": name, "size": size, "is_dir": is_dir }))
        .collect();
    Ok(RootScan { files, orphans })
}

fn probe_storage_root(findings: &mut Findings, root: Option<&Path>) {
    let started = Instant::now();
    let Some(root) = root else {
        findings.record(
            ProbeResult::new(PROBE_STORAGE_ROOT, ProbeStatus::Error, Some(started))
                .with_error("no persistent documents root is available"),
        );
        findings.raise(
            IssueKind::StorageRootUnreadable,
            "the platform did not provide a persistent documents root",
        );
        return;
    };

    match scan_root(root) {
        Ok(scan) => {
            let status = if scan.orphans.is_empty() {
                ProbeStatus::Success
            } else {
                ProbeStatus::Warning
            };
            if !scan.orphans.is_empty() {
                findings.raise(
                    IssueKind::OrphanedArtifacts,
                    format!("orphaned store artifacts: {}", scan.orphans.join(", ")),
                );
            }
            findings.record(
                ProbeResult::new(PROBE_STORAGE_ROOT, status, Some(started)).with_data(json!({
                    "root": root.display().to_string(),
                    "files": scan.files,
                    "orphans": scan.orphans,
                })),
            );
        }
        Err(e) => {
            findings.record(
                ProbeResult::new(PROBE_STORAGE_ROOT, ProbeStatus::Error, Some(started))
                    .with_error(e.to_string()),
            );
            findings.raise(
                IssueKind::StorageRootUnreadable,
                format!("cannot read {}: {e}", root.display()),
            );
        }
    }
}

// --- Probe 2: record counts ---

fn probe_record_counts(findings: &mut Findings, store: &Database) {
    let started = Instant::now();
    let mut counts = Map::new();
    for kind in EntityKind::ALL {
        match store.count(kind) {
            Ok(n) => {
                counts.insert(kind.as_str().to_string(), json!(n));
            }
            Err(e) => {
                findings.record(
                    ProbeResult::new(PROBE_RECORD_COUNTS, ProbeStatus::Error, Some(started))
                        .with_error(e.to_string()),
                );
                findings.raise(
                    IssueKind::WriteReadFailed,
                    format!("could not count {kind} records: {e}"),
                );
                return;
            }
        }
    }
    // Zero counts are informational only.
    findings.record(
        ProbeResult::new(PROBE_RECORD_COUNTS, ProbeStatus::Success, Some(started))
            .with_data(Value::Object(counts)),
    );
}

// --- Probe 3: write, read, delete ---

fn roundtrip(store: &Database, kind: EntityKind) -> Result<(), String> {
    let id = format!("__diagnostic_{}", Uuid::new_v4());
    store
        .insert_probe(kind, &id)
        .map_err(|e| format!("write failed: {e}"))?;
    let found = store.probe_exists(kind, &id);
    let deleted = store.remove_untracked(kind, &id);
    match found {
        Ok(true) => {}
        Ok(false) => return Err("record missing right after write".to_string()),
        Err(e) => return Err(format!("read failed: {e}")),
    }
    match deleted {
        Ok(true) => Ok(()),
        Ok(false) => Err("delete removed nothing".to_string()),
        Err(e) => Err(format!("delete failed: {e}")),
    }
}

fn probe_write_read(findings: &mut Findings, store: &Database) {
    let started = Instant::now();
    let mut results = Map::new();
    let mut failures = Vec::new();
    for kind in EntityKind::ALL {
        match roundtrip(store, kind) {
            Ok(()) => {
                results.insert(kind.as_str().to_string(), json!("ok"));
            }
            Err(e) => {
                results.insert(kind.as_str().to_string(), json!("failed"));
                failures.push(format!("{kind}: {e}"));
            }
        }
    }

    let result = if failures.is_empty() {
        ProbeResult::new(PROBE_WRITE_READ, ProbeStatus::Success, Some(started))
    } else {
        let message = failures.join("; ");
        findings.raise(IssueKind::WriteReadFailed, message.clone());
        ProbeResult::new(PROBE_WRITE_READ, ProbeStatus::Error, Some(started)).with_error(message)
    };
    findings.record(result.with_data(Value::Object(results)));
}

// --- Probe 4: close and reopen ---

fn probe_close_reopen(findings: &mut Findings, store: &mut Database) {
    if store.path().is_none() {
        findings.record(ProbeResult::skipped(
            PROBE_CLOSE_REOPEN,
            "in-memory store; durability cannot be checked",
        ));
        return;
    }

    let started = Instant::now();
    let tag = format!("__persistence_{}", Uuid::new_v4());
    let written = store.insert_probe(EntityKind::Recipe, &tag);

    if let Err(e) = store.reopen() {
        // The original connection is still in place; drop the tagged row from it.
        if written.is_ok() {
            if let Err(cleanup) = store.remove_untracked(EntityKind::Recipe, &tag) {
                warn!(tag = %tag, error = %cleanup, "could not remove persistence probe record");
            }
        }
        let message = format!("store could not be reopened: {e}");
        findings.raise(IssueKind::ReopenFailed, message.clone());
        findings.record(
            ProbeResult::new(PROBE_CLOSE_REOPEN, ProbeStatus::Error, Some(started))
                .with_error(message),
        );
        return;
    }

    let found = store.probe_exists(EntityKind::Recipe, &tag);
    if let Err(e) = store.remove_untracked(EntityKind::Recipe, &tag) {
        warn!(tag = %tag, error = %e, "could not remove persistence probe record");
    }

    let failure = match (written, found) {
        (Ok(()), Ok(true)) => None,
        (Err(e), _) => Some(format!("tagged write failed before close: {e}")),
        (Ok(()), Ok(false)) => Some("tagged record was missing after reopen".to_string()),
        (Ok(()), Err(e)) => Some(format!("could not read tagged record after reopen: {e}")),
    };

    let result = ProbeResult::new(
        PROBE_CLOSE_REOPEN,
        if failure.is_some() {
            ProbeStatus::Error
        } else {
            ProbeStatus::Success
        },
        Some(started),
    )
    .with_data(json!({ "tag": tag }));

    match failure {
        Some(message) => {
            findings.raise(IssueKind::PersistenceLost, message.clone());
            findings.record(result.with_error(message));
        }
        None => findings.record(result),
    }
}
