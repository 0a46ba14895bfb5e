//! Reconciles the local store with the remote store.
//!
//! The local store stays the source of truth: every entry point reports
//! failures as a [`SyncReport`] instead of an error, so a failed sync only
//! degrades the app to local-only operation. Conflicts are last-writer-wins
//! by `updated_at`, with no field-level merge.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{RemoteError, StoreError, SyncError};
use crate::init::{InitController, SharedStore};
use crate::models::UserPreferences;
use crate::remote::{RemotePreferences, RemoteRecipe, RemoteStore, SessionProvider};

#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Remote calls slower than this are treated as `RemoteUnavailable`.
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncFailure {
    NotReady,
    RemoteUnavailable,
    RemoteRejected,
    LocalStore,
}

impl From<&SyncError> for SyncFailure {
    fn from(err: &SyncError) -> Self {
        match err {
            SyncError::NotReady(_) => SyncFailure::NotReady,
            SyncError::RemoteUnavailable(_) => SyncFailure::RemoteUnavailable,
            SyncError::RemoteRejected(_) => SyncFailure::RemoteRejected,
            SyncError::Local(_) => SyncFailure::LocalStore,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SyncFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub pushed: usize,
    pub pulled: usize,
}

impl SyncReport {
    fn finish(result: Result<(), SyncError>, counts: Counts) -> Self {
        match result {
            Ok(()) => Self {
                success: true,
                reason: None,
                message: None,
                pushed: counts.pushed,
                pulled: counts.pulled,
            },
            Err(err) => {
                match &err {
                    SyncError::NotReady(why) => debug!(why, "sync skipped"),
                    other => warn!(error = %other, "sync failed; continuing with local data"),
                }
                Self {
                    success: false,
                    reason: Some(SyncFailure::from(&err)),
                    message: Some(err.to_string()),
                    pushed: counts.pushed,
                    pulled: counts.pulled,
                }
            }
        }
    }

    /// Whether trying again later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.reason,
            Some(SyncFailure::RemoteUnavailable | SyncFailure::NotReady)
        )
    }
}

/// Result of reading preferences at load time.
#[derive(Debug)]
pub struct LoadOutcome {
    pub preferences: Option<UserPreferences>,
    /// Outcome of the local read only.
    pub report: SyncReport,
    /// The best-effort push scheduled after the read, if any. Awaiting it is
    /// optional; its failures are only logged.
    pub background_push: Option<JoinHandle<SyncReport>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    pushed: usize,
    pulled: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `f` against the store. The lock is never held across an await.
fn with_store<T>(
    store: &SharedStore,
    f: impl FnOnce(&Database) -> Result<T, StoreError>,
) -> Result<T, SyncError> {
    let db = lock(store);
    Ok(f(&db)?)
}

/// RFC 3339 comparison, falling back to plain string order.
fn is_newer(candidate: &str, current: &str) -> bool {
    match (
        DateTime::parse_from_rfc3339(candidate),
        DateTime::parse_from_rfc3339(current),
    ) {
        (Ok(a), Ok(b)) => a > b,
        _ => candidate > current,
    }
}

struct Inner<R, S> {
    controller: Arc<InitController>,
    remote: R,
    session: S,
    config: SyncConfig,
    background: Mutex<Vec<AbortHandle>>,
}

impl<R: RemoteStore, S: SessionProvider> Inner<R, S> {
    fn ready(&self, user_id: &str) -> Result<SharedStore, SyncError> {
        let store = self
            .controller
            .store()
            .ok_or(SyncError::NotReady("local store is not ready"))?;
        match self.session.current_user_id() {
            Some(current) if current == user_id => Ok(store),
            Some(_) => Err(SyncError::NotReady("signed-in user does not match")),
            None => Err(SyncError::NotReady("no signed-in user")),
        }
    }

    async fn call<T>(
        &self,
        what: &'static str,
        request: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, SyncError> {
        match tokio::time::timeout(self.config.request_timeout, request).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::RemoteUnavailable(format!(
                "{what} timed out after {}s",
                self.config.request_timeout.as_secs()
            ))),
        }
    }

    /// Run `f` against the ready store. The handle is dropped on return and
    /// is never held across a remote call.
    fn with_ready<T>(
        &self,
        user_id: &str,
        f: impl FnOnce(&Database) -> Result<T, StoreError>,
    ) -> Result<T, SyncError> {
        let store = self.ready(user_id)?;
        with_store(&store, f)
    }

    async fn push_preferences(&self, user_id: &str, counts: &mut Counts) -> Result<(), SyncError> {
        let Some(local) = self.with_ready(user_id, |db| db.get_preferences(user_id))? else {
            debug!(user_id, "no local preferences to push");
            return Ok(());
        };
        let payload = RemotePreferences::from_local(&local);
        self.call(
            "upsert preferences",
            self.remote.upsert_preferences(user_id, &payload),
        )
        .await?;
        self.with_ready(user_id, |db| {
            db.mark_preferences_synced(user_id, &local.updated_at)
        })?;
        counts.pushed += 1;
        info!(user_id, "preferences pushed");
        Ok(())
    }

    async fn pull_preferences(&self, user_id: &str, counts: &mut Counts) -> Result<(), SyncError> {
        self.ready(user_id)?;
        let Some(remote) = self
            .call("get preferences", self.remote.get_preferences(user_id))
            .await?
        else {
            debug!(user_id, "no remote preferences");
            return Ok(());
        };
        if remote.user_id != user_id {
            return Err(SyncError::RemoteRejected(
                "remote returned preferences for a different user".to_string(),
            ));
        }

        let pulled = self.with_ready(user_id, |db| {
            let local = db.get_preferences(user_id)?;
            let adopt = local
                .as_ref()
                .is_none_or(|l| is_newer(&remote.updated_at, &l.updated_at));
            if !adopt {
                debug!(user_id, "local preferences are current");
                return Ok(false);
            }
            db.apply_remote_preferences(&remote.into_local())?;
            Ok(true)
        })?;
        if pulled {
            counts.pulled += 1;
            info!(user_id, "preferences pulled");
        }
        Ok(())
    }

    async fn push_recipes(&self, user_id: &str, counts: &mut Counts) -> Result<(), SyncError> {
        let deletes = self.with_ready(user_id, Database::pending_recipe_deletes)?;
        for tombstone in deletes {
            self.call(
                "delete recipe",
                self.remote
                    .delete_recipe(user_id, &tombstone.id, tombstone.remote_id.as_deref()),
            )
            .await?;
            self.with_ready(user_id, |db| db.mark_delete_pushed(&tombstone.id))?;
            counts.pushed += 1;
            debug!(id = %tombstone.id, "recipe delete pushed");
        }

        let pending = self.with_ready(user_id, Database::dirty_recipes)?;
        for recipe in pending {
            let row = RemoteRecipe::from_local(&recipe, user_id);
            let remote_id = match &recipe.sync.remote_id {
                Some(remote_id) => {
                    self.call("update recipe", self.remote.update_recipe(remote_id, &row))
                        .await?;
                    remote_id.clone()
                }
                None => {
                    self.call("upsert recipe", self.remote.upsert_recipe(user_id, &row))
                        .await?
                }
            };
            // False when the recipe was deleted meanwhile; its tombstone
            // removes the remote row on the next push.
            let marked = self.with_ready(user_id, |db| {
                db.mark_recipe_synced(&recipe.id, &remote_id, &recipe.updated_at)
            })?;
            if marked {
                counts.pushed += 1;
                debug!(id = %recipe.id, remote_id = %remote_id, "recipe pushed");
            }
        }
        Ok(())
    }

    async fn pull_recipes(&self, user_id: &str, counts: &mut Counts) -> Result<(), SyncError> {
        self.ready(user_id)?;
        let mut rows = self
            .call("list recipes", self.remote.list_recipes(user_id))
            .await?;
        // Originals before the recipes adapted from them.
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let pulled = self.with_ready(user_id, |db| {
            let mut pulled = 0;
            for row in rows {
                if row.user_id != user_id {
                    warn!(client_id = %row.client_id, "ignoring remote recipe owned by another user");
                    continue;
                }
                if db.is_tombstoned(&row.client_id, row.id.as_deref())? {
                    debug!(client_id = %row.client_id, "skipping remote recipe deleted locally");
                    continue;
                }
                let existing = match db.get_recipe(&row.client_id)? {
                    Some(found) => Some(found),
                    None => match row.id.as_deref() {
                        Some(remote_id) => db.find_recipe_by_remote_id(remote_id)?,
                        None => None,
                    },
                };

                let recipe = match existing {
                    None => row.into_local(None),
                    Some(local) if is_newer(&row.updated_at, &local.updated_at) => {
                        row.into_local(Some(local.id))
                    }
                    Some(local) => {
                        if let (None, Some(remote_id)) = (&local.sync.remote_id, &row.id) {
                            db.mark_recipe_synced(&local.id, remote_id, &row.updated_at)?;
                        }
                        debug!(id = %local.id, "local recipe is current");
                        continue;
                    }
                };

                match db.apply_remote_recipe(&recipe) {
                    Ok(()) => pulled += 1,
                    Err(StoreError::Validation { field, message }) => {
                        warn!(id = %recipe.id, field, %message, "skipping invalid remote recipe");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(pulled)
        })?;
        counts.pulled += pulled;
        if pulled > 0 {
            info!(user_id, pulled, "recipes pulled");
        }
        Ok(())
    }

    fn abort_background(&self) -> usize {
        let mut handles = lock(&self.background);
        let live = handles.iter().filter(|h| !h.is_finished()).count();
        for handle in handles.drain(..) {
            handle.abort();
        }
        live
    }
}

pub struct SyncEngine<R, S> {
    inner: Arc<Inner<R, S>>,
}

impl<R, S> Clone for SyncEngine<R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteStore, S: SessionProvider> SyncEngine<R, S> {
    pub fn new(controller: Arc<InitController>, remote: R, session: S, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                controller,
                remote,
                session,
                config,
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn remote(&self) -> &R {
        &self.inner.remote
    }

    pub fn session(&self) -> &S {
        &self.inner.session
    }

    pub fn controller(&self) -> &Arc<InitController> {
        &self.inner.controller
    }

    /// Overwrite the remote preferences row with the local record.
    pub async fn push_preferences(&self, user_id: &str) -> SyncReport {
        let mut counts = Counts::default();
        let result = self.inner.push_preferences(user_id, &mut counts).await;
        SyncReport::finish(result, counts)
    }

    /// Adopt the remote preferences when there is no local record or the
    /// remote one is newer.
    pub async fn pull_preferences(&self, user_id: &str) -> SyncReport {
        let mut counts = Counts::default();
        let result = self.inner.pull_preferences(user_id, &mut counts).await;
        SyncReport::finish(result, counts)
    }

    /// Read the local preferences and, if they carry unpushed changes and the
    /// user is signed in, push them in the background. The read never waits
    /// on the network and never fails because of it.
    pub fn pull_and_merge_on_load(&self, user_id: &str) -> LoadOutcome {
        let local = self
            .inner
            .controller
            .store()
            .ok_or(SyncError::NotReady("local store is not ready"))
            .and_then(|store| with_store(&store, |db| db.get_preferences(user_id)));

        let preferences = match local {
            Ok(preferences) => preferences,
            Err(err) => {
                return LoadOutcome {
                    preferences: None,
                    report: SyncReport::finish(Err(err), Counts::default()),
                    background_push: None,
                };
            }
        };

        let signed_in = self.inner.session.current_user_id().as_deref() == Some(user_id);
        let needs_push = preferences.as_ref().is_some_and(|p| p.sync.dirty);
        let background_push = (signed_in && needs_push).then(|| self.spawn_push(user_id));

        LoadOutcome {
            preferences,
            report: SyncReport::finish(Ok(()), Counts::default()),
            background_push,
        }
    }

    /// Send local recipe changes. Pending deletes go first, then new recipes
    /// are upserted by client id and known ones updated by remote id.
    pub async fn push_recipes(&self, user_id: &str) -> SyncReport {
        let mut counts = Counts::default();
        let result = self.inner.push_recipes(user_id, &mut counts).await;
        SyncReport::finish(result, counts)
    }

    /// Bring remote recipes into the local store. Newer remote versions win;
    /// local recipes missing remotely are kept and locally deleted ones stay
    /// deleted.
    pub async fn pull_recipes(&self, user_id: &str) -> SyncReport {
        let mut counts = Counts::default();
        let result = self.inner.pull_recipes(user_id, &mut counts).await;
        SyncReport::finish(result, counts)
    }

    /// Push then pull both entity kinds, stopping at the first failure.
    pub async fn sync_all(&self, user_id: &str) -> SyncReport {
        let mut counts = Counts::default();
        let result = async {
            self.inner.push_preferences(user_id, &mut counts).await?;
            self.inner.push_recipes(user_id, &mut counts).await?;
            self.inner.pull_preferences(user_id, &mut counts).await?;
            self.inner.pull_recipes(user_id, &mut counts).await
        }
        .await;
        SyncReport::finish(result, counts)
    }

    /// Stop background pushes whenever the session signs out. Local data is
    /// left untouched.
    pub fn watch_session(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let mut rx = self.inner.session.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let signed_out = rx.borrow_and_update().is_none();
                if !signed_out {
                    continue;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let aborted = inner.abort_background();
                info!(aborted, "signed out; sync stopped");
            }
        })
    }

    /// Abort every in-flight background push. Returns how many were live.
    pub fn abort_background(&self) -> usize {
        self.inner.abort_background()
    }

    fn spawn_push(&self, user_id: &str) -> JoinHandle<SyncReport> {
        let inner = Arc::clone(&self.inner);
        let user_id = user_id.to_string();
        let handle = tokio::spawn(async move {
            let mut counts = Counts::default();
            let result = inner.push_preferences(&user_id, &mut counts).await;
            let report = SyncReport::finish(result, counts);
            if !report.success {
                warn!(
                    user_id = %user_id,
                    reason = ?report.reason,
                    "background preferences push failed; local data is unaffected"
                );
            }
            report
        });
        let mut background = lock(&self.inner.background);
        background.retain(|h| !h.is_finished());
        background.push(handle.abort_handle());
        handle
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::OpenError;
    use crate::init::{InitConfig, StoreOpener};
    use crate::models::{NewPreferences, NewRecipe, RecordOrigin, RecipeUpdate};
    use crate::remote::StaticSession;

    const OLD: &str = "2020-01-01T00:00:00Z";
    const FUTURE: &str = "2999-01-01T00:00:00Z";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Up,
        Down,
        Reject,
        Hang,
        /// Writes land but the reply never arrives.
        LostReply,
    }

    struct MemoryRemote {
        mode: Mutex<Mode>,
        prefs: Mutex<HashMap<String, RemotePreferences>>,
        recipes: Mutex<Vec<RemoteRecipe>>,
        next_id: AtomicUsize,
        upserts: AtomicUsize,
        updates: AtomicUsize,
    }

    impl MemoryRemote {
        fn new(mode: Mode) -> Self {
            Self {
                mode: Mutex::new(mode),
                prefs: Mutex::new(HashMap::new()),
                recipes: Mutex::new(Vec::new()),
                next_id: AtomicUsize::new(1),
                upserts: AtomicUsize::new(0),
                updates: AtomicUsize::new(0),
            }
        }

        fn set_mode(&self, mode: Mode) {
            *self.mode.lock().unwrap() = mode;
        }

        async fn gate(&self) -> Result<(), RemoteError> {
            let mode = *self.mode.lock().unwrap();
            match mode {
                Mode::Up => Ok(()),
                Mode::Down => Err(RemoteError::Unavailable("connection refused".to_string())),
                Mode::Reject => Err(RemoteError::Rejected("row-level security".to_string())),
                Mode::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                Mode::LostReply => Ok(()),
            }
        }
    }

    impl RemoteStore for MemoryRemote {
        async fn get_preferences(
            &self,
            user_id: &str,
        ) -> Result<Option<RemotePreferences>, RemoteError> {
            self.gate().await?;
            Ok(self.prefs.lock().unwrap().get(user_id).cloned())
        }

        async fn upsert_preferences(
            &self,
            user_id: &str,
            prefs: &RemotePreferences,
        ) -> Result<(), RemoteError> {
            self.gate().await?;
            self.upserts.fetch_add(1, Ordering::SeqCst);
            self.prefs
                .lock()
                .unwrap()
                .insert(user_id.to_string(), prefs.clone());
            Ok(())
        }

        async fn list_recipes(&self, user_id: &str) -> Result<Vec<RemoteRecipe>, RemoteError> {
            self.gate().await?;
            Ok(self
                .recipes
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.user_id == user_id)
                .cloned()
                .collect())
        }

        async fn upsert_recipe(
            &self,
            user_id: &str,
            recipe: &RemoteRecipe,
        ) -> Result<String, RemoteError> {
            self.gate().await?;
            let id = {
                let mut rows = self.recipes.lock().unwrap();
                let existing = rows
                    .iter_mut()
                    .find(|r| r.user_id == user_id && r.client_id == recipe.client_id);
                match existing {
                    Some(row) => {
                        let id = row.id.clone().unwrap_or_default();
                        *row = RemoteRecipe {
                            id: Some(id.clone()),
                            ..recipe.clone()
                        };
                        id
                    }
                    None => {
                        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
                        rows.push(RemoteRecipe {
                            id: Some(id.clone()),
                            ..recipe.clone()
                        });
                        id
                    }
                }
            };
            let lost = *self.mode.lock().unwrap() == Mode::LostReply;
            if lost {
                std::future::pending::<()>().await;
            }
            Ok(id)
        }

        async fn update_recipe(
            &self,
            remote_id: &str,
            recipe: &RemoteRecipe,
        ) -> Result<(), RemoteError> {
            self.gate().await?;
            self.updates.fetch_add(1, Ordering::SeqCst);
            let mut rows = self.recipes.lock().unwrap();
            let row = rows
                .iter_mut()
                .find(|r| r.id.as_deref() == Some(remote_id))
                .ok_or_else(|| RemoteError::Rejected(format!("no row {remote_id}")))?;
            *row = RemoteRecipe {
                id: Some(remote_id.to_string()),
                ..recipe.clone()
            };
            Ok(())
        }

        async fn delete_recipe(
            &self,
            user_id: &str,
            client_id: &str,
            remote_id: Option<&str>,
        ) -> Result<(), RemoteError> {
            self.gate().await?;
            self.recipes.lock().unwrap().retain(|r| {
                let target = match remote_id {
                    Some(remote_id) => r.id.as_deref() == Some(remote_id),
                    None => r.client_id == client_id,
                };
                !(r.user_id == user_id && target)
            });
            Ok(())
        }
    }

    struct MemoryOpener;

    impl StoreOpener for MemoryOpener {
        fn open(&self) -> Result<Database, OpenError> {
            Database::open_in_memory()
        }
    }

    type Engine = SyncEngine<MemoryRemote, StaticSession>;

    async fn engine(mode: Mode, user: Option<&str>) -> Engine {
        let ctl = Arc::new(InitController::new(
            Arc::new(MemoryOpener),
            InitConfig::default(),
        ));
        ctl.initialize().await.unwrap();
        SyncEngine::new(
            ctl,
            MemoryRemote::new(mode),
            StaticSession::new(user.map(str::to_string)),
            SyncConfig::default(),
        )
    }

    fn store(engine: &Engine) -> SharedStore {
        engine.controller().store().unwrap()
    }

    fn vegan() -> NewPreferences {
        NewPreferences {
            dietary_restrictions: BTreeSet::from(["vegan".to_string()]),
            allergies: BTreeSet::from(["peanuts".to_string()]),
            onboarding_complete: true,
            ..NewPreferences::default()
        }
    }

    fn save_local(engine: &Engine, user_id: &str) -> UserPreferences {
        store(engine)
            .lock()
            .unwrap()
            .upsert_preferences(user_id, &vegan())
            .unwrap()
    }

    fn local_prefs(engine: &Engine, user_id: &str) -> Option<UserPreferences> {
        store(engine).lock().unwrap().get_preferences(user_id).unwrap()
    }

    fn remote_prefs(user_id: &str, updated_at: &str) -> RemotePreferences {
        RemotePreferences {
            user_id: user_id.to_string(),
            dietary_restrictions: BTreeSet::from(["keto".to_string()]),
            allergies: BTreeSet::new(),
            intolerances: BTreeSet::new(),
            medical_conditions: BTreeSet::new(),
            diet_type: Some("ketogenic".to_string()),
            cooking_time: Some("quick".to_string()),
            difficulty_level: None,
            serving_size: Some(2),
            measurement_unit: None,
            language: None,
            theme: Some("dark".to_string()),
            onboarding_complete: true,
            notifications_enabled: false,
            created_at: OLD.to_string(),
            updated_at: updated_at.to_string(),
        }
    }

    #[tokio::test]
    async fn test_not_ready_without_store() {
        let ctl = Arc::new(InitController::new(
            Arc::new(MemoryOpener),
            InitConfig::default(),
        ));
        let engine = SyncEngine::new(
            ctl,
            MemoryRemote::new(Mode::Up),
            StaticSession::signed_in("u1"),
            SyncConfig::default(),
        );

        let report = engine.push_preferences("u1").await;
        assert!(!report.success);
        assert_eq!(report.reason, Some(SyncFailure::NotReady));
        assert_eq!(
            serde_json::to_value(&report).unwrap()["reason"],
            "not-ready"
        );

        let outcome = engine.pull_and_merge_on_load("u1");
        assert!(outcome.preferences.is_none());
        assert_eq!(outcome.report.reason, Some(SyncFailure::NotReady));
        assert!(outcome.background_push.is_none());
    }

    #[tokio::test]
    async fn test_not_ready_without_matching_session() {
        let engine = engine(Mode::Up, None).await;
        save_local(&engine, "u1");
        assert_eq!(
            engine.push_preferences("u1").await.reason,
            Some(SyncFailure::NotReady)
        );

        engine.session().sign_in("someone-else");
        assert_eq!(
            engine.push_preferences("u1").await.reason,
            Some(SyncFailure::NotReady)
        );
        assert_eq!(engine.remote().upserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_push_preferences_overwrites_remote() {
        let engine = engine(Mode::Up, Some("u1")).await;
        engine
            .remote()
            .prefs
            .lock()
            .unwrap()
            .insert("u1".to_string(), remote_prefs("u1", FUTURE));
        let local = save_local(&engine, "u1");

        let report = engine.push_preferences("u1").await;
        assert!(report.success);
        assert_eq!(report.pushed, 1);

        let remote = engine.remote().prefs.lock().unwrap()["u1"].clone();
        assert_eq!(remote, RemotePreferences::from_local(&local));
        let after = local_prefs(&engine, "u1").unwrap();
        assert!(!after.sync.dirty);
        assert!(after.sync.synced_at.is_some());
    }

    #[tokio::test]
    async fn test_push_without_local_record_is_a_no_op() {
        let engine = engine(Mode::Up, Some("u1")).await;
        let report = engine.push_preferences("u1").await;
        assert!(report.success);
        assert_eq!(report.pushed, 0);
        assert_eq!(engine.remote().upserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_timeout_is_remote_unavailable() {
        let engine = engine(Mode::Hang, Some("u1")).await;
        let before = save_local(&engine, "u1");

        let report = engine.push_preferences("u1").await;
        assert!(!report.success);
        assert_eq!(report.reason, Some(SyncFailure::RemoteUnavailable));
        assert!(report.is_retryable());
        assert_eq!(
            serde_json::to_value(&report).unwrap()["reason"],
            "remote-unavailable"
        );

        // Local data is unchanged and still pending.
        assert_eq!(local_prefs(&engine, "u1").unwrap(), before);
    }

    #[tokio::test]
    async fn test_push_rejected() {
        let engine = engine(Mode::Reject, Some("u1")).await;
        save_local(&engine, "u1");
        let report = engine.push_preferences("u1").await;
        assert_eq!(report.reason, Some(SyncFailure::RemoteRejected));
        assert!(!report.is_retryable());
        assert!(local_prefs(&engine, "u1").unwrap().sync.dirty);
    }

    #[tokio::test]
    async fn test_load_survives_remote_failure() {
        let engine = engine(Mode::Down, Some("u1")).await;
        let before = save_local(&engine, "u1");

        let outcome = engine.pull_and_merge_on_load("u1");
        assert!(outcome.report.success);
        assert_eq!(outcome.preferences.as_ref(), Some(&before));

        let push = outcome.background_push.unwrap().await.unwrap();
        assert_eq!(push.reason, Some(SyncFailure::RemoteUnavailable));
        assert_eq!(local_prefs(&engine, "u1").unwrap(), before);
    }

    #[tokio::test]
    async fn test_load_pushes_pending_changes_once() {
        let engine = engine(Mode::Up, Some("u1")).await;
        save_local(&engine, "u1");

        let outcome = engine.pull_and_merge_on_load("u1");
        let push = outcome.background_push.unwrap().await.unwrap();
        assert!(push.success);
        assert_eq!(push.pushed, 1);

        // Nothing pending any more, so a second load schedules nothing.
        let outcome = engine.pull_and_merge_on_load("u1");
        assert!(outcome.preferences.is_some());
        assert!(outcome.background_push.is_none());
        assert_eq!(engine.remote().upserts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_without_session_reads_locally() {
        let engine = engine(Mode::Up, None).await;
        save_local(&engine, "u1");
        let outcome = engine.pull_and_merge_on_load("u1");
        assert!(outcome.report.success);
        assert!(outcome.preferences.is_some());
        assert!(outcome.background_push.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_stops_background_push() {
        let engine = engine(Mode::Hang, Some("u1")).await;
        let watcher = engine.watch_session();
        let before = save_local(&engine, "u1");

        let outcome = engine.pull_and_merge_on_load("u1");
        let push = outcome.background_push.unwrap();
        tokio::task::yield_now().await;

        engine.session().sign_out();
        match push.await {
            Err(e) => assert!(e.is_cancelled()),
            Ok(report) => assert!(!report.success),
        }
        assert!(engine.remote().prefs.lock().unwrap().is_empty());

        // Local data stays; further sync is refused until sign-in.
        assert_eq!(local_prefs(&engine, "u1").unwrap(), before);
        assert_eq!(
            engine.push_preferences("u1").await.reason,
            Some(SyncFailure::NotReady)
        );
        watcher.abort();
    }

    #[tokio::test]
    async fn test_pull_preferences_last_writer_wins() {
        let engine = engine(Mode::Up, Some("u1")).await;
        save_local(&engine, "u1");
        engine
            .remote()
            .prefs
            .lock()
            .unwrap()
            .insert("u1".to_string(), remote_prefs("u1", FUTURE));

        let report = engine.pull_preferences("u1").await;
        assert!(report.success);
        assert_eq!(report.pulled, 1);
        let adopted = local_prefs(&engine, "u1").unwrap();
        assert!(adopted.dietary_restrictions.contains("keto"));
        assert_eq!(adopted.theme.as_deref(), Some("dark"));
        assert_eq!(adopted.sync.origin, RecordOrigin::Remote);
        assert!(!adopted.sync.dirty);

        // An older remote row never replaces the local record.
        engine
            .remote()
            .prefs
            .lock()
            .unwrap()
            .insert("u1".to_string(), remote_prefs("u1", OLD));
        let report = engine.pull_preferences("u1").await;
        assert_eq!(report.pulled, 0);
        assert_eq!(local_prefs(&engine, "u1").unwrap(), adopted);
    }

    #[tokio::test]
    async fn test_pull_preferences_into_empty_store() {
        let engine = engine(Mode::Up, Some("u1")).await;
        engine
            .remote()
            .prefs
            .lock()
            .unwrap()
            .insert("u1".to_string(), remote_prefs("u1", OLD));
        let report = engine.pull_preferences("u1").await;
        assert_eq!(report.pulled, 1);
        assert_eq!(
            local_prefs(&engine, "u1").unwrap().diet_type.as_deref(),
            Some("ketogenic")
        );

        // Pulled data is not pending, so a load does not push it back.
        let outcome = engine.pull_and_merge_on_load("u1");
        assert!(outcome.background_push.is_none());
    }

    #[tokio::test]
    async fn test_push_recipes_inserts_then_updates() {
        let engine = engine(Mode::Up, Some("u1")).await;
        let (original, adapted) = {
            let shared = store(&engine);
            let db = shared.lock().unwrap();
            let original = db.create_recipe(&NewRecipe::titled("Lasagne")).unwrap();
            let adapted = db
                .create_recipe(&NewRecipe {
                    is_adapted: true,
                    original_recipe_id: Some(original.id.clone()),
                    ..NewRecipe::titled("Vegan Lasagne")
                })
                .unwrap();
            (original, adapted)
        };

        let report = engine.push_recipes("u1").await;
        assert!(report.success);
        assert_eq!(report.pushed, 2);
        {
            let rows = engine.remote().recipes.lock().unwrap();
            assert_eq!(rows.len(), 2);
            let remote_adapted = rows.iter().find(|r| r.client_id == adapted.id).unwrap();
            assert_eq!(
                remote_adapted.original_recipe_id.as_deref(),
                Some(original.id.as_str())
            );
        }

        let report = engine.push_recipes("u1").await;
        assert_eq!(report.pushed, 0);

        store(&engine)
            .lock()
            .unwrap()
            .update_recipe(
                &original.id,
                &RecipeUpdate {
                    title: Some("Classic Lasagne".to_string()),
                    ..RecipeUpdate::default()
                },
            )
            .unwrap();
        let report = engine.push_recipes("u1").await;
        assert_eq!(report.pushed, 1);
        assert_eq!(engine.remote().updates.load(Ordering::SeqCst), 1);
        let rows = engine.remote().recipes.lock().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.title == "Classic Lasagne"));
    }

    #[tokio::test]
    async fn test_pull_recipes_never_deletes_and_prefers_newer() {
        let engine = engine(Mode::Up, Some("u1")).await;
        let (local_only, stale_remote, fresh_remote) = {
            let shared = store(&engine);
            let db = shared.lock().unwrap();
            (
                db.create_recipe(&NewRecipe::titled("Only Here")).unwrap(),
                db.create_recipe(&NewRecipe::titled("Edited Here")).unwrap(),
                db.create_recipe(&NewRecipe::titled("Edited Elsewhere")).unwrap(),
            )
        };

        let mut older = RemoteRecipe::from_local(&stale_remote, "u1");
        older.id = Some("r-old".to_string());
        older.title = "Old Remote Title".to_string();
        older.updated_at = OLD.to_string();

        let mut newer = RemoteRecipe::from_local(&fresh_remote, "u1");
        newer.id = Some("r-new".to_string());
        newer.title = "Newer Remote Title".to_string();
        newer.updated_at = FUTURE.to_string();

        let mut brand_new = RemoteRecipe::from_local(&local_only, "u1");
        brand_new.id = Some("r-brand".to_string());
        brand_new.client_id = "from-tablet".to_string();
        brand_new.title = "Tablet Soup".to_string();

        let mut foreign = brand_new.clone();
        foreign.client_id = "foreign".to_string();
        foreign.user_id = "u2".to_string();

        *engine.remote().recipes.lock().unwrap() = vec![older, newer, brand_new, foreign];

        let report = engine.pull_recipes("u1").await;
        assert!(report.success);
        assert_eq!(report.pulled, 2);

        let shared = store(&engine);
        let db = shared.lock().unwrap();
        assert_eq!(db.get_recipe(&local_only.id).unwrap().unwrap(), local_only);

        let kept = db.get_recipe(&stale_remote.id).unwrap().unwrap();
        assert_eq!(kept.title, "Edited Here");
        assert!(kept.sync.dirty);
        assert_eq!(kept.sync.remote_id.as_deref(), Some("r-old"));

        let replaced = db.get_recipe(&fresh_remote.id).unwrap().unwrap();
        assert_eq!(replaced.title, "Newer Remote Title");
        assert_eq!(replaced.sync.origin, RecordOrigin::Remote);
        assert!(!replaced.sync.dirty);

        let pulled = db.get_recipe("from-tablet").unwrap().unwrap();
        assert_eq!(pulled.title, "Tablet Soup");
        assert!(db.get_recipe("foreign").unwrap().is_none());
        assert_eq!(db.count(crate::models::EntityKind::Recipe).unwrap(), 4);
    }

    #[tokio::test]
    async fn test_deleted_recipe_stays_deleted() {
        let engine = engine(Mode::Up, Some("u1")).await;
        let recipe = store(&engine)
            .lock()
            .unwrap()
            .create_recipe(&NewRecipe::titled("Shakshuka"))
            .unwrap();
        assert_eq!(engine.push_recipes("u1").await.pushed, 1);
        let stale_rows = engine.remote().recipes.lock().unwrap().clone();

        assert!(store(&engine).lock().unwrap().delete_recipe(&recipe.id).unwrap());

        // The remote row is still there before the delete is pushed.
        let report = engine.pull_recipes("u1").await;
        assert!(report.success);
        assert_eq!(report.pulled, 0);
        assert!(store(&engine).lock().unwrap().get_recipe(&recipe.id).unwrap().is_none());

        let report = engine.push_recipes("u1").await;
        assert!(report.success);
        assert_eq!(report.pushed, 1);
        assert!(engine.remote().recipes.lock().unwrap().is_empty());
        assert!(
            store(&engine)
                .lock()
                .unwrap()
                .pending_recipe_deletes()
                .unwrap()
                .is_empty()
        );

        // A stale remote read after the delete still cannot bring it back.
        *engine.remote().recipes.lock().unwrap() = stale_rows;
        assert_eq!(engine.pull_recipes("u1").await.pulled, 0);
        let shared = store(&engine);
        let db = shared.lock().unwrap();
        assert!(db.get_recipe(&recipe.id).unwrap().is_none());
        assert_eq!(db.count(crate::models::EntityKind::Recipe).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_before_first_push_removes_by_client_id() {
        let engine = engine(Mode::Up, Some("u1")).await;
        let recipe = store(&engine)
            .lock()
            .unwrap()
            .create_recipe(&NewRecipe::titled("Draft"))
            .unwrap();
        // A row that landed remotely without the reply reaching us.
        let mut landed = RemoteRecipe::from_local(&recipe, "u1");
        landed.id = Some("r-1".to_string());
        engine.remote().recipes.lock().unwrap().push(landed);

        store(&engine).lock().unwrap().delete_recipe(&recipe.id).unwrap();
        let report = engine.push_recipes("u1").await;
        assert!(report.success);
        assert!(engine.remote().recipes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_push_never_duplicates_remote_rows() {
        let engine = engine(Mode::LostReply, Some("u1")).await;
        let recipe = store(&engine)
            .lock()
            .unwrap()
            .create_recipe(&NewRecipe::titled("Ramen"))
            .unwrap();

        let first = engine.push_recipes("u1").await;
        assert_eq!(first.reason, Some(SyncFailure::RemoteUnavailable));
        assert_eq!(engine.remote().recipes.lock().unwrap().len(), 1);
        assert!(store(&engine).lock().unwrap().get_recipe(&recipe.id).unwrap().unwrap().sync.dirty);

        engine.remote().set_mode(Mode::Up);
        let second = engine.push_recipes("u1").await;
        assert!(second.success);
        assert_eq!(second.pushed, 1);

        let rows = engine.remote().recipes.lock().unwrap().clone();
        assert_eq!(rows.len(), 1);
        let stored = store(&engine).lock().unwrap().get_recipe(&recipe.id).unwrap().unwrap();
        assert_eq!(stored.sync.remote_id, rows[0].id);
        assert!(!stored.sync.dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_push_does_not_pin_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let opener = crate::init::FileStoreOpener::new(crate::paths::StorePath::new(Arc::new(
            crate::paths::FixedRoot(Some(dir.path().to_path_buf())),
        )));
        let ctl = Arc::new(InitController::new(Arc::new(opener), InitConfig::default()));
        ctl.initialize().await.unwrap();
        let engine = SyncEngine::new(
            Arc::clone(&ctl),
            MemoryRemote::new(Mode::Hang),
            StaticSession::signed_in("u1"),
            SyncConfig::default(),
        );
        save_local(&engine, "u1");

        let push = tokio::spawn({
            let engine = engine.clone();
            async move { engine.push_preferences("u1").await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        // Only the controller holds the store while the request waits.
        let shared = ctl.store().unwrap();
        assert_eq!(Arc::strong_count(&shared), 2);
        drop(shared);

        let started = tokio::time::Instant::now();
        ctl.reinitialize().await.unwrap();
        assert!(started.elapsed() < InitConfig::default().retry_delay);
        assert!(ctl.is_ready());

        let report = push.await.unwrap();
        assert_eq!(report.reason, Some(SyncFailure::RemoteUnavailable));
        assert!(local_prefs(&engine, "u1").unwrap().sync.dirty);
    }

    #[tokio::test]
    async fn test_sync_all() {
        let engine = engine(Mode::Up, Some("u1")).await;
        save_local(&engine, "u1");
        store(&engine)
            .lock()
            .unwrap()
            .create_recipe(&NewRecipe::titled("Pasta"))
            .unwrap();

        let report = engine.sync_all("u1").await;
        assert!(report.success);
        assert_eq!(report.pushed, 2);
        assert_eq!(report.pulled, 0);

        engine.remote().set_mode(Mode::Down);
        let report = engine.sync_all("u1").await;
        assert!(!report.success);
        assert_eq!(report.reason, Some(SyncFailure::RemoteUnavailable));
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer("2025-01-02T00:00:00Z", "2025-01-01T23:59:59Z"));
        assert!(is_newer("2025-01-01T01:00:00+00:00", "2025-01-01T01:30:00+02:00"));
        assert!(!is_newer(OLD, OLD));
        assert!(is_newer("b", "a"));
    }
}
