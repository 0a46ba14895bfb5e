//! Lifecycle of the local store: open with bounded, cancellable retries and
//! publish readiness to callers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::{InitError, OpenError};
use crate::paths::StorePath;
use crate::schema::SchemaRegistry;

/// Opens the local store. Implementations are called once per attempt.
pub trait StoreOpener: Send + Sync {
    fn open(&self) -> Result<Database, OpenError>;
}

/// Opens the store file at a cached, persistent path.
pub struct FileStoreOpener {
    path: StorePath,
    registry: SchemaRegistry,
}

impl FileStoreOpener {
    pub fn new(path: StorePath) -> Self {
        Self::with_registry(path, SchemaRegistry::current())
    }

    pub fn with_registry(path: StorePath, registry: SchemaRegistry) -> Self {
        Self { path, registry }
    }

    pub fn store_path(&self) -> &StorePath {
        &self.path
    }
}

impl StoreOpener for FileStoreOpener {
    fn open(&self) -> Result<Database, OpenError> {
        let path = self.path.resolve()?;
        Database::open_with(&path, &self.registry)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InitConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InitState {
    Idle,
    Initializing {
        attempt: u32,
    },
    Ready,
    Failed {
        retries_used: u32,
        /// No further automatic retries; only `reinitialize` leaves this.
        terminal: bool,
        reason: String,
    },
}

pub type SharedStore = Arc<Mutex<Database>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct InitController {
    opener: Arc<dyn StoreOpener>,
    config: InitConfig,
    state: watch::Sender<InitState>,
    store: Mutex<Option<SharedStore>>,
    terminal: Mutex<Option<InitError>>,
    // Serializes attempts so concurrent callers share one in-flight open.
    gate: AsyncMutex<()>,
    cancel: Mutex<CancellationToken>,
}

impl InitController {
    pub fn new(opener: Arc<dyn StoreOpener>, config: InitConfig) -> Self {
        let (state, _) = watch::channel(InitState::Idle);
        Self {
            opener,
            config,
            state,
            store: Mutex::new(None),
            terminal: Mutex::new(None),
            gate: AsyncMutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn config(&self) -> InitConfig {
        self.config
    }

    pub fn state(&self) -> InitState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InitState> {
        self.state.subscribe()
    }

    /// The open store, only while `Ready`.
    pub fn store(&self) -> Option<SharedStore> {
        lock(&self.store).clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.borrow(), InitState::Ready)
    }

    /// Open the store, retrying retryable failures up to `max_retries` times
    /// with `retry_delay` between attempts. Returns the existing store when
    /// already ready, and the recorded error while terminally failed.
    pub async fn initialize(&self) -> Result<SharedStore, InitError> {
        if let Some(store) = self.store() {
            return Ok(store);
        }
        let _gate = self.gate.lock().await;
        if let Some(store) = self.store() {
            return Ok(store);
        }
        let terminal = lock(&self.terminal).clone();
        if let Some(err) = terminal {
            return Err(err);
        }

        let token = self.fresh_token();
        let mut retries = 0u32;
        loop {
            let attempt = retries + 1;
            self.state.send_replace(InitState::Initializing { attempt });
            debug!(attempt, "opening store");

            let err = match self.opener.open() {
                Ok(db) => {
                    let shared = Arc::new(Mutex::new(db));
                    *lock(&self.store) = Some(Arc::clone(&shared));
                    self.state.send_replace(InitState::Ready);
                    info!(attempt, "store ready");
                    return Ok(shared);
                }
                Err(err) => err,
            };

            let reason = err.to_string();
            if !err.is_retryable() {
                error!(%reason, "store cannot be opened; not retrying");
                return Err(self.fail_terminal(retries, InitError::Fatal { reason }));
            }
            if retries >= self.config.max_retries {
                error!(attempts = attempt, %reason, "store initialization retries exhausted");
                return Err(self.fail_terminal(
                    retries,
                    InitError::RetryExhausted {
                        attempts: attempt,
                        reason,
                    },
                ));
            }

            warn!(
                attempt,
                delay_ms = u64::try_from(self.config.retry_delay.as_millis()).unwrap_or(u64::MAX),
                %reason,
                "store open failed; retry scheduled"
            );
            self.state.send_replace(InitState::Failed {
                retries_used: retries,
                terminal: false,
                reason,
            });

            tokio::select! {
                () = token.cancelled() => {
                    info!("pending store retry cancelled");
                    self.state.send_replace(InitState::Idle);
                    return Err(InitError::Cancelled);
                }
                () = tokio::time::sleep(self.config.retry_delay) => {}
            }
            retries += 1;
        }
    }

    /// Abort a pending retry. The waiting `initialize` returns
    /// `InitError::Cancelled` and the state goes back to `Idle`.
    pub fn cancel(&self) {
        lock(&self.cancel).cancel();
    }

    /// Explicit reset: drop any store or terminal failure and start over
    /// with a fresh retry budget.
    pub async fn reinitialize(&self) -> Result<SharedStore, InitError> {
        {
            let _gate = self.gate.lock().await;
            self.reset();
        }
        self.initialize().await
    }

    /// Force the store closed. State returns to `Idle`.
    pub fn close(&self) {
        self.reset();
    }

    fn reset(&self) {
        let taken = lock(&self.store).take();
        *lock(&self.terminal) = None;
        self.state.send_replace(InitState::Idle);
        if let Some(shared) = taken {
            close_shared(shared);
        }
    }

    fn fresh_token(&self) -> CancellationToken {
        let mut token = lock(&self.cancel);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    fn fail_terminal(&self, retries_used: u32, err: InitError) -> InitError {
        *lock(&self.terminal) = Some(err.clone());
        self.state.send_replace(InitState::Failed {
            retries_used,
            terminal: true,
            reason: err.to_string(),
        });
        err
    }
}

fn close_shared(shared: SharedStore) {
    match Arc::try_unwrap(shared) {
        Ok(mutex) => {
            let db = mutex.into_inner().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = db.close() {
                warn!(error = %e, "store did not close cleanly");
            }
        }
        Err(shared) => warn!(
            holders = Arc::strong_count(&shared) - 1,
            "store still referenced elsewhere; it stays locked until the last handle drops"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;
    use crate::paths::FixedRoot;

    struct ScriptedOpener {
        script: Mutex<VecDeque<Option<OpenError>>>,
        calls: AtomicU32,
    }

    impl ScriptedOpener {
        fn new(script: Vec<Option<OpenError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl StoreOpener for ScriptedOpener {
        fn open(&self) -> Result<Database, OpenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front().flatten() {
                Some(err) => Err(err),
                None => Ok(Database::open_in_memory().unwrap()),
            }
        }
    }

    fn unavailable() -> Option<OpenError> {
        Some(OpenError::PathUnavailable("no documents root".to_string()))
    }

    fn controller(opener: &Arc<ScriptedOpener>) -> InitController {
        InitController::new(opener.clone(), InitConfig::default())
    }

    #[tokio::test]
    async fn test_ready_on_first_attempt() {
        let opener = ScriptedOpener::new(vec![]);
        let ctl = controller(&opener);
        assert_eq!(ctl.state(), InitState::Idle);
        assert!(ctl.store().is_none());

        let first = ctl.initialize().await.unwrap();
        let second = ctl.initialize().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ctl.state(), InitState::Ready);
        assert!(ctl.is_ready());
        assert_eq!(opener.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_failures_use_exactly_three_retries() {
        let opener = ScriptedOpener::new(vec![
            unavailable(),
            unavailable(),
            unavailable(),
            unavailable(),
        ]);
        let ctl = controller(&opener);
        let started = Instant::now();

        let err = ctl.initialize().await.unwrap_err();
        assert!(matches!(err, InitError::RetryExhausted { attempts: 4, .. }));
        assert_eq!(opener.calls(), 4);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(6) && waited < Duration::from_secs(7));
        assert!(matches!(
            ctl.state(),
            InitState::Failed {
                retries_used: 3,
                terminal: true,
                ..
            }
        ));

        // Terminal: no automatic retry.
        assert_eq!(ctl.initialize().await.unwrap_err(), err);
        assert_eq!(opener.calls(), 4);

        // An explicit reset opens again with a fresh budget.
        ctl.reinitialize().await.unwrap();
        assert_eq!(opener.calls(), 5);
        assert_eq!(ctl.state(), InitState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_budget() {
        let opener = ScriptedOpener::new(vec![unavailable(), unavailable()]);
        let ctl = controller(&opener);
        let started = Instant::now();

        ctl.initialize().await.unwrap();
        assert_eq!(opener.calls(), 3);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(4) && waited < Duration::from_secs(5));
        assert_eq!(ctl.state(), InitState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incompatible_version_is_terminal_without_retry() {
        let opener = ScriptedOpener::new(vec![Some(OpenError::IncompatibleVersion {
            path: PathBuf::from("/data/recipetuner.db"),
            on_disk: 9,
            supported: 4,
        })]);
        let ctl = controller(&opener);

        let err = ctl.initialize().await.unwrap_err();
        assert!(matches!(err, InitError::Fatal { .. }));
        assert_eq!(opener.calls(), 1);
        assert!(matches!(
            ctl.state(),
            InitState::Failed {
                retries_used: 0,
                terminal: true,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_resets_after_ready() {
        let opener = ScriptedOpener::new(vec![
            unavailable(),
            unavailable(),
            unavailable(),
            None,
            unavailable(),
            unavailable(),
            unavailable(),
        ]);
        let ctl = controller(&opener);

        ctl.initialize().await.unwrap();
        assert_eq!(opener.calls(), 4);

        ctl.close();
        assert_eq!(ctl.state(), InitState::Idle);
        assert!(ctl.store().is_none());

        // Three more failures fit in a fresh budget.
        ctl.initialize().await.unwrap();
        assert_eq!(opener.calls(), 8);
        assert!(ctl.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_retry() {
        let opener = ScriptedOpener::new((0..8).map(|_| unavailable()).collect());
        let ctl = Arc::new(controller(&opener));
        let mut rx = ctl.subscribe();

        let task = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.initialize().await })
        };
        rx.wait_for(|s| matches!(s, InitState::Failed { terminal: false, .. }))
            .await
            .unwrap();
        ctl.cancel();

        assert_eq!(task.await.unwrap().unwrap_err(), InitError::Cancelled);
        assert_eq!(ctl.state(), InitState::Idle);

        // The cancelled retry never fires.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(opener.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_open() {
        let opener = ScriptedOpener::new(vec![]);
        let ctl = controller(&opener);
        let (a, b) = tokio::join!(ctl.initialize(), ctl.initialize());
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(opener.calls(), 1);
    }

    #[tokio::test]
    async fn test_file_opener_uses_persistent_root() {
        let dir = tempfile::tempdir().unwrap();
        let opener = FileStoreOpener::new(StorePath::new(Arc::new(FixedRoot(Some(
            dir.path().to_path_buf(),
        )))));
        let ctl = InitController::new(Arc::new(opener), InitConfig::default());

        let store = ctl.initialize().await.unwrap();
        let path = store.lock().unwrap().path().map(PathBuf::from).unwrap();
        assert_eq!(path, dir.path().join("recipetuner.db"));
        assert!(path.exists());
        drop(store);

        ctl.close();
        assert!(!dir.path().join("recipetuner.db.lock").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_root_exhausts_retries() {
        let opener = FileStoreOpener::new(StorePath::new(Arc::new(FixedRoot(None))));
        let ctl = InitController::new(Arc::new(opener), InitConfig::default());
        let err = ctl.initialize().await.unwrap_err();
        assert!(matches!(err, InitError::RetryExhausted { attempts: 4, .. }));
    }
}
