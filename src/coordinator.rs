//! Single-flight token refresh coordination
//!
//! [`RefreshCoordinator`] owns the only mutable shared state of the client:
//! whether a refresh is in flight and which requests are waiting on it.
//!
//! ```text
//!            start_or_join (Idle)                  complete / cancel_all
//!   Idle ─────────────────────────▶ Refreshing ──────────────────────────▶ Idle
//!                                     │   ▲
//!           start_or_join / enqueue   │   │ waiters appended (FIFO)
//!                                     └───┘
//! ```
//!
//! Exactly one caller becomes the [`RefreshOwner`] for a cycle; everybody else
//! is parked as a [`Waiter`] and released in the same settle event that ends
//! the cycle. All transitions happen under one `std::sync::Mutex` that is
//! never held across an `.await`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::auth::{SharedTokenRefresher, SharedTokenStorage};
use crate::error::{ClientError, Result};
use crate::types::{
    AccessToken, ApiRequest, ClientOptions, CycleId, RequestId, SessionExpiredCallback, TokenPair,
};

/// Outcome delivered to a parked request: the request with a fresh token
/// attached, or the reason it will never be sent.
type Resumption = Result<ApiRequest>;

// ============================================================================
// State
// ============================================================================

/// Refresh phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No refresh in flight
    Idle,
    /// A refresh is in flight; `cycle` identifies its settle signal
    Refreshing {
        /// Cycle the in-flight refresh belongs to
        cycle: CycleId,
        /// When the cycle started
        started_at: Instant,
    },
}

/// A request suspended on an in-flight refresh
pub struct Waiter {
    request: ApiRequest,
    resume: oneshot::Sender<Resumption>,
}

impl Waiter {
    /// Park `request`, returning the waiter and the handle its owner awaits
    #[must_use]
    pub fn new(request: ApiRequest) -> (Self, PendingRequest) {
        let (resume, rx) = oneshot::channel();
        let request_id = request.id();
        (Self { request, resume }, PendingRequest { request_id, rx })
    }

    /// Request this waiter will release
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request.id()
    }

    fn resume(self, token_type: &str, token: &AccessToken) {
        let mut request = self.request;
        let outcome = request.set_bearer(token_type, token).map(|()| request);
        // Receiver gone means the caller stopped waiting; nothing to deliver
        let _ = self.resume.send(outcome);
    }

    fn reject(self, error: ClientError) {
        let _ = self.resume.send(Err(error));
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("request_id", &self.request.id())
            .finish_non_exhaustive()
    }
}

/// Caller side of a [`Waiter`]
#[derive(Debug)]
pub struct PendingRequest {
    request_id: RequestId,
    rx: oneshot::Receiver<Resumption>,
}

impl PendingRequest {
    /// Request being waited on
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Wait for the refresh to settle.
    ///
    /// # Errors
    ///
    /// Returns the refresh error on failure, or `ClientError::RequestCancelled`
    /// if the waiter was dropped without being settled.
    pub async fn wait(self) -> Result<ApiRequest> {
        self.rx.await.unwrap_or(Err(ClientError::RequestCancelled))
    }
}

/// Mutable refresh state; only the coordinator touches it
#[derive(Debug)]
struct RefreshState {
    phase: Phase,
    pending: VecDeque<Waiter>,
    next_cycle: u64,
}

impl RefreshState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            pending: VecDeque::new(),
            next_cycle: 1,
        }
    }

    /// Move to Idle if `cycle` is still the active one, handing back its waiters
    fn settle(&mut self, cycle: CycleId) -> Option<VecDeque<Waiter>> {
        match self.phase {
            Phase::Refreshing { cycle: active, .. } if active == cycle => {
                self.phase = Phase::Idle;
                Some(std::mem::take(&mut self.pending))
            }
            _ => None,
        }
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Result of [`RefreshCoordinator::start_or_join`]
#[derive(Debug)]
pub enum RefreshHandle {
    /// Caller started the cycle and must drive it; its request is handed back
    Owner(RefreshOwner, ApiRequest),
    /// A cycle was already running; the request is parked on it
    Joiner(PendingRequest),
}

/// Result of [`RefreshCoordinator::enqueue`]
#[derive(Debug)]
pub enum Enqueued {
    /// Parked on the in-flight refresh
    Waiting(PendingRequest),
    /// No refresh in flight; the request is handed back untouched
    Idle(ApiRequest),
}

/// Settings the coordinator reads from [`ClientOptions`]
#[derive(Clone)]
pub struct CoordinatorSettings {
    /// Authorization scheme prefix
    pub token_type: String,
    /// Upper bound on one refresher call
    pub refresh_timeout: Option<Duration>,
    /// Called once per failed cycle, after tokens are cleared
    pub on_session_expired: Option<SessionExpiredCallback>,
}

impl From<&ClientOptions> for CoordinatorSettings {
    fn from(options: &ClientOptions) -> Self {
        Self {
            token_type: options.token_type.clone(),
            refresh_timeout: options.refresh_timeout,
            on_session_expired: options.on_session_expired.clone(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            token_type: "Bearer".to_string(),
            refresh_timeout: Some(crate::types::DEFAULT_REFRESH_TIMEOUT),
            on_session_expired: None,
        }
    }
}

struct Inner {
    state: Mutex<RefreshState>,
    storage: SharedTokenStorage,
    refresher: SharedTokenRefresher,
    settings: CoordinatorSettings,
    refresh_count: AtomicU64,
    /// Aborts detached refresh tasks on teardown
    cancellation: CancellationToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(&self, cycle: CycleId) -> bool {
        matches!(self.lock().phase, Phase::Refreshing { cycle: active, .. } if active == cycle)
    }

    /// End `cycle` and release every waiter with `outcome`.
    ///
    /// Returns `false` if the cycle had already been ended by `cancel_all`.
    fn settle(&self, cycle: CycleId, outcome: std::result::Result<&AccessToken, &ClientError>) -> bool {
        let Some(waiters) = self.lock().settle(cycle) else {
            return false;
        };

        tracing::debug!(cycle = %cycle, waiters = waiters.len(), ok = outcome.is_ok(), "Refresh settled");

        for waiter in waiters {
            match outcome {
                Ok(token) => waiter.resume(&self.settings.token_type, token),
                Err(error) => waiter.reject(error.clone()),
            }
        }
        true
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Serializes refresh attempts and fans the result out to waiting requests.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    /// Create a coordinator in the Idle phase
    pub fn new(
        storage: SharedTokenStorage,
        refresher: SharedTokenRefresher,
        settings: CoordinatorSettings,
    ) -> Self {
        Self::with_cancellation_token(storage, refresher, settings, CancellationToken::new())
    }

    /// Create a coordinator whose detached refresh tasks stop when
    /// `cancellation_token` is cancelled
    pub fn with_cancellation_token(
        storage: SharedTokenStorage,
        refresher: SharedTokenRefresher,
        settings: CoordinatorSettings,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RefreshState::new()),
                storage,
                refresher,
                settings,
                refresh_count: AtomicU64::new(0),
                cancellation: cancellation_token,
            }),
        }
    }

    /// Start a refresh cycle, or park `request` on the one in flight.
    ///
    /// Atomic with respect to other callers: of any number of concurrent
    /// callers that find the coordinator Idle, exactly one becomes the owner.
    /// The phase is `Refreshing` on return in both cases.
    pub fn start_or_join(&self, request: ApiRequest) -> RefreshHandle {
        let mut state = self.inner.lock();
        match state.phase {
            Phase::Idle => {
                let cycle = CycleId::new(state.next_cycle);
                state.next_cycle += 1;
                state.phase = Phase::Refreshing {
                    cycle,
                    started_at: Instant::now(),
                };
                drop(state);

                tracing::debug!(cycle = %cycle, request_id = %request.id(), "Starting token refresh");
                RefreshHandle::Owner(
                    RefreshOwner {
                        inner: Arc::clone(&self.inner),
                        cycle,
                        settled: false,
                    },
                    request,
                )
            }
            Phase::Refreshing { cycle, .. } => {
                let (waiter, pending) = Waiter::new(request);
                tracing::debug!(cycle = %cycle, request_id = %waiter.request_id(), "Joining in-flight token refresh");
                state.pending.push_back(waiter);
                RefreshHandle::Joiner(pending)
            }
        }
    }

    /// Park `request` on the in-flight refresh, if there is one.
    pub fn enqueue(&self, request: ApiRequest) -> Enqueued {
        let mut state = self.inner.lock();
        match state.phase {
            Phase::Idle => Enqueued::Idle(request),
            Phase::Refreshing { cycle, .. } => {
                let (waiter, pending) = Waiter::new(request);
                tracing::trace!(cycle = %cycle, request_id = %waiter.request_id(), "Request suspended until refresh settles");
                state.pending.push_back(waiter);
                Enqueued::Waiting(pending)
            }
        }
    }

    /// Reject every waiter with `RequestCancelled` and reset to Idle.
    ///
    /// A refresh owner that is still running finds its cycle gone when it
    /// completes and reports `RequestCancelled` to its own caller. Returns the
    /// number of waiters rejected.
    pub fn cancel_all(&self) -> usize {
        let waiters = {
            let mut state = self.inner.lock();
            state.phase = Phase::Idle;
            std::mem::take(&mut state.pending)
        };

        let count = waiters.len();
        if count > 0 {
            tracing::debug!(waiters = count, "Cancelling requests waiting on token refresh");
        }
        for waiter in waiters {
            waiter.reject(ClientError::RequestCancelled);
        }
        count
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    /// Whether a refresh is in flight
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        matches!(self.phase(), Phase::Refreshing { .. })
    }

    /// Number of parked requests
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Number of times the refresher has been invoked
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_count.load(Ordering::SeqCst)
    }

    /// Token storage shared with the interceptors
    #[must_use]
    pub fn storage(&self) -> &SharedTokenStorage {
        &self.inner.storage
    }

    /// Authorization scheme prefix
    #[must_use]
    pub fn token_type(&self) -> &str {
        &self.inner.settings.token_type
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("RefreshCoordinator")
            .field("phase", &state.phase)
            .field("pending", &state.pending.len())
            .field("refresh_count", &self.refresh_count())
            .finish()
    }
}

// ============================================================================
// Owner
// ============================================================================

/// Obligation to drive one refresh cycle to completion.
///
/// Dropping an owner without completing it settles the cycle with
/// `RequestCancelled`, so waiters are never left hanging.
#[must_use = "a refresh owner must be driven to completion"]
pub struct RefreshOwner {
    inner: Arc<Inner>,
    cycle: CycleId,
    settled: bool,
}

impl RefreshOwner {
    /// Cycle this owner drives
    #[must_use]
    pub fn cycle(&self) -> CycleId {
        self.cycle
    }

    /// Drive the cycle on its own task and wait for the outcome.
    ///
    /// The cycle runs to completion even if the caller stops waiting, so
    /// joined requests are never cancelled by one caller giving up. Only the
    /// coordinator's cancellation token aborts it.
    ///
    /// `sent_with` is the Authorization value the rejected request carried.
    /// If storage already holds a different token, a refresh settled after
    /// that request went out and the cycle completes with the stored token
    /// without calling the refresher.
    ///
    /// # Errors
    ///
    /// Same as [`RefreshOwner::execute`].
    pub async fn run_detached(self, sent_with: Option<String>) -> Result<AccessToken> {
        let cancellation = self.inner.cancellation.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancellation.cancelled() => Err(ClientError::RequestCancelled),
                result = self.drive(sent_with) => result,
            }
        });

        task.await.unwrap_or_else(|e| {
            Err(ClientError::auth_refresh_failed(format!(
                "refresh task failed: {e}"
            )))
        })
    }

    async fn drive(self, sent_with: Option<String>) -> Result<AccessToken> {
        match self.rotated_token(sent_with.as_deref()).await {
            Some(token) => self.complete_rotated(token),
            None => self.execute().await,
        }
    }

    /// Stored access token, if it differs from the one the rejected request carried
    async fn rotated_token(&self, sent_with: Option<&str>) -> Option<AccessToken> {
        let stored = match self.inner.storage.get_access_token().await {
            Ok(token) => token.filter(|t| !t.is_blank())?,
            Err(e) => {
                tracing::debug!(error = %e, "Could not read access token; refreshing");
                return None;
            }
        };
        let current = format!("{} {}", self.inner.settings.token_type, stored.expose());
        (sent_with != Some(current.as_str())).then_some(stored)
    }

    fn complete_rotated(mut self, token: AccessToken) -> Result<AccessToken> {
        tracing::debug!(cycle = %self.cycle, "Token rotated since request was sent; settling without refresh");
        self.settled = true;
        if !self.inner.settle(self.cycle, Ok(&token)) {
            return Err(ClientError::RequestCancelled);
        }
        Ok(token)
    }

    /// Run the refresh sequence once and settle the cycle.
    ///
    /// Reads the refresh token, fails immediately if it is absent, calls the
    /// refresher (bounded by the configured timeout), then completes with the
    /// outcome. Returns the new access token for the owner's own replay.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::AuthRefreshFailed` for any refresh failure, or
    /// `ClientError::RequestCancelled` if the cycle was cancelled meanwhile.
    pub async fn execute(self) -> Result<AccessToken> {
        match self.obtain_tokens().await {
            Ok(tokens) => self.complete_success(tokens).await,
            Err(error) => Err(self.complete_failure(error).await),
        }
    }

    async fn obtain_tokens(&self) -> Result<TokenPair> {
        let refresh_token = self
            .inner
            .storage
            .get_refresh_token()
            .await
            .map_err(|e| ClientError::auth_refresh_failed(format!("could not read refresh token: {e}")))?
            .filter(|token| !token.is_blank())
            .ok_or_else(|| ClientError::auth_refresh_failed("no refresh token available"))?;

        self.inner.refresh_count.fetch_add(1, Ordering::SeqCst);
        let call = self.inner.refresher.refresh(&refresh_token);
        let tokens = match self.inner.settings.refresh_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                ClientError::auth_refresh_failed(format!(
                    "refresh timed out after {}ms",
                    limit.as_millis()
                ))
            })?,
            None => call.await,
        }
        .map_err(|e| match e {
            ClientError::AuthRefreshFailed(_) | ClientError::RequestCancelled => e,
            other => ClientError::auth_refresh_failed(other.to_string()),
        })?;

        if tokens.access_token.is_blank() {
            return Err(ClientError::auth_refresh_failed(
                "refresh returned an empty access token",
            ));
        }

        Ok(tokens)
    }

    /// Persist `tokens`, return to Idle and resume every waiter with the new
    /// access token.
    ///
    /// Storage writes finish before any waiter is released. A failed write
    /// turns the cycle into a failure. A cycle already ended by `cancel_all`
    /// writes nothing.
    ///
    /// # Errors
    ///
    /// Returns the storage failure (as `AuthRefreshFailed`) or
    /// `RequestCancelled` if the cycle was cancelled meanwhile.
    pub async fn complete_success(mut self, tokens: TokenPair) -> Result<AccessToken> {
        let TokenPair {
            access_token,
            refresh_token,
        } = tokens;

        if !self.inner.is_active(self.cycle) {
            self.settled = true;
            return Err(ClientError::RequestCancelled);
        }

        let storage = &self.inner.storage;
        let persisted = match storage.set_access_token(access_token.clone()).await {
            Ok(()) => match refresh_token {
                Some(refresh_token) => storage.set_refresh_token(refresh_token).await,
                None => Ok(()),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            let error = ClientError::auth_refresh_failed(format!("could not persist tokens: {e}"));
            return Err(self.complete_failure(error).await);
        }

        self.settled = true;
        if !self.inner.settle(self.cycle, Ok(&access_token)) {
            return Err(ClientError::RequestCancelled);
        }
        Ok(access_token)
    }

    /// Clear stored tokens, return to Idle and reject every waiter with `error`.
    ///
    /// Tokens are cleared before any waiter observes the rejection. Returns the
    /// error the owner should report to its own caller.
    pub async fn complete_failure(mut self, error: ClientError) -> ClientError {
        tracing::warn!(cycle = %self.cycle, error = %error, "Token refresh failed");

        if let Err(e) = self.inner.storage.clear_tokens().await {
            tracing::warn!(error = %e, "Failed to clear tokens after refresh failure");
        }

        self.settled = true;
        if !self.inner.settle(self.cycle, Err(&error)) {
            return ClientError::RequestCancelled;
        }

        if let Some(callback) = &self.inner.settings.on_session_expired {
            callback(&error);
        }
        error
    }
}

impl Drop for RefreshOwner {
    fn drop(&mut self) {
        if !self.settled && self.inner.settle(self.cycle, Err(&ClientError::RequestCancelled)) {
            tracing::warn!(cycle = %self.cycle, "Refresh owner dropped before completing; waiters cancelled");
        }
    }
}

impl std::fmt::Debug for RefreshOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshOwner")
            .field("cycle", &self.cycle)
            .field("settled", &self.settled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryTokenStorage, TokenStorage, refresher_fn};
    use crate::types::RefreshToken;
    use std::sync::atomic::AtomicUsize;

    fn coordinator_with(
        storage: Arc<MemoryTokenStorage>,
        new_access: &'static str,
    ) -> RefreshCoordinator {
        RefreshCoordinator::new(
            storage,
            refresher_fn(move |_| async move {
                Ok(TokenPair::new(new_access, Some(RefreshToken::new("r2"))))
            }),
            CoordinatorSettings::default(),
        )
    }

    fn owner_of(handle: RefreshHandle) -> RefreshOwner {
        match handle {
            RefreshHandle::Owner(owner, _) => owner,
            RefreshHandle::Joiner(_) => panic!("expected owner"),
        }
    }

    fn pending_of(handle: RefreshHandle) -> PendingRequest {
        match handle {
            RefreshHandle::Joiner(pending) => pending,
            RefreshHandle::Owner(..) => panic!("expected joiner"),
        }
    }

    #[test]
    fn test_only_first_caller_owns() {
        let storage = Arc::new(MemoryTokenStorage::new());
        let coordinator = coordinator_with(storage, "a2");

        let first = coordinator.start_or_join(ApiRequest::get("/a"));
        let second = coordinator.start_or_join(ApiRequest::get("/b"));
        let third = coordinator.start_or_join(ApiRequest::get("/c"));

        assert!(matches!(first, RefreshHandle::Owner(..)));
        assert!(matches!(second, RefreshHandle::Joiner(_)));
        assert!(matches!(third, RefreshHandle::Joiner(_)));
        assert!(coordinator.is_refreshing());
        assert_eq!(coordinator.pending_len(), 2);
    }

    #[test]
    fn test_enqueue_when_idle_hands_request_back() {
        let storage = Arc::new(MemoryTokenStorage::new());
        let coordinator = coordinator_with(storage, "a2");

        let request = ApiRequest::get("/a");
        let id = request.id();
        match coordinator.enqueue(request) {
            Enqueued::Idle(request) => assert_eq!(request.id(), id),
            Enqueued::Waiting(_) => panic!("nothing is refreshing"),
        }
        assert_eq!(coordinator.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_success_resumes_waiters_with_new_token() {
        let storage = Arc::new(MemoryTokenStorage::with_tokens(Some("a1"), Some("r1")));
        let coordinator = coordinator_with(Arc::clone(&storage), "a2");

        let owner = owner_of(coordinator.start_or_join(ApiRequest::get("/a")));
        let joiner = pending_of(coordinator.start_or_join(ApiRequest::get("/b")));
        let Enqueued::Waiting(queued) = coordinator.enqueue(ApiRequest::get("/c")) else {
            panic!("refresh should be in flight");
        };

        let token = owner.execute().await.unwrap();
        assert_eq!(token.expose(), "a2");
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert_eq!(coordinator.pending_len(), 0);
        assert_eq!(coordinator.refresh_count(), 1);

        for pending in [joiner, queued] {
            let request = pending.wait().await.unwrap();
            assert_eq!(request.authorization(), Some("Bearer a2"));
        }

        assert_eq!(
            storage.get_access_token().await.unwrap().unwrap().expose(),
            "a2"
        );
        assert_eq!(
            storage.get_refresh_token().await.unwrap().unwrap().expose(),
            "r2"
        );
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_without_calling_refresher() {
        let storage = Arc::new(MemoryTokenStorage::with_tokens(Some("a1"), None));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&storage) as SharedTokenStorage,
            refresher_fn(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async { Ok(TokenPair::new("never", None)) }
            }),
            CoordinatorSettings::default(),
        );

        let owner = owner_of(coordinator.start_or_join(ApiRequest::get("/a")));
        let joiner = pending_of(coordinator.start_or_join(ApiRequest::get("/b")));

        let err = owner.execute().await.unwrap_err();
        assert!(matches!(err, ClientError::AuthRefreshFailed(_)));
        assert_eq!(joiner.wait().await.unwrap_err(), err);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(storage.get_access_token().await.unwrap().is_none());
        assert_eq!(coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_empty_access_token_is_failure() {
        let storage = Arc::new(MemoryTokenStorage::with_tokens(Some("a1"), Some("r1")));
        let coordinator = coordinator_with(Arc::clone(&storage), "   ");

        let owner = owner_of(coordinator.start_or_join(ApiRequest::get("/a")));
        let err = owner.execute().await.unwrap_err();

        assert_eq!(
            err,
            ClientError::AuthRefreshFailed("refresh returned an empty access token".into())
        );
        assert!(storage.get_refresh_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_owner_cancels_waiters() {
        let storage = Arc::new(MemoryTokenStorage::new());
        let coordinator = coordinator_with(storage, "a2");

        let owner = owner_of(coordinator.start_or_join(ApiRequest::get("/a")));
        let joiner = pending_of(coordinator.start_or_join(ApiRequest::get("/b")));

        drop(owner);
        assert_eq!(joiner.wait().await.unwrap_err(), ClientError::RequestCancelled);
        assert_eq!(coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_cancel_all_then_owner_completes() {
        let storage = Arc::new(MemoryTokenStorage::with_tokens(Some("a1"), Some("r1")));
        let coordinator = coordinator_with(storage, "a2");

        let owner = owner_of(coordinator.start_or_join(ApiRequest::get("/a")));
        let first = pending_of(coordinator.start_or_join(ApiRequest::get("/b")));
        let second = pending_of(coordinator.start_or_join(ApiRequest::get("/c")));

        assert_eq!(coordinator.cancel_all(), 2);
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert_eq!(first.wait().await.unwrap_err(), ClientError::RequestCancelled);
        assert_eq!(second.wait().await.unwrap_err(), ClientError::RequestCancelled);

        // The stale owner cannot settle a cycle that no longer exists
        assert_eq!(owner.execute().await.unwrap_err(), ClientError::RequestCancelled);
        assert_eq!(coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_does_not_persist_tokens() {
        let storage = Arc::new(MemoryTokenStorage::with_tokens(Some("a1"), Some("r1")));
        let coordinator = coordinator_with(Arc::clone(&storage), "a2");

        let owner = owner_of(coordinator.start_or_join(ApiRequest::get("/a")));
        coordinator.cancel_all();

        let pair = TokenPair::new("a2", Some(RefreshToken::new("r2")));
        assert_eq!(
            owner.complete_success(pair).await.unwrap_err(),
            ClientError::RequestCancelled
        );
        assert_eq!(
            storage.get_access_token().await.unwrap().unwrap().expose(),
            "a1"
        );
        assert_eq!(
            storage.get_refresh_token().await.unwrap().unwrap().expose(),
            "r1"
        );
    }

    #[tokio::test]
    async fn test_detached_cycle_survives_dropped_caller() {
        let storage = Arc::new(MemoryTokenStorage::with_tokens(Some("a1"), Some("r1")));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let refresher_gate = Arc::clone(&gate);
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&storage) as SharedTokenStorage,
            refresher_fn(move |_| {
                let gate = Arc::clone(&refresher_gate);
                async move {
                    gate.acquire()
                        .await
                        .map_err(|_| ClientError::auth_refresh_failed("gate closed"))?
                        .forget();
                    Ok(TokenPair::new("a2", None))
                }
            }),
            CoordinatorSettings::default(),
        );

        let mut request = ApiRequest::get("/a");
        request.set_bearer("Bearer", &AccessToken::new("a1")).unwrap();
        let sent_with = request.authorization().map(str::to_string);
        let owner = owner_of(coordinator.start_or_join(request));
        let joiner = pending_of(coordinator.start_or_join(ApiRequest::get("/b")));

        // The owner's caller gives up before the refresher answers
        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), owner.run_detached(sent_with)).await;
        assert!(abandoned.is_err());
        assert!(coordinator.is_refreshing());

        gate.add_permits(1);
        let resumed = joiner.wait().await.unwrap();
        assert_eq!(resumed.authorization(), Some("Bearer a2"));
        assert_eq!(coordinator.phase(), Phase::Idle);
        assert_eq!(coordinator.refresh_count(), 1);
    }

    #[tokio::test]
    async fn test_detached_cycle_settles_with_rotated_token() {
        let storage = Arc::new(MemoryTokenStorage::with_tokens(Some("a2"), Some("r1")));
        let coordinator = coordinator_with(Arc::clone(&storage), "never");

        let mut request = ApiRequest::get("/a");
        request.set_bearer("Bearer", &AccessToken::new("a1")).unwrap();
        let sent_with = request.authorization().map(str::to_string);
        let owner = owner_of(coordinator.start_or_join(request));
        let joiner = pending_of(coordinator.start_or_join(ApiRequest::get("/b")));

        let token = owner.run_detached(sent_with).await.unwrap();
        assert_eq!(token.expose(), "a2");
        assert_eq!(
            joiner.wait().await.unwrap().authorization(),
            Some("Bearer a2")
        );
        assert_eq!(coordinator.refresh_count(), 0);
    }

    #[tokio::test]
    async fn test_detached_cycle_stops_on_cancellation() {
        let storage = Arc::new(MemoryTokenStorage::with_tokens(Some("a1"), Some("r1")));
        let token = CancellationToken::new();
        let coordinator = RefreshCoordinator::with_cancellation_token(
            storage,
            refresher_fn(|_| std::future::pending()),
            CoordinatorSettings::default(),
            token.clone(),
        );

        let owner = owner_of(coordinator.start_or_join(ApiRequest::get("/a")));
        let joiner = pending_of(coordinator.start_or_join(ApiRequest::get("/b")));
        let running = tokio::spawn(owner.run_detached(None));

        assert_eq!(coordinator.cancel_all(), 1);
        token.cancel();
        assert_eq!(running.await.unwrap().unwrap_err(), ClientError::RequestCancelled);
        assert_eq!(joiner.wait().await.unwrap_err(), ClientError::RequestCancelled);
        assert_eq!(coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_new_cycle_after_settle() {
        let storage = Arc::new(MemoryTokenStorage::with_tokens(Some("a1"), Some("r1")));
        let coordinator = coordinator_with(storage, "a2");

        let first = owner_of(coordinator.start_or_join(ApiRequest::get("/a")));
        let first_cycle = first.cycle();
        first.execute().await.unwrap();

        let second = owner_of(coordinator.start_or_join(ApiRequest::get("/a")));
        assert!(second.cycle() > first_cycle);
        second.execute().await.unwrap();
        assert_eq!(coordinator.refresh_count(), 2);
    }
}
