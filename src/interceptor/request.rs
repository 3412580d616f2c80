//! Outgoing request interception

use crate::coordinator::{Enqueued, RefreshCoordinator};
use crate::error::{ClientError, Result};
use crate::types::ApiRequest;

/// Attaches credentials to every outgoing request.
///
/// While a refresh is in flight, requests are parked on it instead of being
/// sent with a token that is about to be replaced.
#[derive(Debug, Clone)]
pub struct RequestInterceptor {
    coordinator: RefreshCoordinator,
}

impl RequestInterceptor {
    /// Create an interceptor bound to `coordinator`
    #[must_use]
    pub fn new(coordinator: RefreshCoordinator) -> Self {
        Self { coordinator }
    }

    /// Prepare `request` for sending.
    ///
    /// - Idle: attach the stored access token if there is one. A missing token
    ///   is not an error here; the server decides.
    /// - Refreshing: suspend until the refresh settles, then return the
    ///   request carrying the fresh token.
    ///
    /// # Errors
    ///
    /// Storage read failures surface as `ClientError::Transport`; a failed or
    /// cancelled refresh surfaces as the error it settled with.
    pub async fn intercept(&self, request: ApiRequest) -> Result<ApiRequest> {
        if request.skip_auth {
            return Ok(request);
        }

        match self.coordinator.enqueue(request) {
            Enqueued::Waiting(pending) => pending.wait().await,
            Enqueued::Idle(mut request) => {
                let token = self
                    .coordinator
                    .storage()
                    .get_access_token()
                    .await
                    .map_err(ClientError::into_transport)?;

                if let Some(token) = token.filter(|t| !t.is_blank()) {
                    request.set_bearer(self.coordinator.token_type(), &token)?;
                    tracing::trace!(request_id = %request.id(), "Attached access token");
                } else {
                    tracing::trace!(request_id = %request.id(), "No access token stored; sending unauthenticated");
                }
                Ok(request)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryTokenStorage, TokenStorage, refresher_fn};
    use crate::coordinator::{CoordinatorSettings, RefreshHandle};
    use crate::types::{AccessToken, RefreshToken, TokenPair};
    use async_trait::async_trait;
    use std::sync::Arc;

    fn coordinator(storage: Arc<dyn TokenStorage>) -> RefreshCoordinator {
        RefreshCoordinator::new(
            storage,
            refresher_fn(|_| async { Ok(TokenPair::new("fresh", Some(RefreshToken::new("r2")))) }),
            CoordinatorSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_attaches_stored_token() {
        let storage = Arc::new(MemoryTokenStorage::with_tokens(Some("a1"), Some("r1")));
        let interceptor = RequestInterceptor::new(coordinator(storage));

        let request = interceptor.intercept(ApiRequest::get("/me")).await.unwrap();
        assert_eq!(request.authorization(), Some("Bearer a1"));
    }

    #[tokio::test]
    async fn test_no_token_forwards_unchanged() {
        let storage = Arc::new(MemoryTokenStorage::new());
        let interceptor = RequestInterceptor::new(coordinator(storage));

        let request = interceptor.intercept(ApiRequest::get("/public")).await.unwrap();
        assert!(request.authorization().is_none());
    }

    #[tokio::test]
    async fn test_skip_auth_bypasses_everything() {
        let storage = Arc::new(MemoryTokenStorage::with_tokens(Some("a1"), Some("r1")));
        let coordinator = coordinator(storage);
        let interceptor = RequestInterceptor::new(coordinator.clone());

        // Even mid-refresh, auth endpoints go straight through
        let RefreshHandle::Owner(owner, _) = coordinator.start_or_join(ApiRequest::get("/x"))
        else {
            panic!("expected owner");
        };
        let request = interceptor
            .intercept(ApiRequest::post("/login").without_auth())
            .await
            .unwrap();
        assert!(request.authorization().is_none());
        assert_eq!(coordinator.pending_len(), 0);
        owner.execute().await.unwrap();
    }

    #[tokio::test]
    async fn test_suspends_during_refresh_and_gets_fresh_token() {
        let storage = Arc::new(MemoryTokenStorage::with_tokens(Some("stale"), Some("r1")));
        let coordinator = coordinator(storage);
        let interceptor = RequestInterceptor::new(coordinator.clone());

        let RefreshHandle::Owner(owner, _) = coordinator.start_or_join(ApiRequest::get("/x"))
        else {
            panic!("expected owner");
        };

        let task = tokio::spawn(async move { interceptor.intercept(ApiRequest::get("/me")).await });
        while coordinator.pending_len() == 0 {
            tokio::task::yield_now().await;
        }

        owner.execute().await.unwrap();
        let request = task.await.unwrap().unwrap();
        assert_eq!(request.authorization(), Some("Bearer fresh"));
    }

    struct BrokenStorage;

    #[async_trait]
    impl TokenStorage for BrokenStorage {
        async fn get_access_token(&self) -> Result<Option<AccessToken>> {
            Err(ClientError::storage("keychain locked"))
        }
        async fn get_refresh_token(&self) -> Result<Option<RefreshToken>> {
            Ok(None)
        }
        async fn set_access_token(&self, _token: AccessToken) -> Result<()> {
            Ok(())
        }
        async fn set_refresh_token(&self, _token: RefreshToken) -> Result<()> {
            Ok(())
        }
        async fn clear_tokens(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_storage_failure_is_transport_error() {
        let coordinator = coordinator(Arc::new(BrokenStorage));
        let interceptor = RequestInterceptor::new(coordinator.clone());

        let err = interceptor.intercept(ApiRequest::get("/me")).await.unwrap_err();
        assert_eq!(
            err,
            ClientError::Transport("token storage: keychain locked".into())
        );
        assert!(!coordinator.is_refreshing());
    }
}
