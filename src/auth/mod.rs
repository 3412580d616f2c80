//! Credential collaborators
//!
//! The refresh machinery depends on two pluggable pieces:
//!
//! - [`TokenStorage`]: where access and refresh tokens live
//!   ([`MemoryTokenStorage`], [`FileTokenStorage`], or your own).
//! - [`TokenRefresher`]: how a refresh token becomes a new token pair
//!   ([`HttpTokenRefresher`], [`FnTokenRefresher`], or your own).
//!
//! # Example
//!
//! ```no_run
//! use auth_refresh_client::auth::{FileTokenStorage, HttpTokenRefresher};
//!
//! # fn example() -> auth_refresh_client::Result<()> {
//! let storage = FileTokenStorage::new();
//! let refresher = HttpTokenRefresher::builder("https://auth.example.com/oauth/token")
//!     .client_id("web-app")
//!     .build()?;
//! # let _ = (storage, refresher);
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - File storage writes with user-only permissions (600)
//! - Token values are redacted from `Debug` output

mod refresher;
mod storage;

pub use refresher::{
    FnTokenRefresher, HttpTokenRefresher, HttpTokenRefresherBuilder, RefreshEndpointConfig,
    SharedTokenRefresher, TokenRefresher, refresher_fn,
};
pub use storage::{
    FileTokenStorage, MemoryTokenStorage, SharedTokenStorage, TokenError, TokenStorage,
};
