//! Type definitions for the authenticated client
//!
//! Identifiers, credential types, request/response descriptors and options.

pub mod identifiers;
pub mod options;
pub mod request;
pub mod token;

pub use identifiers::{CycleId, RequestId};
pub use options::{
    ClientOptions, ClientOptionsBuilder, DEFAULT_REFRESH_TIMEOUT, DEFAULT_TIMEOUT,
    DEFAULT_TRIGGER_STATUSES, SessionExpiredCallback,
};
pub use request::{ApiRequest, ApiResponse};
pub use token::{AccessToken, RefreshToken, TokenPair};
