//! Request and response interceptors
//!
//! Every call made through [`AuthClient`](crate::AuthClient) passes through
//! both interceptors:
//!
//! ```text
//! caller ─▶ RequestInterceptor ─▶ transport ─▶ ResponseInterceptor ─▶ caller
//!             (attach token or       │             (refresh + replay
//!              wait on refresh)      │              on trigger status)
//!                                    ◀──────────── replay
//! ```

mod request;
mod response;

pub use request::RequestInterceptor;
pub use response::ResponseInterceptor;
