//! Cirrus API client
//!
//! [`ApiService`] exposes the remote storage operations as [`Call`]s on top
//! of the `cirrus-core` framework, talking the JSON method protocol over a
//! pooled reqwest transport.
//!
//! ```no_run
//! use cirrus_api::{AccessTokenAuthenticator, ApiService};
//! use std::sync::Arc;
//!
//! # fn main() -> cirrus_core::ApiResult<()> {
//! let service = ApiService::builder()
//!     .authenticator(Arc::new(AccessTokenAuthenticator::new("token")))
//!     .create()?;
//! let root = service.list_folder(0, false).execute()?;
//! for child in &root.children {
//!     println!("{}", child.name());
//! }
//! service.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! [`Call`]: cirrus_core::Call

pub mod auth;
pub mod builder;
pub mod cache;
pub mod http;
pub mod protocol;
pub mod service;
pub mod transfer;

pub use auth::{AccessTokenAuthenticator, BearerAuthenticator, TokenRefresher};
pub use builder::{Builder, ServiceConfig};
pub use cache::{CacheStats, ResponseCache};
pub use http::{map_reqwest_error, ConnectionPool, HttpClient, ReqwestTransport};
pub use service::{ApiService, UploadOptions};
