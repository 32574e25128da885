//! Credential provider seam

use async_trait::async_trait;

use crate::error::ApiResult;
use crate::transport::ApiRequest;

/// Supplies credentials for each request attempt.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Attach credentials to `request`. Called before every attempt.
    async fn authenticate(&self, request: &mut ApiRequest) -> ApiResult<()>;

    /// Called after the server rejected the credentials. Return `true` if
    /// they changed and the request is worth retrying once.
    async fn refresh(&self) -> ApiResult<bool> {
        Ok(false)
    }
}

/// Leaves requests untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthentication;

#[async_trait]
impl Authenticator for NoAuthentication {
    async fn authenticate(&self, _request: &mut ApiRequest) -> ApiResult<()> {
        Ok(())
    }
}
