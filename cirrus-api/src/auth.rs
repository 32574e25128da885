//! Token authenticators

use async_trait::async_trait;
use cirrus_core::{ApiRequest, ApiResult, Authenticator};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Produces a replacement token after the server rejected the current one.
/// `None` means no new token is available.
pub type TokenRefresher = Arc<dyn Fn() -> BoxFuture<'static, ApiResult<Option<String>>> + Send + Sync>;

struct TokenStore {
    token: RwLock<String>,
    refresher: Option<TokenRefresher>,
}

impl TokenStore {
    fn new(token: String) -> Self {
        Self {
            token: RwLock::new(token),
            refresher: None,
        }
    }

    async fn get(&self) -> String {
        self.token.read().await.clone()
    }

    async fn set(&self, token: String) {
        *self.token.write().await = token;
    }

    async fn refresh(&self) -> ApiResult<bool> {
        let Some(refresher) = &self.refresher else {
            return Ok(false);
        };
        match refresher().await? {
            Some(token) => {
                tracing::debug!("access token refreshed");
                self.set(token).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Sends the token as the `access_token` query parameter.
pub struct AccessTokenAuthenticator {
    store: TokenStore,
}

impl AccessTokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            store: TokenStore::new(token.into()),
        }
    }

    pub fn with_refresher(mut self, refresher: TokenRefresher) -> Self {
        self.store.refresher = Some(refresher);
        self
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        self.store.set(token.into()).await;
    }
}

#[async_trait]
impl Authenticator for AccessTokenAuthenticator {
    async fn authenticate(&self, request: &mut ApiRequest) -> ApiResult<()> {
        request.query.retain(|(k, _)| k != "access_token");
        request
            .query
            .push(("access_token".to_string(), self.store.get().await));
        Ok(())
    }

    async fn refresh(&self) -> ApiResult<bool> {
        self.store.refresh().await
    }
}

/// Sends the token in an `Authorization: Bearer` header.
pub struct BearerAuthenticator {
    store: TokenStore,
}

impl BearerAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            store: TokenStore::new(token.into()),
        }
    }

    pub fn with_refresher(mut self, refresher: TokenRefresher) -> Self {
        self.store.refresher = Some(refresher);
        self
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        self.store.set(token.into()).await;
    }
}

#[async_trait]
impl Authenticator for BearerAuthenticator {
    async fn authenticate(&self, request: &mut ApiRequest) -> ApiResult<()> {
        request
            .headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case("authorization"));
        let value = format!("Bearer {}", self.store.get().await);
        request.headers.push(("Authorization".to_string(), value));
        Ok(())
    }

    async fn refresh(&self) -> ApiResult<bool> {
        self.store.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_access_token_replaces_previous() {
        let auth = AccessTokenAuthenticator::new("one");
        let mut req = ApiRequest::get("https://api.example.com/userinfo");
        auth.authenticate(&mut req).await.unwrap();
        auth.set_token("two").await;
        auth.authenticate(&mut req).await.unwrap();

        assert_eq!(req.query.len(), 1);
        assert_eq!(req.query_value("access_token"), Some("two"));
    }

    #[tokio::test]
    async fn test_bearer_header() {
        let auth = BearerAuthenticator::new("secret");
        let mut req = ApiRequest::get("https://api.example.com/userinfo");
        auth.authenticate(&mut req).await.unwrap();
        assert_eq!(req.header_value("authorization"), Some("Bearer secret"));
        assert!(!auth.refresh().await.unwrap());
    }

    #[tokio::test]
    async fn test_refresher_swaps_token() {
        let auth = AccessTokenAuthenticator::new("stale").with_refresher(Arc::new(|| {
            Box::pin(async { Ok(Some("fresh".to_string())) })
        }));
        assert!(auth.refresh().await.unwrap());

        let mut req = ApiRequest::get("https://api.example.com/userinfo");
        auth.authenticate(&mut req).await.unwrap();
        assert_eq!(req.query_value("access_token"), Some("fresh"));
    }
}
