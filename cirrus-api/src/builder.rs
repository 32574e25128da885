//! Service configuration and builder

use cirrus_core::{
    ApiError, ApiResult, Authenticator, Dispatcher, Executor, InlineExecutor, NoAuthentication,
    StateError, Transport, DEFAULT_PROGRESS_THRESHOLD,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::ResponseCache;
use crate::http::{ConnectionPool, HttpClient, ReqwestTransport};
use crate::protocol::DEFAULT_API_HOST;
use crate::service::ApiService;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

fn default_user_agent() -> String {
    format!("cirrus/{}", env!("CARGO_PKG_VERSION"))
}

/// A zero duration disables the corresponding timeout.
fn enabled(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

/// Immutable configuration of an [`ApiService`]
#[derive(Clone)]
pub struct ServiceConfig {
    pub(crate) cache: Option<Arc<ResponseCache>>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) callback_executor: Arc<dyn Executor>,
    pub(crate) progress_threshold: u64,
    pub(crate) api_host: String,
    pub(crate) user_agent: String,
}

impl ServiceConfig {
    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    pub fn connection_pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        enabled(self.connect_timeout)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        enabled(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        enabled(self.write_timeout)
    }

    pub fn progress_threshold(&self) -> u64 {
        self.progress_threshold
    }

    pub fn api_host(&self) -> &str {
        &self.api_host
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn http_client(&self) -> HttpClient {
        HttpClient {
            pool: self.pool.clone(),
            dispatcher: self.dispatcher.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("api_host", &self.api_host)
            .field("cache", &self.cache)
            .field("dispatcher", &self.dispatcher)
            .field("custom_transport", &self.transport.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("progress_threshold", &self.progress_threshold)
            .finish()
    }
}

/// Assembles an [`ApiService`]
///
/// Unset shared resources are created by [`create`](Builder::create): a new
/// connection pool, a new dispatcher and no cache. Builders returned by
/// [`ApiService::new_builder`] start from that service's configuration and
/// keep sharing its resources unless they are replaced here.
#[derive(Clone)]
pub struct Builder {
    cache: Option<Arc<ResponseCache>>,
    pool: Option<Arc<ConnectionPool>>,
    dispatcher: Option<Arc<Dispatcher>>,
    transport: Option<Arc<dyn Transport>>,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    authenticator: Arc<dyn Authenticator>,
    callback_executor: Arc<dyn Executor>,
    progress_threshold: u64,
    api_host: String,
    user_agent: String,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            cache: None,
            pool: None,
            dispatcher: None,
            transport: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            authenticator: Arc::new(NoAuthentication),
            callback_executor: Arc::new(InlineExecutor),
            progress_threshold: DEFAULT_PROGRESS_THRESHOLD,
            api_host: DEFAULT_API_HOST.to_string(),
            user_agent: default_user_agent(),
        }
    }

    pub(crate) fn from_config(config: &ServiceConfig) -> Self {
        Self {
            cache: config.cache.clone(),
            pool: Some(config.pool.clone()),
            dispatcher: Some(config.dispatcher.clone()),
            transport: config.transport.clone(),
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            authenticator: config.authenticator.clone(),
            callback_executor: config.callback_executor.clone(),
            progress_threshold: config.progress_threshold,
            api_host: config.api_host.clone(),
            user_agent: config.user_agent.clone(),
        }
    }

    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    pub fn connection_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Share pool, dispatcher and cache with another client in one go.
    pub fn with_client(mut self, client: HttpClient) -> Self {
        self.pool = Some(client.pool);
        self.dispatcher = Some(client.dispatcher);
        self.cache = client.cache;
        self
    }

    /// Send requests through `transport` instead of the pooled reqwest one.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn callback_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.callback_executor = executor;
        self
    }

    /// Minimum number of bytes between two progress notifications.
    pub fn progress_callback_threshold(mut self, bytes: u64) -> Self {
        self.progress_threshold = bytes;
        self
    }

    pub fn api_host(mut self, host: impl Into<String>) -> Self {
        self.api_host = host.into();
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Validate the options and build the service.
    pub fn create(self) -> ApiResult<ApiService> {
        if self.progress_threshold == 0 {
            return Err(ApiError::invalid_argument(
                "progress callback threshold must be greater than zero",
            ));
        }
        let api_host = self.api_host.trim_end_matches('/').to_string();
        if !(api_host.starts_with("https://") || api_host.starts_with("http://")) {
            return Err(ApiError::invalid_argument(format!(
                "api host must be an http(s) URL: {api_host:?}"
            )));
        }

        let dispatcher = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Dispatcher::new()?,
        };
        if dispatcher.is_shutdown() {
            return Err(StateError::Shutdown.into());
        }
        let pool = self.pool.unwrap_or_default();

        let transport: Arc<dyn Transport> = match &self.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(ReqwestTransport::from_pool(
                &pool,
                enabled(self.connect_timeout),
            )?),
        };

        let config = ServiceConfig {
            cache: self.cache,
            pool,
            dispatcher,
            transport: self.transport,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            authenticator: self.authenticator,
            callback_executor: self.callback_executor,
            progress_threshold: self.progress_threshold,
            api_host,
            user_agent: self.user_agent,
        };
        tracing::debug!(api_host = %config.api_host, "api service created");
        Ok(ApiService::from_parts(config, transport))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("api_host", &self.api_host)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("progress_threshold", &self.progress_threshold)
            .finish()
    }
}
