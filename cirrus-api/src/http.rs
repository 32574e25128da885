//! HTTP transport on reqwest
//!
//! [`ConnectionPool`] hands out `reqwest::Client`s that share keep-alive
//! connections, [`ReqwestTransport`] adapts one of them to the
//! [`Transport`] seam, and [`HttpClient`] bundles the resources a service
//! can share with the services derived from it.

use async_trait::async_trait;
use cirrus_core::{
    ApiError, ApiRequest, ApiResponse, ApiResult, Dispatcher, HttpMethod, Transport,
    TransportErrorKind,
};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::ResponseCache;

/// Idle connections kept per host
pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 8;

/// How long an idle connection is kept
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Classify a reqwest failure.
pub fn map_reqwest_error(err: reqwest::Error) -> ApiError {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_decode() || err.is_builder() {
        TransportErrorKind::Protocol
    } else {
        TransportErrorKind::Io
    };
    ApiError::transport(kind, err.to_string())
}

/// Shared keep-alive connections
///
/// Clients are created per connect timeout, since reqwest fixes it when the
/// client is built. Services with equal connect timeouts share connections.
pub struct ConnectionPool {
    max_idle_per_host: usize,
    idle_timeout: Duration,
    clients: Mutex<HashMap<Option<Duration>, reqwest::Client>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_IDLE_PER_HOST, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_limits(max_idle_per_host: usize, idle_timeout: Duration) -> Self {
        Self {
            max_idle_per_host,
            idle_timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Client for the given connect timeout, built on first use.
    pub fn client(&self, connect_timeout: Option<Duration>) -> ApiResult<reqwest::Client> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&connect_timeout) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(self.max_idle_per_host)
            .pool_idle_timeout(self.idle_timeout);
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder.build().map_err(map_reqwest_error)?;
        tracing::debug!(?connect_timeout, "created pooled http client");
        clients.insert(connect_timeout, client.clone());
        Ok(client)
    }

    /// Forget all pooled clients. Connections close once in-flight requests
    /// holding them are done.
    pub fn evict_all(&self) {
        self.clients.lock().clear();
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_idle_per_host", &self.max_idle_per_host)
            .field("idle_timeout", &self.idle_timeout)
            .field("clients", &self.client_count())
            .finish()
    }
}

/// Resources shared between a service and the services derived from it
#[derive(Clone, Debug)]
pub struct HttpClient {
    pub pool: Arc<ConnectionPool>,
    pub dispatcher: Arc<Dispatcher>,
    pub cache: Option<Arc<ResponseCache>>,
}

/// [`Transport`] over a pooled `reqwest::Client`
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn from_pool(pool: &ConnectionPool, connect_timeout: Option<Duration>) -> ApiResult<Self> {
        Ok(Self::new(pool.client(connect_timeout)?))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: ApiRequest) -> ApiResult<ApiResponse> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        };

        let mut builder = self.client.request(method, &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.header(CONTENT_TYPE, body.content_type);
            if let Some(length) = body.length {
                builder = builder.header(CONTENT_LENGTH, length);
            }
            builder = builder.body(reqwest::Body::wrap_stream(body.stream));
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_reqwest_error));

        Ok(ApiResponse {
            status,
            headers,
            content_length,
            body: Box::pin(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::RequestBody;
    use httpmock::prelude::*;

    #[test]
    fn test_pool_reuses_clients_per_timeout() {
        let pool = ConnectionPool::new();
        pool.client(Some(Duration::from_secs(5))).unwrap();
        pool.client(Some(Duration::from_secs(5))).unwrap();
        pool.client(None).unwrap();
        assert_eq!(pool.client_count(), 2);

        pool.evict_all();
        assert_eq!(pool.client_count(), 0);
    }

    #[tokio::test]
    async fn test_get_with_query_and_headers() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/listfolder")
                .query_param("folderid", "0")
                .header("User-Agent", "cirrus-test");
            then.status(200)
                .header("Content-Type", "application/json")
                .body(r#"{"result":0}"#);
        });

        let transport = ReqwestTransport::from_pool(&ConnectionPool::new(), None).unwrap();
        let request = ApiRequest::get(server.url("/listfolder"))
            .query("folderid", 0)
            .header("User-Agent", "cirrus-test");
        let response = transport.send(request).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(&response.bytes().await.unwrap()[..], br#"{"result":0}"#);
        mock.assert();
    }

    #[tokio::test]
    async fn test_streams_request_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/uploadfile")
                .header("Content-Type", "application/octet-stream")
                .body("hello world");
            then.status(200).body(r#"{"result":0}"#);
        });

        let chunks = vec![
            Ok(bytes::Bytes::from_static(b"hello ")),
            Ok(bytes::Bytes::from_static(b"world")),
        ];
        let request = ApiRequest::post(server.url("/uploadfile")).body(RequestBody {
            stream: Box::pin(futures::stream::iter(chunks)),
            length: Some(11),
            content_type: "application/octet-stream".into(),
        });

        let transport = ReqwestTransport::from_pool(&ConnectionPool::new(), None).unwrap();
        let response = transport.send(request).await.unwrap();
        assert!(response.is_success());
        mock.assert();
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        let transport =
            ReqwestTransport::from_pool(&ConnectionPool::new(), Some(Duration::from_secs(2)))
                .unwrap();
        let err = transport
            .send(ApiRequest::get("http://127.0.0.1:1/userinfo"))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }
}
