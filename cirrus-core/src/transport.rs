//! Transport seam
//!
//! The framework hands fully described requests to a [`Transport`] and gets
//! back a status plus a streaming body. Connection reuse, TLS and the
//! actual wire live behind this trait.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;

use crate::error::ApiResult;

/// Byte stream type
pub type ByteStream = Pin<Box<dyn Stream<Item = ApiResult<Bytes>> + Send>>;

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

/// Streaming request payload
pub struct RequestBody {
    pub stream: ByteStream,
    pub length: Option<u64>,
    pub content_type: String,
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("length", &self.length)
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// Outgoing request
#[derive(Debug)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Last path segment of the URL, which is the API method name.
    pub fn endpoint(&self) -> &str {
        let path = self.url.split('?').next().unwrap_or_default();
        path.rsplit('/').next().unwrap_or_default()
    }

    /// Requests without a body can be sent again, e.g. after re-authenticating.
    pub fn try_clone(&self) -> Option<Self> {
        if self.body.is_some() {
            return None;
        }
        Some(Self {
            method: self.method,
            url: self.url.clone(),
            query: self.query.clone(),
            headers: self.headers.clone(),
            body: None,
        })
    }
}

/// Incoming response
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl ApiResponse {
    /// Response with an in-memory body.
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            headers: Vec::new(),
            content_length: Some(body.len() as u64),
            body: Box::pin(futures::stream::once(async move { Ok(body) })),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Buffer the whole body.
    pub async fn bytes(mut self) -> ApiResult<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}

impl fmt::Debug for ApiResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Executes requests. Implementations must be safe to share between threads.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> ApiResult<ApiResponse>;
}
