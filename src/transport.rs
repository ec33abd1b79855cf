// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote transport and credential traits.
//!
//! The replicator never touches sockets. It talks to the remote database
//! through [`Transport`], an async request/response abstraction returning
//! parsed JSON or [`ReplicationError::Http`] for non-success statuses.
//!
//! # Example
//!
//! ```rust,no_run
//! use doc_replicator::transport::{BoxFuture, Method, MultipartBody, Transport};
//! use serde_json::Value;
//!
//! struct MyClient { base: String }
//!
//! impl Transport for MyClient {
//!     fn remote_url(&self) -> &str {
//!         &self.base
//!     }
//!
//!     fn send_request(&self, _method: Method, _path: &str, _body: Option<Value>) -> BoxFuture<'_, Value> {
//!         Box::pin(async move { Ok(Value::Null) })
//!     }
//!
//!     fn send_multipart_request(&self, _method: Method, _path: &str, _body: MultipartBody) -> BoxFuture<'_, Value> {
//!         Box::pin(async move { Ok(Value::Null) })
//!     }
//! }
//! ```

use crate::error::{ReplicationError, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Streamed attachment bytes.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// HTTP verbs used by the replication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Put => write!(f, "PUT"),
            Method::Post => write!(f, "POST"),
        }
    }
}

/// One attachment part of a multipart upload.
pub struct AttachmentPart {
    pub name: String,
    pub content_type: Option<String>,
    pub length: Option<u64>,
    pub reader: BlobReader,
}

impl std::fmt::Debug for AttachmentPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentPart")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// A `multipart/related` document upload: the JSON body first, then one part
/// per attachment marked `"follows": true`, in the same order.
#[derive(Debug)]
pub struct MultipartBody {
    pub json: Map<String, Value>,
    pub attachments: Vec<AttachmentPart>,
}

/// Async request/response access to the remote database.
///
/// Paths are relative to [`remote_url`](Self::remote_url); `""` addresses the
/// database itself. Non-2xx responses must be returned as
/// [`ReplicationError::Http`] so callers can branch on the status.
pub trait Transport: Send + Sync + 'static {
    /// Base URL of the remote database.
    fn remote_url(&self) -> &str;

    /// Send a JSON request and return the parsed JSON response.
    fn send_request(&self, method: Method, path: &str, body: Option<Value>) -> BoxFuture<'_, Value>;

    /// Send a multipart request and return the parsed JSON response.
    fn send_multipart_request(&self, method: Method, path: &str, body: MultipartBody) -> BoxFuture<'_, Value>;
}

/// Opaque credential provider.
///
/// Only cookie-based login affects the replication protocol: the replicator
/// checks `/_session` and logs in if no user is attached.
pub trait Authorizer: Send + Sync + 'static {
    fn uses_cookie_based_login(&self) -> bool {
        false
    }

    /// Path to POST the login request to, e.g. `_session`.
    fn login_path(&self) -> Option<String> {
        None
    }

    fn login_parameters(&self) -> Option<Map<String, Value>> {
        None
    }
}

/// Name/password login against `_session`.
#[derive(Debug, Clone)]
pub struct SessionAuthorizer {
    pub username: String,
    pub password: String,
}

impl Authorizer for SessionAuthorizer {
    fn uses_cookie_based_login(&self) -> bool {
        true
    }

    fn login_path(&self) -> Option<String> {
        Some("_session".to_string())
    }

    fn login_parameters(&self) -> Option<Map<String, Value>> {
        let mut params = Map::new();
        params.insert("name".to_string(), Value::String(self.username.clone()));
        params.insert("password".to_string(), Value::String(self.password.clone()));
        Some(params)
    }
}

/// RFC 3986 unreserved characters pass through; everything else is escaped.
const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Percent-encode a document ID or query value for use in a request path.
pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, URL_COMPONENT).to_string()
}

/// Extract a JSON object from a response, or fail with a descriptive error.
pub fn expect_object(value: Value, what: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ReplicationError::Internal(format!(
            "{what}: expected JSON object, got {other}"
        ))),
    }
}
